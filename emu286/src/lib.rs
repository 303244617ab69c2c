//! Core of an Intel 80286 machine emulator: the block-paged physical
//! bus, the protected-mode segmentation unit, and the CPU state they
//! share with an external execution engine.
//!
//! Everything here is synchronous and single-threaded; the only
//! reentrancy is a bus trap callback running inside a memory access, and
//! callbacks must not touch the bus.

pub mod bus;
pub mod cpu;
pub mod fault;
pub mod segmentation;

pub use bus::{BlockKind, Bus, BusConfig, BusError, KindMask, MemoryBlock, SharedBlock, TrapFn};
pub use cpu::{CpuState, Flags, Msw, RegisterFile, SegId};
pub use fault::{Fault, FaultKind, LoadResult, SegError};
pub use segmentation::{SegConfig, SegRole, SegmentRegister, Selector};
