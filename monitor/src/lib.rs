//! Interactive machine debugger for the emulator core: an expression
//! evaluator, a breakpoint/history manager driving the bus trap API, and
//! a command processor in the classic monitor style.

pub mod breakpoint;
pub mod clock;
pub mod command;
pub mod disasm;
pub mod eval;

use emu286::{Bus, BusConfig, BusError, CpuState};

pub use breakpoint::{BreakSlot, Breakpoints};
pub use clock::{Clock, SharedClock, SystemClock};
pub use command::{Debugger, DebuggerConfig, DebuggerState};
pub use eval::{EvalError, Evaluator, GroupStyle};

/// The pieces of machine state the debugger operates on: CPU state, the
/// memory bus, and the separate I/O port bus.
pub struct Machine {
    pub cpu: CpuState,
    pub bus: Bus,
    pub ports: Bus,
}

impl Machine {
    pub fn new(cfg: BusConfig) -> Result<Self, BusError> {
        Ok(Self {
            cpu: CpuState::new(),
            bus: Bus::new(cfg)?,
            ports: Bus::new(BusConfig {
                addr_width: 16,
                data_width: 8,
                block_size: 1024,
            })?,
        })
    }
}
