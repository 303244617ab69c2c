//! The physical address bus.
//!
//! The bus owns an array of equally sized memory blocks covering
//! `2^addr_width` bytes and routes every access by shift-masking the
//! address into a block index. Unpopulated space is padded with one shared
//! NONE block. Instrumentation (watchpoints, history capture) layers onto
//! a block through [`Bus::trap_read`]/[`Bus::trap_write`] without costing
//! anything while no trap is installed.

use std::cell::RefCell;
use std::rc::Rc;

use snafu::Snafu;

mod block;

pub use block::{BlockKind, KindMask, MemoryBlock, TrapFn};

pub type SharedBlock = Rc<RefCell<MemoryBlock>>;

/// Bring-up failures. These surface during machine configuration only;
/// nothing retries them at runtime.
#[derive(Debug, Snafu)]
pub enum BusError {
    #[snafu(display(
        "region {:#x}+{:#x} overlaps an occupied block at {:#x}",
        addr,
        size,
        found
    ))]
    RegionOccupied { addr: u32, size: u32, found: u32 },

    #[snafu(display("region {:#x}+{:#x} exceeds the {}-bit address space", addr, size, width))]
    RegionOutOfRange { addr: u32, size: u32, width: u32 },

    #[snafu(display("block size {:#x} is not a power of two", size))]
    BadBlockSize { size: u32 },
}

#[derive(Debug, Clone, Copy)]
pub struct BusConfig {
    pub addr_width: u32,
    pub data_width: u32,
    pub block_size: u32,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            addr_width: 16,
            data_width: 8,
            block_size: 1024,
        }
    }
}

/// Snapshot of the writable block contents, enough to resume a machine
/// without replaying its history.
#[derive(Debug, Clone)]
pub struct BusState {
    blocks: Vec<(u32, BlockKind, bool, Vec<u8>)>,
}

pub struct Bus {
    addr_width: u32,
    data_width: u32,
    data_mask: u16,
    addr_limit: u32,
    block_size: u32,
    block_shift: u32,
    block_limit: u32,
    block_total: u32,
    blocks: Vec<SharedBlock>,
}

impl Bus {
    pub fn new(cfg: BusConfig) -> Result<Self, BusError> {
        if !cfg.block_size.is_power_of_two() {
            return Err(BusError::BadBlockSize {
                size: cfg.block_size,
            });
        }

        let addr_total = 1u64 << cfg.addr_width;
        let block_total = (addr_total / cfg.block_size as u64) as u32;
        let block_shift = cfg.block_size.trailing_zeros();

        log::trace!(
            "bus: {} bit addresses, {} blocks of {:#x} bytes",
            cfg.addr_width,
            block_total,
            cfg.block_size
        );

        // One NONE block pads every unoccupied index.
        let none = Rc::new(RefCell::new(MemoryBlock::new(
            0,
            cfg.block_size,
            BlockKind::None,
            cfg.data_width,
        )));

        Ok(Self {
            addr_width: cfg.addr_width,
            data_width: cfg.data_width,
            data_mask: ((1u32 << cfg.data_width) - 1) as u16,
            addr_limit: (addr_total - 1) as u32,
            block_size: cfg.block_size,
            block_shift,
            block_limit: cfg.block_size - 1,
            block_total,
            blocks: (0..block_total).map(|_| Rc::clone(&none)).collect(),
        })
    }

    pub fn addr_width(&self) -> u32 {
        self.addr_width
    }

    pub fn addr_limit(&self) -> u32 {
        self.addr_limit
    }

    pub fn data_width(&self) -> u32 {
        self.data_width
    }

    pub fn data_mask(&self) -> u16 {
        self.data_mask
    }

    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    fn index_of(&self, addr: u32) -> usize {
        (((addr & self.addr_limit) >> self.block_shift) as usize).min(self.blocks.len() - 1)
    }

    pub fn block_at(&self, addr: u32) -> &SharedBlock {
        &self.blocks[self.index_of(addr)]
    }

    /// Installs blocks over `[addr, addr + size)`.
    ///
    /// Fails without mutating anything if a covered index already holds a
    /// non-NONE block. Without a donor, fresh zeroed blocks are allocated.
    /// A donor whose size equals the bus block size is installed directly
    /// (shared installation: the same block may back several indices). A
    /// donor of any other size acts as a value source: fresh blocks are
    /// materialized copying the donor slice that lands on each index.
    pub fn add_blocks(
        &mut self,
        addr: u32,
        size: u32,
        kind: BlockKind,
        donor: Option<&SharedBlock>,
    ) -> Result<(), BusError> {
        if size == 0 {
            return Ok(());
        }
        let end = addr as u64 + size as u64;
        if addr as u64 > self.addr_limit as u64 + 1 || end > self.addr_limit as u64 + 1 {
            return Err(BusError::RegionOutOfRange {
                addr,
                size,
                width: self.addr_width,
            });
        }

        let first = (addr >> self.block_shift) as usize;
        let last = ((end - 1) as u32 >> self.block_shift) as usize;

        // Conflict scan before any mutation.
        for i in first..=last {
            if self.blocks[i].borrow().kind() != BlockKind::None {
                return Err(BusError::RegionOccupied {
                    addr,
                    size,
                    found: (i as u32) << self.block_shift,
                });
            }
        }

        for i in first..=last {
            let base = (i as u32) << self.block_shift;

            let block = match donor {
                Some(d) if d.borrow().size() == self.block_size => Rc::clone(d),
                Some(d) => {
                    // Mismatched donor: materialize a full block, copying
                    // the donor values that fall inside this index. The
                    // donor wraps when smaller than the region.
                    let mut fresh =
                        MemoryBlock::new(base, self.block_size, kind, self.data_width);
                    let d = d.borrow();
                    let dsize = d.size() as u64;
                    for off in 0..self.block_size {
                        let linear = base as u64 + off as u64;
                        if linear >= addr as u64 && linear < end {
                            let doff = ((linear - addr as u64) % dsize) as u32;
                            fresh.poke(off, d.peek(doff));
                        }
                    }
                    Rc::new(RefCell::new(fresh))
                }
                None => Rc::new(RefCell::new(MemoryBlock::new(
                    base,
                    self.block_size,
                    kind,
                    self.data_width,
                ))),
            };

            self.blocks[i] = block;
        }

        log::debug!(
            "bus: mapped {:?} at {:#07x}+{:#x} ({} block(s))",
            kind,
            addr,
            size,
            last - first + 1
        );
        Ok(())
    }

    /// One bus-width read. `pc` is an opaque annotation handed to any
    /// trap callback on the containing block (conventionally the program
    /// counter of the access).
    pub fn read_data(&self, addr: u32, pc: Option<u32>) -> u16 {
        let a = addr & self.addr_limit;
        self.blocks[(a >> self.block_shift) as usize]
            .borrow()
            .read(a & self.block_limit, pc)
            & self.data_mask
    }

    /// One bus-width write.
    pub fn write_data(&self, addr: u32, value: u16, pc: Option<u32>) {
        let a = addr & self.addr_limit;
        self.blocks[(a >> self.block_shift) as usize]
            .borrow_mut()
            .write(a & self.block_limit, value & self.data_mask, pc);
    }

    /// Quiet read: no traps fire, no annotations. Debugger-grade.
    pub fn peek(&self, addr: u32) -> u16 {
        let a = addr & self.addr_limit;
        self.blocks[(a >> self.block_shift) as usize]
            .borrow()
            .peek(a & self.block_limit)
            & self.data_mask
    }

    /// Quiet write: no traps, no dirty tracking, stores even into ROM.
    pub fn poke(&self, addr: u32, value: u16) {
        let a = addr & self.addr_limit;
        self.blocks[(a >> self.block_shift) as usize]
            .borrow_mut()
            .poke(a & self.block_limit, value & self.data_mask);
    }

    /// Walks the blocks covering `[addr, addr + size)`, reporting whether
    /// all of them were clean, and unconditionally clearing the dirty
    /// flags as it goes.
    pub fn clean_blocks(&self, addr: u32, size: u32) -> bool {
        if size == 0 {
            return true;
        }
        let first = self.index_of(addr);
        let last = self.index_of(addr + size - 1);

        let mut all_clean = true;
        for i in first..=last {
            let mut b = self.blocks[i].borrow_mut();
            if b.is_dirty() {
                all_clean = false;
                b.set_clean();
            }
        }
        all_clean
    }

    /// Invokes `f` once per block whose kind intersects `mask`. NONE
    /// blocks never match. A block shared across adjacent indices is
    /// visited once.
    pub fn enum_blocks(&self, mask: KindMask, mut f: impl FnMut(&SharedBlock)) -> u32 {
        let mut count = 0;
        let mut prev: Option<*const RefCell<MemoryBlock>> = None;
        for shared in &self.blocks {
            let ptr = Rc::as_ptr(shared);
            if prev == Some(ptr) {
                continue;
            }
            prev = Some(ptr);
            if shared.borrow().kind().mask().intersects(mask) {
                f(shared);
                count += 1;
            }
        }
        count
    }

    /// Installs a read trap on the block containing `addr`.
    ///
    /// The trap covers every address mapping into that block; exact-match
    /// filtering is the caller's job. Installing the identical callback
    /// again bumps a reference count; a different callback is rejected.
    /// Unpopulated space cannot be trapped (the shared padding block
    /// would fire across every hole in the map).
    pub fn trap_read(&mut self, addr: u32, trap: &TrapFn) -> bool {
        let shared = Rc::clone(self.block_at(addr));
        let mut b = shared.borrow_mut();
        if b.kind() == BlockKind::None {
            return false;
        }
        let ok = b.install_read_trap(trap);
        if ok {
            log::trace!("bus: read trap at {:#07x}", addr);
        }
        ok
    }

    pub fn trap_write(&mut self, addr: u32, trap: &TrapFn) -> bool {
        let shared = Rc::clone(self.block_at(addr));
        let mut b = shared.borrow_mut();
        if b.kind() == BlockKind::None {
            return false;
        }
        let ok = b.install_write_trap(trap);
        if ok {
            log::trace!("bus: write trap at {:#07x}", addr);
        }
        ok
    }

    /// Drops one reference to the trap on the containing block, restoring
    /// plain access when the count reaches zero. False when no matching
    /// trap is installed.
    pub fn untrap_read(&mut self, addr: u32, trap: &TrapFn) -> bool {
        self.block_at(addr).borrow_mut().remove_read_trap(trap)
    }

    pub fn untrap_write(&mut self, addr: u32, trap: &TrapFn) -> bool {
        self.block_at(addr).borrow_mut().remove_write_trap(trap)
    }

    pub fn save(&self) -> BusState {
        let mut blocks = Vec::new();
        self.enum_blocks(KindMask::RAM | KindMask::VIDEO, |shared| {
            let b = shared.borrow();
            blocks.push((b.addr(), b.kind(), b.is_dirty(), b.contents().to_vec()));
        });
        BusState { blocks }
    }

    pub fn restore(&self, state: &BusState) {
        for (addr, kind, dirty, data) in &state.blocks {
            let shared = self.block_at(*addr);
            let mut b = shared.borrow_mut();
            if b.kind() != *kind || b.size() as usize != data.len() {
                log::warn!("bus: snapshot block at {:#07x} no longer matches, skipped", addr);
                continue;
            }
            b.fill(0, data);
            b.force_dirty(*dirty);
        }
    }

    pub fn block_total(&self) -> u32 {
        self.block_total
    }
}
