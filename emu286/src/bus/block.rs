//! Fixed-size slices of the physical address space.
//!
//! Every block carries its own read and write handler. The handler is
//! either `Direct` (plain array access honoring the block kind) or
//! `Trapped` (the same access wrapped with an instrumentation callback).
//! Traps are installed and removed by the bus, never by the block's
//! clients.

use std::rc::Rc;

use bitflags::bitflags;

/// Instrumentation callback: `(address, value, annotation)`.
///
/// The annotation is whatever the access carried (typically the program
/// counter of the instruction performing it). Callbacks must not re-enter
/// the bus; they run while the block is borrowed.
pub type TrapFn = Rc<dyn Fn(u32, u16, Option<u32>)>;

/// "Same callback" means same `Rc` allocation. The comparison deliberately
/// drops the vtable half of the fat pointer; duplicate vtables across
/// codegen units would otherwise make identical callbacks compare unequal.
pub(super) fn same_trap(a: &TrapFn, b: &TrapFn) -> bool {
    Rc::as_ptr(a) as *const () == Rc::as_ptr(b) as *const ()
}

/// What backs a block and how writes behave.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockKind {
    /// Unpopulated space. Reads the sentinel, drops writes.
    None,
    Ram,
    /// Preserves its initial values; CPU writes are dropped.
    Rom,
    /// RAM with a consumer that polls the dirty flag.
    Video,
}

bitflags! {
    /// Selection mask for [`Bus::enum_blocks`](super::Bus::enum_blocks).
    pub struct KindMask: u8 {
        const RAM = 1 << 0;
        const ROM = 1 << 1;
        const VIDEO = 1 << 2;
    }
}

impl BlockKind {
    pub fn mask(self) -> KindMask {
        match self {
            BlockKind::None => KindMask::empty(),
            BlockKind::Ram => KindMask::RAM,
            BlockKind::Rom => KindMask::ROM,
            BlockKind::Video => KindMask::VIDEO,
        }
    }
}

enum Handler {
    Direct,
    Trapped { trap: TrapFn, refs: u32 },
}

pub struct MemoryBlock {
    addr: u32,
    size: u32,
    kind: BlockKind,
    dirty: bool,
    sentinel: u16,
    data: Vec<u8>,
    read_handler: Handler,
    write_handler: Handler,
}

impl MemoryBlock {
    /// A zero-filled block. `None` blocks carry no storage.
    pub fn new(addr: u32, size: u32, kind: BlockKind, data_width: u32) -> Self {
        let data = match kind {
            BlockKind::None => Vec::new(),
            _ => vec![0; size as usize],
        };

        Self {
            addr,
            size,
            kind,
            dirty: false,
            sentinel: ((1u32 << data_width) - 1) as u16,
            data,
            read_handler: Handler::Direct,
            write_handler: Handler::Direct,
        }
    }

    pub fn addr(&self) -> u32 {
        self.addr
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn kind(&self) -> BlockKind {
        self.kind
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn set_clean(&mut self) {
        self.dirty = false;
    }

    /// Read through the installed handler. The trap, if any, fires AFTER
    /// the value has been obtained so the callback observes what the
    /// caller will see.
    pub fn read(&self, offset: u32, pc: Option<u32>) -> u16 {
        let value = self.peek(offset);
        if let Handler::Trapped { trap, .. } = &self.read_handler {
            trap(self.addr + offset, value, pc);
        }
        value
    }

    /// Write through the installed handler. The trap, if any, fires BEFORE
    /// the store so the callback observes the pre-write contents.
    pub fn write(&mut self, offset: u32, value: u16, pc: Option<u32>) {
        if let Handler::Trapped { trap, .. } = &self.write_handler {
            trap(self.addr + offset, value, pc);
        }
        match self.kind {
            BlockKind::Ram | BlockKind::Video => {
                self.data[offset as usize] = value as u8;
                self.dirty = true;
            }
            // ROM and NONE drop CPU writes silently.
            BlockKind::Rom | BlockKind::None => {}
        }
    }

    /// Direct storage access, bypassing traps. Debugger-grade accessor.
    pub fn peek(&self, offset: u32) -> u16 {
        match self.kind {
            BlockKind::None => self.sentinel,
            _ => self.data[offset as usize] as u16,
        }
    }

    /// Direct store, bypassing traps and dirty tracking. Writes the
    /// backing array even on ROM (how images get loaded); NONE has no
    /// storage and ignores the poke.
    pub fn poke(&mut self, offset: u32, value: u16) {
        if self.kind != BlockKind::None {
            self.data[offset as usize] = value as u8;
        }
    }

    /// Bulk-load initial values (ROM images, donor slices).
    pub fn fill(&mut self, offset: u32, values: &[u8]) {
        if self.kind == BlockKind::None {
            return;
        }
        let offset = offset as usize;
        self.data[offset..offset + values.len()].copy_from_slice(values);
    }

    pub fn contents(&self) -> &[u8] {
        &self.data
    }

    pub(super) fn force_dirty(&mut self, dirty: bool) {
        self.dirty = dirty;
    }

    pub(super) fn install_read_trap(&mut self, trap: &TrapFn) -> bool {
        install(&mut self.read_handler, trap)
    }

    pub(super) fn install_write_trap(&mut self, trap: &TrapFn) -> bool {
        install(&mut self.write_handler, trap)
    }

    pub(super) fn remove_read_trap(&mut self, trap: &TrapFn) -> bool {
        remove(&mut self.read_handler, trap)
    }

    pub(super) fn remove_write_trap(&mut self, trap: &TrapFn) -> bool {
        remove(&mut self.write_handler, trap)
    }

    /// Whether reads currently go through a trap wrapper. The identity
    /// check for trap transparency: after a full untrap this is false and
    /// access is plain array indexing again.
    pub fn is_read_trapped(&self) -> bool {
        matches!(self.read_handler, Handler::Trapped { .. })
    }

    pub fn is_write_trapped(&self) -> bool {
        matches!(self.write_handler, Handler::Trapped { .. })
    }
}

fn install(handler: &mut Handler, trap: &TrapFn) -> bool {
    match handler {
        Handler::Direct => {
            *handler = Handler::Trapped {
                trap: Rc::clone(trap),
                refs: 1,
            };
            true
        }
        Handler::Trapped { trap: installed, refs } => {
            // Stacking is only permitted for the identical callback; a
            // second distinct callback on the same block is rejected.
            if same_trap(installed, trap) {
                *refs += 1;
                true
            } else {
                false
            }
        }
    }
}

fn remove(handler: &mut Handler, trap: &TrapFn) -> bool {
    match handler {
        Handler::Direct => false,
        Handler::Trapped { trap: installed, refs } => {
            if !same_trap(installed, trap) {
                return false;
            }
            *refs -= 1;
            if *refs == 0 {
                *handler = Handler::Direct;
            }
            true
        }
    }
}
