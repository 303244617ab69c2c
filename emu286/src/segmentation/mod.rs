//! The segmentation unit.
//!
//! Each architectural segment register keeps a descriptor cache: the
//! base, limit and access rights captured at load time and consulted on
//! every access without re-reading the descriptor tables. Loads dispatch
//! on the current operating mode, checks dispatch on the cached rights;
//! both are modeled as small tagged enums rebound by `update_mode` rather
//! than swappable function slots.
//!
//! See the 80286 Programmer's Reference, chapters 6-8.

use tinyvec::ArrayVec;

use crate::bus::Bus;
use crate::cpu::{CpuState, SegId};
use crate::fault::{Fault, LoadResult, SegError};

pub mod descriptor;
mod gates;
pub mod tss;

pub use descriptor::{Descriptor, Selector};

use descriptor::{ACCESSED_BIT, ACC_BYTE_OFFSET};

/// Marks a descriptor cache that was not loaded from memory.
pub const ADDR_INVALID: u32 = u32::MAX;

/// What kind of segment a register holds; decides which checks a
/// protected-mode load applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegRole {
    Code,
    Data,
    Stack,
    Tss,
    Ldt,
    Other,
}

/// How `load` behaves right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadKind {
    Real,
    Prot,
}

/// How `check_read`/`check_write` behave right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckKind {
    /// Real mode: no bounds enforcement beyond the 16-bit offset.
    Real,
    /// Protected mode, normal segment: `[0, off_max)` is valid.
    Prot,
    /// Protected mode, expand-down data: valid offsets lie ABOVE the
    /// limit, letting a stack grow downward against a floor.
    ProtDown,
    /// Null or unreadable/unwritable segment: every access faults.
    Disallowed,
}

#[derive(Debug, Clone, Copy)]
pub struct SegConfig {
    pub role: SegRole,
    pub name: &'static str,
    pub prot: bool,
}

impl SegConfig {
    pub fn new(role: SegRole, name: &'static str) -> Self {
        Self {
            role,
            name,
            prot: false,
        }
    }
}

/// Descriptor-cache snapshot; enough to resume without requerying
/// descriptor memory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentState {
    pub sel: u16,
    pub base: u32,
    pub limit: u32,
    pub acc: u16,
    pub typ: u16,
    pub ext: u16,
    pub addr_desc: u32,
    pub cpl: u8,
    pub dpl: u8,
    pub off_max: u32,
    pub data_size: u32,
    pub data_mask: u32,
    pub addr_size: u32,
    pub addr_mask: u32,
}

pub struct SegmentRegister {
    name: &'static str,
    role: SegRole,
    sel: u16,
    base: u32,
    limit: u32,
    off_max: u32,
    acc: u16,
    typ: u16,
    ext: u16,
    addr_desc: u32,
    cpl: u8,
    dpl: u8,
    exp_down: bool,
    data_size: u32,
    addr_size: u32,
    data_mask: u32,
    addr_mask: u32,
    load_kind: LoadKind,
    check_read_kind: CheckKind,
    check_write_kind: CheckKind,

    /// Call-gate parameter copy buffer; only the CS register uses it,
    /// and only within a single gated load.
    pub aw_parms: ArrayVec<[u16; 32]>,
    f_call: Option<bool>,
    f_stack_switch: bool,
}

impl SegmentRegister {
    pub fn new(cfg: SegConfig) -> Self {
        let mut seg = Self {
            name: cfg.name,
            role: cfg.role,
            sel: 0,
            base: 0,
            limit: 0xFFFF,
            off_max: 0x1_0000,
            acc: 0,
            typ: 0,
            ext: 0,
            addr_desc: ADDR_INVALID,
            cpl: 0,
            dpl: 0,
            exp_down: false,
            data_size: 2,
            addr_size: 2,
            data_mask: 0xFFFF,
            addr_mask: 0xFFFF,
            load_kind: LoadKind::Real,
            check_read_kind: CheckKind::Real,
            check_write_kind: CheckKind::Real,
            aw_parms: ArrayVec::new(),
            f_call: None,
            f_stack_switch: false,
        };
        seg.update_mode(false, cfg.prot);
        seg
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn role(&self) -> SegRole {
        self.role
    }

    pub fn sel(&self) -> u16 {
        self.sel
    }

    pub fn base(&self) -> u32 {
        self.base
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }

    pub fn off_max(&self) -> u32 {
        self.off_max
    }

    pub fn acc(&self) -> u16 {
        self.acc
    }

    /// The 4-bit descriptor type captured at load time.
    pub fn typ(&self) -> u16 {
        self.typ
    }

    pub fn addr_desc(&self) -> u32 {
        self.addr_desc
    }

    pub fn cpl(&self) -> u8 {
        self.cpl
    }

    pub fn dpl(&self) -> u8 {
        self.dpl
    }

    pub fn is_expand_down(&self) -> bool {
        self.exp_down
    }

    pub fn data_size(&self) -> u32 {
        self.data_size
    }

    pub fn addr_size(&self) -> u32 {
        self.addr_size
    }

    pub fn load_kind(&self) -> LoadKind {
        self.load_kind
    }

    pub fn check_read_kind(&self) -> CheckKind {
        self.check_read_kind
    }

    pub fn check_write_kind(&self) -> CheckKind {
        self.check_write_kind
    }

    /// Real-mode load: the selector is a paragraph number. Every other
    /// cached attribute is left untouched.
    pub fn set_real(&mut self, sel: u16) {
        self.sel = sel;
        self.base = (sel as u32) << 4;
        self.addr_desc = ADDR_INVALID;
    }

    /// Forces a base independent of the selector (LOADALL-style tricks
    /// and machine bring-up). Truncated to the 24-bit physical space.
    pub fn set_base(&mut self, addr: u32) {
        self.base = addr & 0x00FF_FFFF;
    }

    pub fn set_limit(&mut self, limit: u32) {
        self.limit = limit;
        self.off_max = limit.wrapping_add(1);
    }

    /// Arms the control-transfer state for the next CS load: `Some(true)`
    /// for CALLF/INT, `Some(false)` for RETF/IRET, `None` for everything
    /// else. Consumed by the load.
    pub fn set_call(&mut self, f_call: Option<bool>) {
        self.f_call = f_call;
    }

    pub(crate) fn take_call(&mut self) -> Option<bool> {
        self.f_call.take()
    }

    /// Whether the last gated transfer switched stacks.
    pub fn stack_switched(&self) -> bool {
        self.f_stack_switch
    }

    pub(crate) fn set_stack_switch(&mut self, on: bool) {
        self.f_stack_switch = on;
    }

    /// Validates `[offset, offset + count)` for reading and returns the
    /// linear address. Protected-mode violations are `#GP(0)` unless
    /// `suppress` asks for a quiet probe.
    pub fn check_read(&self, offset: u16, count: u32, suppress: bool) -> LoadResult {
        self.check(self.check_read_kind, offset, count, suppress)
    }

    pub fn check_write(&self, offset: u16, count: u32, suppress: bool) -> LoadResult {
        self.check(self.check_write_kind, offset, count, suppress)
    }

    fn check(&self, kind: CheckKind, offset: u16, count: u32, suppress: bool) -> LoadResult {
        let off = offset as u32;
        match kind {
            CheckKind::Real => Ok(self.base.wrapping_add(off)),
            CheckKind::Prot => {
                if off + count <= self.off_max {
                    Ok(self.base + off)
                } else {
                    Err(seg_fault(Fault::gp(0), suppress))
                }
            }
            CheckKind::ProtDown => {
                // Expand-down: the valid range is (limit, addr_mask].
                if off > self.limit && off + count - 1 <= self.addr_mask {
                    Ok(self.base + off)
                } else {
                    Err(seg_fault(Fault::gp(0), suppress))
                }
            }
            CheckKind::Disallowed => Err(seg_fault(Fault::gp(0), suppress)),
        }
    }

    /// Rebinds the load/check dispatch to the current mode and, in
    /// protected mode, to the cached access rights. With `just_loaded`
    /// the privilege fields are recomputed from the fresh selector and
    /// descriptor.
    pub fn update_mode(&mut self, just_loaded: bool, prot: bool) {
        if !prot {
            self.load_kind = LoadKind::Real;
            self.check_read_kind = CheckKind::Real;
            self.check_write_kind = CheckKind::Real;
            self.cpl = 0;
            self.dpl = 0;
            self.exp_down = false;
            return;
        }

        self.load_kind = LoadKind::Prot;

        let acc = descriptor::AccessWord(self.acc);
        let null = self.sel & 0xFFFC == 0;
        let system = acc.segment() == 0;
        let code = !system && acc.type_bits() & descriptor::TYPE_CODE != 0;
        let rw = acc.type_bits() & descriptor::TYPE_WRITE_READ != 0;

        self.exp_down = !system && !code && acc.type_bits() & descriptor::TYPE_EXPDOWN_CONF != 0;

        let readable = !system && (!code || rw);
        let writable = !system && !code && rw;

        self.check_read_kind = if null || !readable {
            CheckKind::Disallowed
        } else if self.exp_down {
            CheckKind::ProtDown
        } else {
            CheckKind::Prot
        };
        self.check_write_kind = if null || !writable {
            CheckKind::Disallowed
        } else if self.exp_down {
            CheckKind::ProtDown
        } else {
            CheckKind::Prot
        };

        if just_loaded {
            self.cpl = (self.sel & 3) as u8;
            self.dpl = acc.dpl() as u8;
            // 80286: 16-bit operands and addresses. The BIG bit of larger
            // models would widen these to 4.
            self.data_size = 2;
            self.addr_size = 2;
            self.data_mask = 0xFFFF;
            self.addr_mask = 0xFFFF;
        }
    }

    /// Installs a freshly fetched descriptor into the cache.
    pub(crate) fn commit_descriptor(
        &mut self,
        sel: u16,
        desc: &Descriptor,
        addr_desc: u32,
        prot: bool,
    ) {
        self.sel = sel;
        self.base = desc.base();
        self.limit = desc.limit() as u32;
        self.off_max = self.limit + 1;
        self.acc = desc.acc_word();
        self.typ = desc.system_type();
        self.ext = desc.ext;
        self.addr_desc = addr_desc;
        self.update_mode(true, prot);

        log::trace!(
            "{}: loaded {:#06x} base={:#08x} limit={:#06x} dpl={}",
            self.name,
            sel,
            self.base,
            self.limit,
            self.dpl
        );
    }

    /// Installs a null cache: the load succeeds, any subsequent access
    /// faults.
    pub(crate) fn load_null(&mut self, sel: u16) {
        self.sel = sel;
        self.base = 0;
        self.limit = 0;
        self.off_max = 0;
        self.acc = 0;
        self.typ = 0;
        self.ext = 0;
        self.addr_desc = ADDR_INVALID;
        self.update_mode(true, true);
    }

    /// Rewrites the cached system type (task switches flip TSS busy
    /// state without refetching the descriptor).
    pub(crate) fn set_system_type(&mut self, typ: u16) {
        self.typ = typ;
        self.acc = (self.acc & !0x0F00) | typ << 8;
    }

    pub fn save(&self) -> SegmentState {
        SegmentState {
            sel: self.sel,
            base: self.base,
            limit: self.limit,
            acc: self.acc,
            typ: self.typ,
            ext: self.ext,
            addr_desc: self.addr_desc,
            cpl: self.cpl,
            dpl: self.dpl,
            off_max: self.off_max,
            data_size: self.data_size,
            data_mask: self.data_mask,
            addr_size: self.addr_size,
            addr_mask: self.addr_mask,
        }
    }

    pub fn restore(&mut self, state: &SegmentState, prot: bool) {
        self.sel = state.sel;
        self.base = state.base;
        self.limit = state.limit;
        self.acc = state.acc;
        self.typ = state.typ;
        self.ext = state.ext;
        self.addr_desc = state.addr_desc;
        self.cpl = state.cpl;
        self.dpl = state.dpl;
        self.off_max = state.off_max;
        self.data_size = state.data_size;
        self.data_mask = state.data_mask;
        self.addr_size = state.addr_size;
        self.addr_mask = state.addr_mask;
        self.update_mode(false, prot);
    }
}

/// Converts a fault into the caller-visible error, honoring suppressed
/// probes (no fault, no log, just `Invalid`).
pub(crate) fn seg_fault(fault: Fault, suppress: bool) -> SegError {
    if suppress {
        SegError::Invalid
    } else {
        log::debug!("segmentation: {}", fault);
        SegError::Fault(fault)
    }
}

impl CpuState {
    /// Loads a segment register from a selector.
    ///
    /// Real mode is a plain paragraph reload. Protected mode performs the
    /// full descriptor fetch and permission dance, returning the new base
    /// or the fault. `suppress` turns faults into `SegError::Invalid`
    /// without side effects, so the debugger can probe selectors.
    pub fn load_seg(&mut self, bus: &Bus, id: SegId, sel: u16, suppress: bool) -> LoadResult {
        if !self.protected_mode() {
            let seg = self.seg_mut(id);
            seg.set_real(sel);
            seg.update_mode(true, false);
            return Ok(seg.base());
        }
        self.load_prot(bus, id, sel, suppress)
    }

    /// Quietly resolves a selector to `(base, limit)` without perturbing
    /// the machine: no faults, no ACCESSED-bit writes, no cache change.
    /// The debugger's address parser is the customer.
    pub fn probe_descriptor(&self, bus: &Bus, sel: u16) -> Option<(u32, u32)> {
        if !self.protected_mode() || Selector(sel).is_null() {
            return None;
        }
        let (desc, _) = self.fetch_descriptor(bus, sel, true).ok()?;
        Some((desc.base(), desc.limit() as u32))
    }

    /// Reads an 8-byte descriptor out of the GDT or LDT.
    pub(crate) fn fetch_descriptor(
        &self,
        bus: &Bus,
        sel: u16,
        suppress: bool,
    ) -> Result<(Descriptor, u32), SegError> {
        let s = Selector(sel);
        let (table_base, table_limit) = if s.local() != 0 {
            (self.ldtr.base(), self.ldtr.limit())
        } else {
            (self.gdtr.base(), self.gdtr.limit())
        };

        let off = s.table_offset();
        if off + 7 > table_limit {
            return Err(seg_fault(Fault::gp(s.error_code()), suppress));
        }

        let addr = table_base.wrapping_add(off) & 0x00FF_FFFF;
        let w0 = self.read_word(bus, addr);
        let w1 = self.read_word(bus, addr + 2);
        let acc = self.read_word(bus, addr + 4);
        let ext = self.read_word(bus, addr + 6);
        Ok((Descriptor::from_words(w0, w1, acc, ext), addr))
    }

    fn load_prot(&mut self, bus: &Bus, id: SegId, sel: u16, suppress: bool) -> LoadResult {
        let role = self.seg(id).role();
        let s = Selector(sel);

        if s.is_null() {
            return match role {
                // A null CS, SS or TSS is never legal.
                SegRole::Code | SegRole::Stack | SegRole::Tss => {
                    Err(seg_fault(Fault::gp(0), suppress))
                }
                // Null data/LDT selectors load fine; the first access
                // through them faults instead.
                _ => {
                    self.seg_mut(id).load_null(sel);
                    Ok(0)
                }
            };
        }

        let (desc, addr_desc) = self.fetch_descriptor(bus, sel, suppress)?;

        match role {
            SegRole::Code => self.load_code(bus, sel, desc, addr_desc, suppress),
            SegRole::Data | SegRole::Other => {
                // Quirk kept on purpose: software that loads a data
                // segment from an empty descriptor expects a survivable
                // #GP, not a halt.
                if desc.acc_word() & 0xFF00 == 0 {
                    return Err(seg_fault(Fault::gp(s.error_code()), suppress));
                }
                if !desc.present() {
                    return Err(seg_fault(Fault::np(s.error_code()), suppress));
                }
                if role == SegRole::Data && (desc.is_system() || !desc.is_readable()) {
                    return Err(seg_fault(Fault::gp(s.error_code()), suppress));
                }
                self.finish_load(bus, id, sel, desc, addr_desc, suppress)
            }
            SegRole::Stack => {
                if !desc.present() {
                    return Err(seg_fault(Fault::ss(s.error_code()), suppress));
                }
                if desc.is_system() || desc.is_code() || !desc.is_writable() {
                    return Err(seg_fault(Fault::gp(s.error_code()), suppress));
                }
                self.finish_load(bus, id, sel, desc, addr_desc, suppress)
            }
            SegRole::Tss => {
                if !desc.is_system()
                    || !matches!(
                        desc.system_type(),
                        descriptor::SYS_TSS | descriptor::SYS_TSS_BUSY
                    )
                {
                    return Err(seg_fault(Fault::ts(s.error_code()), suppress));
                }
                if !desc.present() {
                    return Err(seg_fault(Fault::np(s.error_code()), suppress));
                }
                self.finish_load(bus, id, sel, desc, addr_desc, suppress)
            }
            SegRole::Ldt => {
                if desc.is_gate() {
                    return Err(seg_fault(Fault::gp(s.error_code()), suppress));
                }
                if !desc.present() {
                    return Err(seg_fault(Fault::np(s.error_code()), suppress));
                }
                self.finish_load(bus, id, sel, desc, addr_desc, suppress)
            }
        }
    }

    fn finish_load(
        &mut self,
        bus: &Bus,
        id: SegId,
        sel: u16,
        desc: Descriptor,
        addr_desc: u32,
        suppress: bool,
    ) -> LoadResult {
        self.seg_mut(id).commit_descriptor(sel, &desc, addr_desc, true);
        if !suppress {
            mark_accessed(bus, addr_desc, &desc);
        }
        Ok(self.seg(id).base())
    }
}

/// Sets the descriptor's ACCESSED bit in table memory. Code/data only;
/// system descriptors repurpose that bit as part of their type.
pub(crate) fn mark_accessed(bus: &Bus, addr_desc: u32, desc: &Descriptor) {
    if desc.is_system() || addr_desc == ADDR_INVALID {
        return;
    }
    let addr = addr_desc + ACC_BYTE_OFFSET;
    let byte = bus.read_data(addr, None);
    if byte & ACCESSED_BIT == 0 {
        bus.write_data(addr, byte | ACCESSED_BIT, None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data_seg(acc_byte: u16, limit: u16) -> SegmentRegister {
        let mut seg = SegmentRegister::new(SegConfig::new(SegRole::Data, "DS"));
        let desc = descriptor::make_segment(0x1000, limit, acc_byte);
        seg.commit_descriptor(0x0008, &desc, ADDR_INVALID, true);
        seg
    }

    #[test]
    fn real_mode_check_is_base_plus_offset() {
        let mut seg = SegmentRegister::new(SegConfig::new(SegRole::Data, "DS"));
        seg.set_real(0x1000);
        assert_eq!(seg.check_read(0x0020, 2, false), Ok(0x10020));
    }

    #[test]
    fn protected_check_enforces_off_max() {
        // Writable data, limit 0xFF: offsets 0..=0xFF valid.
        let seg = data_seg(0x92, 0x00FF);
        assert_eq!(seg.check_read(0x00FE, 2, false), Ok(0x10FE));
        assert_eq!(
            seg.check_read(0x00FF, 2, false),
            Err(SegError::Fault(Fault::gp(0)))
        );
        assert_eq!(seg.check_write(0x0010, 1, false), Ok(0x1010));
    }

    #[test]
    fn read_only_data_rejects_writes() {
        let seg = data_seg(0x90, 0x00FF);
        assert!(seg.check_read(0, 1, false).is_ok());
        assert_eq!(
            seg.check_write(0, 1, false),
            Err(SegError::Fault(Fault::gp(0)))
        );
    }

    #[test]
    fn expand_down_valid_range_is_above_the_limit() {
        // Writable, expand-down, limit 0x0FFF.
        let seg = data_seg(0x96, 0x0FFF);
        assert!(seg.check_write(0x0FFF, 2, false).is_err());
        assert_eq!(seg.check_write(0x1000, 2, false), Ok(0x2000));
        assert_eq!(seg.check_write(0xFFFE, 2, false), Ok(0x1000 + 0xFFFE));
        assert!(seg.check_write(0xFFFF, 2, false).is_err());
    }

    #[test]
    fn suppressed_checks_return_invalid() {
        let seg = data_seg(0x90, 0x000F);
        assert_eq!(seg.check_write(0, 1, true), Err(SegError::Invalid));
    }

    #[test]
    fn snapshot_round_trips() {
        let seg = data_seg(0x92, 0x1234);
        let state = seg.save();
        let mut other = SegmentRegister::new(SegConfig::new(SegRole::Data, "DS"));
        other.restore(&state, true);
        assert_eq!(other.base(), seg.base());
        assert_eq!(other.limit(), seg.limit());
        assert_eq!(other.check_write_kind(), seg.check_write_kind());
    }
}
