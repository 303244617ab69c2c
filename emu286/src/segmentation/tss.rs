//! The 80286 task state segment and the task switch.
//!
//! Layout per the 80286 Programmer's Reference, section 8.2. The first
//! words are the back link and the privileged-stack table (SP/SS for
//! rings 0-2); the dynamic register image follows.

use static_assertions::const_assert_eq;

use crate::bus::Bus;
use crate::cpu::{CpuState, Flags, Msw, SegId};
use crate::fault::{Fault, LoadResult};
use crate::segmentation::descriptor::{
    ACC_BYTE_OFFSET, SYS_TSS, SYS_TSS_BUSY, TSS_BUSY_BIT,
};
use crate::segmentation::{mark_accessed, seg_fault, ADDR_INVALID, Selector};

pub const TSS_PREV: u32 = 0x00;
pub const TSS_SP0: u32 = 0x02;
pub const TSS_SS0: u32 = 0x04;
pub const TSS_SP1: u32 = 0x06;
pub const TSS_SS1: u32 = 0x08;
pub const TSS_SP2: u32 = 0x0A;
pub const TSS_SS2: u32 = 0x0C;
pub const TSS_IP: u32 = 0x0E;
pub const TSS_PS: u32 = 0x10;
pub const TSS_AX: u32 = 0x12;
pub const TSS_CX: u32 = 0x14;
pub const TSS_DX: u32 = 0x16;
pub const TSS_BX: u32 = 0x18;
pub const TSS_SP: u32 = 0x1A;
pub const TSS_BP: u32 = 0x1C;
pub const TSS_SI: u32 = 0x1E;
pub const TSS_DI: u32 = 0x20;
pub const TSS_ES: u32 = 0x22;
pub const TSS_CS: u32 = 0x24;
pub const TSS_SS: u32 = 0x26;
pub const TSS_DS: u32 = 0x28;
pub const TSS_LDT: u32 = 0x2A;
pub const TSS_LEN: u32 = 0x2C;

/// Smallest limit a descriptor may carry and still hold a whole TSS.
pub const TSS_LIMIT_MIN: u32 = TSS_LEN - 1;

// The register image must sit directly after the three-ring stack table.
const_assert_eq!(TSS_SS2 + 2, TSS_IP);
const_assert_eq!(TSS_LDT + 2, TSS_LEN);

impl CpuState {
    /// Switches tasks through the TSS named by `sel_new`.
    ///
    /// `nest` distinguishes CALL/INT-style switches (which link back to
    /// the outgoing task and set NT) from JMP-style replacement.
    pub fn switch_tss(&mut self, bus: &Bus, sel_new: u16, nest: bool) -> LoadResult {
        let err = sel_new & 0xFFFC;
        let old_tr_sel = self.tr.sel();
        let old_base = self.tr.base();

        if !nest {
            if self.tr.typ() != SYS_TSS_BUSY {
                return Err(seg_fault(Fault::ts(err), false));
            }
            // The outgoing task stops being busy.
            if self.tr.addr_desc() != ADDR_INVALID {
                let addr = self.tr.addr_desc() + ACC_BYTE_OFFSET;
                let byte = bus.read_data(addr, None);
                bus.write_data(addr, byte & !TSS_BUSY_BIT, None);
            }
        }

        let (desc, addr_desc) = self.fetch_descriptor(bus, sel_new, false)?;
        if !desc.is_system() || !matches!(desc.system_type(), SYS_TSS | SYS_TSS_BUSY) {
            return Err(seg_fault(Fault::ts(err), false));
        }
        if nest && desc.system_type() == SYS_TSS_BUSY {
            // Re-entering a busy task would corrupt its saved context.
            return Err(seg_fault(Fault::gp(err), false));
        }
        if !desc.present() {
            return Err(seg_fault(Fault::np(err), false));
        }
        if (desc.limit() as u32) < TSS_LIMIT_MIN {
            return Err(seg_fault(Fault::ts(err), false));
        }

        log::debug!(
            "task switch: {:#06x} -> {:#06x}{}",
            old_tr_sel,
            sel_new,
            if nest { " (nested)" } else { "" }
        );

        // The incoming task becomes busy.
        let addr = addr_desc + ACC_BYTE_OFFSET;
        let byte = bus.read_data(addr, None);
        bus.write_data(addr, byte | TSS_BUSY_BIT, None);

        // Save the outgoing context into the old TSS.
        let r = self.regs;
        self.write_word(bus, old_base + TSS_IP, r.ip);
        self.write_word(bus, old_base + TSS_PS, r.flags.bits());
        self.write_word(bus, old_base + TSS_AX, r.ax);
        self.write_word(bus, old_base + TSS_CX, r.cx);
        self.write_word(bus, old_base + TSS_DX, r.dx);
        self.write_word(bus, old_base + TSS_BX, r.bx);
        self.write_word(bus, old_base + TSS_SP, r.sp);
        self.write_word(bus, old_base + TSS_BP, r.bp);
        self.write_word(bus, old_base + TSS_SI, r.si);
        self.write_word(bus, old_base + TSS_DI, r.di);
        self.write_word(bus, old_base + TSS_ES, self.es.sel());
        self.write_word(bus, old_base + TSS_CS, self.cs.sel());
        self.write_word(bus, old_base + TSS_SS, self.ss.sel());
        self.write_word(bus, old_base + TSS_DS, self.ds.sel());

        let old_cpl = self.cpl();
        self.tr.commit_descriptor(sel_new, &desc, addr_desc, true);
        self.tr.set_system_type(SYS_TSS_BUSY);
        let new_base = self.tr.base();

        // Load the incoming context.
        self.regs.ip = self.read_word(bus, new_base + TSS_IP);
        let mut flags =
            Flags::from_bits_truncate(self.read_word(bus, new_base + TSS_PS)) | Flags::R1;
        if nest {
            flags.insert(Flags::NT);
        }
        self.regs.flags = flags;
        self.regs.ax = self.read_word(bus, new_base + TSS_AX);
        self.regs.cx = self.read_word(bus, new_base + TSS_CX);
        self.regs.dx = self.read_word(bus, new_base + TSS_DX);
        self.regs.bx = self.read_word(bus, new_base + TSS_BX);
        self.regs.sp = self.read_word(bus, new_base + TSS_SP);
        self.regs.bp = self.read_word(bus, new_base + TSS_BP);
        self.regs.si = self.read_word(bus, new_base + TSS_SI);
        self.regs.di = self.read_word(bus, new_base + TSS_DI);

        if nest {
            self.write_word(bus, new_base + TSS_PREV, old_tr_sel);
        }

        // LDT first: the incoming selectors may be local.
        let ldt_sel = self.read_word(bus, new_base + TSS_LDT);
        self.load_seg(bus, SegId::Ldt, ldt_sel, false)?;

        let cs_sel = self.read_word(bus, new_base + TSS_CS);
        let ss_sel = self.read_word(bus, new_base + TSS_SS);
        let ds_sel = self.read_word(bus, new_base + TSS_DS);
        let es_sel = self.read_word(bus, new_base + TSS_ES);

        self.task_load_cs(bus, cs_sel)?;
        self.load_seg(bus, SegId::Ss, ss_sel, false)?;
        self.load_seg(bus, SegId::Ds, ds_sel, false)?;
        self.load_seg(bus, SegId::Es, es_sel, false)?;

        // Gaining privilege across the switch picks up the inner stack
        // from the incoming TSS's ring table.
        let new_cpl = self.cpl();
        if new_cpl < old_cpl {
            let table_off = TSS_SP0 + 4 * new_cpl as u32;
            let inner_sp = self.read_word(bus, new_base + table_off);
            let inner_ss = self.read_word(bus, new_base + table_off + 2);
            self.load_seg(bus, SegId::Ss, inner_ss, false)?;
            self.regs.sp = inner_sp;
        }

        self.regs.msw.insert(Msw::TS);
        Ok(self.cs.base())
    }

    /// CS load on the task-switch path: the ordinary transfer rules do
    /// not apply (the incoming TSS dictates the privilege outright), but
    /// the descriptor still has to be a present code segment.
    fn task_load_cs(&mut self, bus: &Bus, sel: u16) -> LoadResult {
        let s = Selector(sel);
        if s.is_null() {
            return Err(seg_fault(Fault::ts(0), false));
        }
        let (desc, addr_desc) = self.fetch_descriptor(bus, sel, false)?;
        if desc.is_system() || !desc.is_code() {
            return Err(seg_fault(Fault::ts(s.error_code()), false));
        }
        if !desc.present() {
            return Err(seg_fault(Fault::np(s.error_code()), false));
        }
        self.cs.commit_descriptor(sel, &desc, addr_desc, true);
        mark_accessed(bus, addr_desc, &desc);
        Ok(self.cs.base())
    }
}
