//! Control transfers through CS: direct far transfers, gates, and
//! interrupt vectoring.
//!
//! The privilege rules live here. Which transfers are legal depends on
//! the armed `f_call` state: `Some(true)` (CALLF/INT) may move inward to
//! a numerically lower privilege through a gate, `Some(false)`
//! (RETF/IRET) may move outward, `None` permits no privilege change at
//! all. See the 80286 Programmer's Reference, chapter 7.

use crate::bus::Bus;
use crate::cpu::{CpuState, Flags, SegId};
use crate::fault::{Fault, LoadResult};
use crate::segmentation::descriptor::{
    Descriptor, SYS_GATE_CALL, SYS_GATE_INT, SYS_GATE_TASK, SYS_GATE_TRAP,
};
use crate::segmentation::{mark_accessed, seg_fault, Selector};

impl CpuState {
    /// The CS leg of a protected-mode load. Dispatches gates, enforces
    /// the conforming/privilege rules, and commits the new code segment.
    pub(super) fn load_code(
        &mut self,
        bus: &Bus,
        sel: u16,
        desc: Descriptor,
        addr_desc: u32,
        suppress: bool,
    ) -> LoadResult {
        let s = Selector(sel);
        let f_call = self.cs.take_call();
        self.cs.set_stack_switch(false);

        if desc.is_gate() {
            return self.through_gate(bus, sel, desc, f_call, true, suppress);
        }
        if !desc.present() {
            return Err(seg_fault(Fault::np(s.error_code()), suppress));
        }
        if desc.is_system() || !desc.is_code() {
            return Err(seg_fault(Fault::gp(s.error_code()), suppress));
        }

        let cpl = self.cs.cpl();
        let rpl = s.rpl() as u8;
        let dpl = desc.dpl();

        let new_cpl = match f_call {
            Some(false) => {
                // Outward return: the popped CS decides the new (lower)
                // privilege; returning inward is never legal. The caller
                // pops the outer SP and SS off the current stack next.
                if rpl < cpl {
                    return Err(seg_fault(Fault::gp(s.error_code()), suppress));
                }
                rpl
            }
            _ => {
                let ok = if desc.is_conforming() {
                    dpl <= cpl
                } else {
                    dpl == cpl && rpl <= cpl
                };
                if !ok {
                    return Err(seg_fault(Fault::gp(s.error_code()), suppress));
                }
                cpl
            }
        };

        let commit_sel = (sel & 0xFFFC) | new_cpl as u16;
        self.cs.commit_descriptor(commit_sel, &desc, addr_desc, true);
        if !suppress {
            mark_accessed(bus, addr_desc, &desc);
        }
        Ok(self.cs.base())
    }

    /// Transfers control through a call, interrupt, trap, or task gate.
    ///
    /// `fault_sel` feeds error codes (the gate selector, or the
    /// IDT-flavored vector code); `check_rpl` is off when arriving via
    /// the IDT, where the requestor privilege does not apply.
    pub(super) fn through_gate(
        &mut self,
        bus: &Bus,
        fault_sel: u16,
        gate: Descriptor,
        f_call: Option<bool>,
        check_rpl: bool,
        suppress: bool,
    ) -> LoadResult {
        let err = fault_sel & 0xFFFC;
        let cpl = self.cs.cpl();

        if f_call != Some(true) {
            // Gates mediate calls and interrupts only.
            return Err(seg_fault(Fault::gp(err), suppress));
        }
        if check_rpl {
            let rpl = ((fault_sel & 3) as u8).max(cpl);
            if rpl > gate.dpl() {
                return Err(seg_fault(Fault::gp(err), suppress));
            }
        }
        if !gate.present() {
            return Err(seg_fault(Fault::np(err), suppress));
        }

        if gate.system_type() == SYS_GATE_TASK {
            let target = gate.gate_selector();
            log::debug!("gate: task gate to {:#06x}", target);
            return self.switch_tss(bus, target, true);
        }

        let target = gate.gate_selector();
        if target & 0xFFFC == 0 {
            return Err(seg_fault(Fault::gp(0), suppress));
        }

        let (tdesc, taddr) = self.fetch_descriptor(bus, target, suppress)?;
        if !tdesc.present() {
            return Err(seg_fault(Fault::np(target & 0xFFFC), suppress));
        }
        if tdesc.is_system() || !tdesc.is_code() {
            return Err(seg_fault(Fault::gp(target & 0xFFFC), suppress));
        }
        let tdpl = tdesc.dpl();
        if tdpl > cpl {
            return Err(seg_fault(Fault::gp(target & 0xFFFC), suppress));
        }

        if !tdesc.is_conforming() && tdpl < cpl {
            self.gate_stack_switch(bus, gate, tdesc, taddr, target, tdpl, suppress)?;
        } else {
            let commit_sel = (target & 0xFFFC) | cpl as u16;
            self.cs.commit_descriptor(commit_sel, &tdesc, taddr, true);
            if !suppress {
                mark_accessed(bus, taddr, &tdesc);
            }
        }

        self.regs.ip = gate.gate_offset();

        // Interrupt gates disarm further interrupts; trap gates leave IF
        // alone. Both clear TF and NT.
        match gate.system_type() {
            SYS_GATE_INT => {
                self.regs
                    .flags
                    .remove(Flags::IF | Flags::TF | Flags::NT);
            }
            SYS_GATE_TRAP => {
                self.regs.flags.remove(Flags::TF | Flags::NT);
            }
            _ => debug_assert_eq!(gate.system_type(), SYS_GATE_CALL),
        }

        Ok(self.cs.base())
    }

    /// The inward leg of a gated transfer: pick up the inner stack from
    /// the TSS, carry the gate's parameter words across, and leave the
    /// outer SS:SP underneath them.
    fn gate_stack_switch(
        &mut self,
        bus: &Bus,
        gate: Descriptor,
        tdesc: Descriptor,
        taddr: u32,
        target: u16,
        tdpl: u8,
        suppress: bool,
    ) -> Result<(), crate::fault::SegError> {
        let nwords = gate.gate_param_count() as usize;

        let old_ss = self.ss.sel();
        let old_ss_base = self.ss.base();
        let old_sp = self.regs.sp;

        // Parameters sit at the top of the outgoing stack.
        self.cs.aw_parms.clear();
        for i in 0..nwords {
            let addr = old_ss_base.wrapping_add(old_sp.wrapping_add((2 * i) as u16) as u32);
            let word = self.read_word(bus, addr);
            self.cs.aw_parms.push(word);
        }

        // The privileged-stack table: SP then SS per ring, starting at
        // TSS offset 2.
        let table_off = 2 + 4 * tdpl as u32;
        if table_off + 3 > self.tr.limit() {
            return Err(seg_fault(Fault::ts(self.tr.sel() & 0xFFFC), suppress));
        }
        let tss_base = self.tr.base();
        let new_sp = self.read_word(bus, tss_base + table_off);
        let new_ss = self.read_word(bus, tss_base + table_off + 2);

        log::debug!(
            "gate: inward cpl {} -> {}, stack {:#06x}:{:#06x}, {} parameter word(s)",
            self.cs.cpl(),
            tdpl,
            new_ss,
            new_sp,
            nwords
        );

        // The new CS privilege must be in force before the inner SS load
        // so its privilege checks see the inner CPL.
        let commit_sel = (target & 0xFFFC) | tdpl as u16;
        self.cs.commit_descriptor(commit_sel, &tdesc, taddr, true);
        if !suppress {
            mark_accessed(bus, taddr, &tdesc);
        }

        self.load_seg(bus, SegId::Ss, new_ss, suppress)?;
        self.regs.sp = new_sp;

        self.push_word(bus, old_ss)?;
        self.push_word(bus, old_sp)?;
        for i in (0..nwords).rev() {
            let word = self.cs.aw_parms[i];
            self.push_word(bus, word)?;
        }

        self.cs.set_stack_switch(true);
        Ok(())
    }

    /// Fetches an interrupt vector.
    ///
    /// Real mode walks the 4-byte IVT and reloads CS. Protected mode
    /// treats the IDT entry as an 8-byte gate and runs the gate path; the
    /// error code carries the vector with the IDT flag. Returns the
    /// linear address execution continues from.
    pub fn load_idt(&mut self, bus: &Bus, vector: u8) -> LoadResult {
        if !self.protected_mode() {
            let entry = vector as u32 * 4;
            if entry + 3 > self.idtr.limit() {
                return Err(seg_fault(Fault::gp(0), false));
            }
            let base = self.idtr.base();
            let off = self.read_word(bus, base + entry);
            let seg = self.read_word(bus, base + entry + 2);

            let cs_base = self.load_seg(bus, SegId::Cs, seg, false)?;
            self.regs.ip = off;
            return Ok(cs_base + off as u32);
        }

        let err = (vector as u16) << 3 | 2;
        let entry = vector as u32 * 8;
        if entry + 7 > self.idtr.limit() {
            return Err(seg_fault(Fault::gp(err), false));
        }

        let addr = self.idtr.base().wrapping_add(entry) & 0x00FF_FFFF;
        let w0 = self.read_word(bus, addr);
        let w1 = self.read_word(bus, addr + 2);
        let acc = self.read_word(bus, addr + 4);
        let ext = self.read_word(bus, addr + 6);
        let gate = Descriptor::from_words(w0, w1, acc, ext);

        if !matches!(
            gate.system_type(),
            SYS_GATE_INT | SYS_GATE_TRAP | SYS_GATE_TASK
        ) || !gate.is_system()
        {
            return Err(seg_fault(Fault::gp(err), false));
        }

        self.through_gate(bus, err, gate, Some(true), false, false)?;
        Ok(self.cs.base() + self.regs.ip as u32)
    }
}
