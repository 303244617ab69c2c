//! Architectural CPU state shared with the external execution engine.
//!
//! The instruction decoder/executor lives outside this crate; what lives
//! here is everything the segmentation unit and the debugger need to
//! agree on: the register file, the flags word, the machine status word,
//! and the set of segment registers with their descriptor caches.

use core::fmt;

use bitflags::bitflags;

use crate::bus::Bus;
use crate::fault::SegError;
use crate::segmentation::{SegConfig, SegRole, SegmentRegister};

bitflags! {
    /// The 80286 flags word (PS).
    pub struct Flags: u16 {
        const CF = 0x0001;
        /// Reserved, always reads as set.
        const R1 = 0x0002;
        const PF = 0x0004;
        const AF = 0x0010;
        const ZF = 0x0040;
        const SF = 0x0080;
        const TF = 0x0100;
        const IF = 0x0200;
        const DF = 0x0400;
        const OF = 0x0800;
        const IOPL = 0x3000;
        const NT = 0x4000;
    }
}

bitflags! {
    /// The machine status word (loaded with LMSW, read with SMSW).
    pub struct Msw: u16 {
        /// Protected-mode enable. One-way on the 80286.
        const PE = 0x0001;
        const MP = 0x0002;
        const EM = 0x0004;
        /// Task switched; set by every task switch.
        const TS = 0x0008;
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RegisterFile {
    pub ax: u16,
    pub cx: u16,
    pub dx: u16,
    pub bx: u16,
    pub sp: u16,
    pub bp: u16,
    pub si: u16,
    pub di: u16,
    pub ip: u16,
    pub flags: Flags,
    pub msw: Msw,
}

impl Default for RegisterFile {
    fn default() -> Self {
        Self {
            ax: 0,
            cx: 0,
            dx: 0,
            bx: 0,
            sp: 0,
            bp: 0,
            si: 0,
            di: 0,
            ip: 0xFFF0,
            flags: Flags::R1,
            msw: Msw::empty(),
        }
    }
}

/// Which architectural segment register an operation targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegId {
    Cs,
    Ds,
    Es,
    Ss,
    Ldt,
    Tss,
}

pub struct CpuState {
    pub regs: RegisterFile,

    pub cs: SegmentRegister,
    pub ds: SegmentRegister,
    pub es: SegmentRegister,
    pub ss: SegmentRegister,
    /// Local descriptor table register.
    pub ldtr: SegmentRegister,
    /// Task register.
    pub tr: SegmentRegister,
    /// Pseudo-descriptors loaded by LGDT/LIDT; only base and limit matter.
    pub gdtr: SegmentRegister,
    pub idtr: SegmentRegister,
}

impl CpuState {
    /// Real-mode reset state: execution resumes at F000:FFF0, the
    /// real-mode IVT spans the first KiB.
    pub fn new() -> Self {
        let mut cpu = Self {
            regs: RegisterFile::default(),
            cs: SegmentRegister::new(SegConfig::new(SegRole::Code, "CS")),
            ds: SegmentRegister::new(SegConfig::new(SegRole::Data, "DS")),
            es: SegmentRegister::new(SegConfig::new(SegRole::Data, "ES")),
            ss: SegmentRegister::new(SegConfig::new(SegRole::Stack, "SS")),
            ldtr: SegmentRegister::new(SegConfig::new(SegRole::Ldt, "LDT")),
            tr: SegmentRegister::new(SegConfig::new(SegRole::Tss, "TSS")),
            gdtr: SegmentRegister::new(SegConfig::new(SegRole::Other, "GDT")),
            idtr: SegmentRegister::new(SegConfig::new(SegRole::Other, "IDT")),
        };
        cpu.cs.set_real(0xF000);
        cpu.idtr.set_base(0);
        cpu.idtr.set_limit(0x03FF);
        cpu
    }

    pub fn protected_mode(&self) -> bool {
        self.regs.msw.contains(Msw::PE)
    }

    /// Flips between real and protected operation and rebinds every
    /// segment register's dispatch accordingly. Entering protected mode
    /// is architecturally one-way on the 80286; leaving it again is the
    /// emulator-reset path.
    pub fn set_protected_mode(&mut self, on: bool) {
        self.regs.msw.set(Msw::PE, on);
        for id in [SegId::Cs, SegId::Ds, SegId::Es, SegId::Ss, SegId::Ldt, SegId::Tss] {
            self.seg_mut(id).update_mode(false, on);
        }
        log::debug!(
            "cpu: {} mode",
            if on { "protected" } else { "real" }
        );
    }

    pub fn seg(&self, id: SegId) -> &SegmentRegister {
        match id {
            SegId::Cs => &self.cs,
            SegId::Ds => &self.ds,
            SegId::Es => &self.es,
            SegId::Ss => &self.ss,
            SegId::Ldt => &self.ldtr,
            SegId::Tss => &self.tr,
        }
    }

    pub fn seg_mut(&mut self, id: SegId) -> &mut SegmentRegister {
        match id {
            SegId::Cs => &mut self.cs,
            SegId::Ds => &mut self.ds,
            SegId::Es => &mut self.es,
            SegId::Ss => &mut self.ss,
            SegId::Ldt => &mut self.ldtr,
            SegId::Tss => &mut self.tr,
        }
    }

    pub fn cpl(&self) -> u8 {
        self.cs.cpl()
    }

    /// Linear address of the next instruction.
    pub fn reg_pc(&self) -> u32 {
        self.cs.base().wrapping_add(self.regs.ip as u32) & 0x00FF_FFFF
    }

    pub fn lgdt(&mut self, base: u32, limit: u16) {
        self.gdtr.set_base(base);
        self.gdtr.set_limit(limit as u32);
    }

    pub fn lidt(&mut self, base: u32, limit: u16) {
        self.idtr.set_base(base);
        self.idtr.set_limit(limit as u32);
    }

    /// 16-bit little-endian read composed of two byte accesses, ascending.
    pub fn read_word(&self, bus: &Bus, addr: u32) -> u16 {
        let lo = bus.read_data(addr, None);
        let hi = bus.read_data(addr.wrapping_add(1), None);
        lo | hi << 8
    }

    pub fn write_word(&self, bus: &Bus, addr: u32, value: u16) {
        bus.write_data(addr, value & 0xFF, None);
        bus.write_data(addr.wrapping_add(1), value >> 8, None);
    }

    pub fn push_word(&mut self, bus: &Bus, value: u16) -> Result<(), SegError> {
        let sp = self.regs.sp.wrapping_sub(2);
        let linear = self.ss.check_write(sp, 2, false)?;
        self.regs.sp = sp;
        self.write_word(bus, linear, value);
        Ok(())
    }

    pub fn pop_word(&mut self, bus: &Bus) -> Result<u16, SegError> {
        let linear = self.ss.check_read(self.regs.sp, 2, false)?;
        let value = self.read_word(bus, linear);
        self.regs.sp = self.regs.sp.wrapping_add(2);
        Ok(value)
    }

    /// Register access by name, uppercase. The surface the debugger's
    /// expression evaluator and `r` command use.
    pub fn register(&self, name: &str) -> Option<u16> {
        Some(match name {
            "AX" => self.regs.ax,
            "BX" => self.regs.bx,
            "CX" => self.regs.cx,
            "DX" => self.regs.dx,
            "SP" => self.regs.sp,
            "BP" => self.regs.bp,
            "SI" => self.regs.si,
            "DI" => self.regs.di,
            "IP" => self.regs.ip,
            "PS" => self.regs.flags.bits(),
            "MSW" => self.regs.msw.bits(),
            "CS" => self.cs.sel(),
            "DS" => self.ds.sel(),
            "ES" => self.es.sel(),
            "SS" => self.ss.sel(),
            _ => return None,
        })
    }

    /// Sets a register by name. Segment registers are only assignable in
    /// real mode (where the assignment is a plain reload); in protected
    /// mode a selector change has to travel through a proper load.
    pub fn set_register(&mut self, name: &str, value: u16) -> bool {
        match name {
            "AX" => self.regs.ax = value,
            "BX" => self.regs.bx = value,
            "CX" => self.regs.cx = value,
            "DX" => self.regs.dx = value,
            "SP" => self.regs.sp = value,
            "BP" => self.regs.bp = value,
            "SI" => self.regs.si = value,
            "DI" => self.regs.di = value,
            "IP" => self.regs.ip = value,
            "PS" => self.regs.flags = Flags::from_bits_truncate(value) | Flags::R1,
            "MSW" => self.regs.msw = Msw::from_bits_truncate(value),
            "CS" | "DS" | "ES" | "SS" => {
                if self.protected_mode() {
                    return false;
                }
                let id = match name {
                    "CS" => SegId::Cs,
                    "DS" => SegId::Ds,
                    "ES" => SegId::Es,
                    _ => SegId::Ss,
                };
                let seg = self.seg_mut(id);
                seg.set_real(value);
                seg.update_mode(true, false);
            }
            _ => return false,
        }
        true
    }

    /// All register names `register` understands, in display order.
    pub fn register_names() -> &'static [&'static str] {
        &[
            "AX", "BX", "CX", "DX", "SP", "BP", "SI", "DI", "IP", "PS", "MSW", "CS", "DS", "ES",
            "SS",
        ]
    }

    /// Register dump; `detail` adds the hidden descriptor caches.
    pub fn dump(&self, detail: bool) -> String {
        let mut out = self.to_string();
        if detail {
            out.push('\n');
            for seg in [&self.cs, &self.ds, &self.es, &self.ss, &self.ldtr, &self.tr] {
                out.push_str(&format!(
                    "{}={:04X} base={:06X} limit={:04X} dpl={} {}\n",
                    seg.name(),
                    seg.sel(),
                    seg.base(),
                    seg.limit(),
                    seg.dpl(),
                    if self.protected_mode() { "prot" } else { "real" },
                ));
            }
            out.push_str(&format!(
                "GDT={:06X},{:04X} IDT={:06X},{:04X} MSW={:04X} CPL={}",
                self.gdtr.base(),
                self.gdtr.limit(),
                self.idtr.base(),
                self.idtr.limit(),
                self.regs.msw.bits(),
                self.cpl(),
            ));
        }
        out
    }
}

impl Default for CpuState {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CpuState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let r = &self.regs;
        writeln!(
            f,
            "AX={:04X}  BX={:04X}  CX={:04X}  DX={:04X}  SP={:04X}  BP={:04X}  SI={:04X}  DI={:04X}",
            r.ax, r.bx, r.cx, r.dx, r.sp, r.bp, r.si, r.di
        )?;
        write!(
            f,
            "DS={:04X}  ES={:04X}  SS={:04X}  CS={:04X}  IP={:04X}  PS={:04X}",
            self.ds.sel(),
            self.es.sel(),
            self.ss.sel(),
            self.cs.sel(),
            r.ip,
            r.flags.bits()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reset_lands_at_the_boot_vector() {
        let cpu = CpuState::new();
        assert!(!cpu.protected_mode());
        assert_eq!(cpu.cs.sel(), 0xF000);
        assert_eq!(cpu.cs.base(), 0xF0000);
        assert_eq!(cpu.reg_pc(), 0xFFFF0);
        assert_eq!(cpu.idtr.limit(), 0x03FF);
    }

    #[test]
    fn registers_by_name() {
        let mut cpu = CpuState::new();
        assert!(cpu.set_register("AX", 0x1234));
        assert_eq!(cpu.register("AX"), Some(0x1234));
        assert_eq!(cpu.register("XX"), None);

        assert!(cpu.set_register("DS", 0x0800));
        assert_eq!(cpu.ds.base(), 0x08000);
    }

    #[test]
    fn flags_word_keeps_the_reserved_bit() {
        let mut cpu = CpuState::new();
        cpu.set_register("PS", 0x0000);
        assert_ne!(cpu.regs.flags.bits() & 0x0002, 0);
    }
}
