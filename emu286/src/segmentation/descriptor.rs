//! Raw descriptor-table entries.
//!
//! See the 80286 Programmer's Reference, chapter 6 (descriptor formats)
//! and chapter 7 (gates). A descriptor is four little-endian words:
//!
//! ```text
//! +0  limit           (gate: target offset)
//! +2  base 15..0      (gate: target selector)
//! +4  acc word: base 23..16 in the low byte, access rights in the high
//!     byte             (gate: parameter word count in the low byte)
//! +6  reserved on the 80286, flagged for larger models
//! ```

use bitfield::bitfield;
use static_assertions::const_assert_eq;

bitfield! {
    /// A segment selector.
    pub struct Selector(u16);
    impl Debug;
    pub rpl, set_rpl: 1, 0;       // requested privilege level
    pub local, set_local: 2, 2;   // table indicator: 0 = GDT, 1 = LDT
    pub index, set_index: 15, 3;  // descriptor index
}

impl Selector {
    /// Null for privilege purposes: index 0 in the GDT, any RPL.
    pub fn is_null(&self) -> bool {
        self.0 & 0xFFFC == 0
    }

    /// The selector with RPL stripped, the form used in error codes.
    pub fn error_code(&self) -> u16 {
        self.0 & 0xFFFC
    }

    /// Byte offset of the descriptor inside its table.
    pub fn table_offset(&self) -> u32 {
        (self.0 & 0xFFF8) as u32
    }
}

bitfield! {
    /// The acc word at descriptor offset +4.
    pub struct AccessWord(u16);
    impl Debug;
    pub base_hi, set_base_hi: 7, 0;        // base bits 23..16
    pub accessed, set_accessed: 8, 8;      // code/data only
    pub type_bits, set_type_bits: 11, 8;   // 4-bit type field
    pub segment, set_segment: 12, 12;      // S: 1 = code/data, 0 = system
    pub dpl, set_dpl: 14, 13;
    pub present, set_present: 15, 15;
}

// System type codes (S = 0).
pub const SYS_TSS: u16 = 0x1;
pub const SYS_LDT: u16 = 0x2;
pub const SYS_TSS_BUSY: u16 = 0x3;
pub const SYS_GATE_CALL: u16 = 0x4;
pub const SYS_GATE_TASK: u16 = 0x5;
pub const SYS_GATE_INT: u16 = 0x6;
pub const SYS_GATE_TRAP: u16 = 0x7;

// Code/data type bits (S = 1), within the 4-bit type field.
pub const TYPE_ACCESSED: u16 = 0x1;
pub const TYPE_WRITE_READ: u16 = 0x2; // writable for data, readable for code
pub const TYPE_EXPDOWN_CONF: u16 = 0x4; // expand-down for data, conforming for code
pub const TYPE_CODE: u16 = 0x8;

/// Byte offset (from the descriptor base) of the access-rights byte, the
/// one holding the ACCESSED bit for code/data and the BUSY bit for task
/// segments.
pub const ACC_BYTE_OFFSET: u32 = 5;
pub const ACCESSED_BIT: u16 = 0x01;
pub const TSS_BUSY_BIT: u16 = 0x02;

const_assert_eq!(SYS_TSS | TSS_BUSY_BIT, SYS_TSS_BUSY);

/// An 8-byte descriptor image as fetched from a table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Descriptor {
    pub w0: u16,
    pub w1: u16,
    pub acc: u16,
    pub ext: u16,
}

impl Descriptor {
    pub fn from_words(w0: u16, w1: u16, acc: u16, ext: u16) -> Self {
        Self { w0, w1, acc, ext }
    }

    fn access(&self) -> AccessWord {
        AccessWord(self.acc)
    }

    pub fn limit(&self) -> u16 {
        self.w0
    }

    pub fn base(&self) -> u32 {
        self.w1 as u32 | (self.access().base_hi() as u32) << 16
    }

    pub fn acc_word(&self) -> u16 {
        self.acc
    }

    pub fn present(&self) -> bool {
        self.access().present() != 0
    }

    pub fn dpl(&self) -> u8 {
        self.access().dpl() as u8
    }

    pub fn is_system(&self) -> bool {
        self.access().segment() == 0
    }

    /// The 4-bit type field; meaningful as a system code only when
    /// `is_system()`.
    pub fn system_type(&self) -> u16 {
        self.access().type_bits()
    }

    pub fn is_gate(&self) -> bool {
        self.is_system()
            && matches!(
                self.system_type(),
                SYS_GATE_CALL | SYS_GATE_TASK | SYS_GATE_INT | SYS_GATE_TRAP
            )
    }

    pub fn is_code(&self) -> bool {
        !self.is_system() && self.access().type_bits() & TYPE_CODE != 0
    }

    pub fn is_conforming(&self) -> bool {
        self.is_code() && self.access().type_bits() & TYPE_EXPDOWN_CONF != 0
    }

    pub fn is_expand_down(&self) -> bool {
        !self.is_system()
            && self.access().type_bits() & TYPE_CODE == 0
            && self.access().type_bits() & TYPE_EXPDOWN_CONF != 0
    }

    /// Writable data segment. Code segments are never writable.
    pub fn is_writable(&self) -> bool {
        !self.is_system()
            && self.access().type_bits() & TYPE_CODE == 0
            && self.access().type_bits() & TYPE_WRITE_READ != 0
    }

    /// Readable: data always, code only with the read bit.
    pub fn is_readable(&self) -> bool {
        if self.is_system() {
            return false;
        }
        if self.access().type_bits() & TYPE_CODE == 0 {
            return true;
        }
        self.access().type_bits() & TYPE_WRITE_READ != 0
    }

    // Gate views of the same words.

    pub fn gate_offset(&self) -> u16 {
        self.w0
    }

    pub fn gate_selector(&self) -> u16 {
        self.w1
    }

    pub fn gate_param_count(&self) -> u16 {
        self.access().base_hi() & 0x1F
    }
}

/// Builds the raw words of a code/data descriptor; the form tests and
/// table builders use.
pub fn make_segment(base: u32, limit: u16, acc_byte: u16) -> Descriptor {
    Descriptor::from_words(
        limit,
        (base & 0xFFFF) as u16,
        ((base >> 16) & 0xFF) as u16 | acc_byte << 8,
        0,
    )
}

/// Builds the raw words of a gate descriptor.
pub fn make_gate(gate_type: u16, selector: u16, offset: u16, dpl: u8, params: u16) -> Descriptor {
    let acc_byte = 0x80 | ((dpl as u16 & 3) << 5) | gate_type;
    Descriptor::from_words(offset, selector, (params & 0x1F) | acc_byte << 8, 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selector_fields() {
        let sel = Selector(0x000F);
        assert_eq!(sel.rpl(), 3);
        assert_eq!(sel.local(), 1);
        assert_eq!(sel.index(), 1);
        assert_eq!(sel.table_offset(), 8);
        assert!(!sel.is_null());
        assert!(Selector(0x0003).is_null());
    }

    #[test]
    fn code_descriptor_decodes() {
        // Present, DPL 0, code, readable, accessed clear.
        let d = make_segment(0x040000, 0xFFFF, 0x9A);
        assert!(d.present());
        assert_eq!(d.dpl(), 0);
        assert!(d.is_code());
        assert!(d.is_readable());
        assert!(!d.is_writable());
        assert!(!d.is_conforming());
        assert_eq!(d.base(), 0x040000);
        assert_eq!(d.limit(), 0xFFFF);
    }

    #[test]
    fn expand_down_data_decodes() {
        // Present, DPL 3, data, writable, expand-down.
        let d = make_segment(0, 0x0FFF, 0xF6);
        assert!(d.is_expand_down());
        assert!(d.is_writable());
        assert!(!d.is_code());
    }

    #[test]
    fn call_gate_decodes() {
        let g = make_gate(SYS_GATE_CALL, 0x0008, 0x1234, 3, 2);
        assert!(g.is_gate());
        assert_eq!(g.system_type(), SYS_GATE_CALL);
        assert_eq!(g.gate_selector(), 0x0008);
        assert_eq!(g.gate_offset(), 0x1234);
        assert_eq!(g.gate_param_count(), 2);
        assert_eq!(g.dpl(), 3);
        assert!(g.present());
    }
}
