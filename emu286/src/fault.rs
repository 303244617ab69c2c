//! Processor exceptions raised by the segmentation unit.
//!
//! Faults are guest machine state, not host errors: the caller (the
//! execution engine) is responsible for vectoring them through the IDT.
//! Nothing in this crate catches a `Fault`.

use core::fmt;

/// The exception classes the segmentation unit can raise.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    /// `#TS` - invalid task state segment.
    InvalidTss,
    /// `#NP` - segment not present.
    NotPresent,
    /// `#SS` - stack segment fault.
    StackSegment,
    /// `#GP` - general protection violation.
    GeneralProtection,
    /// `#DF` - fault while delivering a fault.
    DoubleFault,
}

impl FaultKind {
    /// The interrupt vector the execution engine dispatches through.
    pub const fn vector(self) -> u8 {
        match self {
            FaultKind::DoubleFault => 8,
            FaultKind::InvalidTss => 10,
            FaultKind::NotPresent => 11,
            FaultKind::StackSegment => 12,
            FaultKind::GeneralProtection => 13,
        }
    }

    pub const fn mnemonic(self) -> &'static str {
        match self {
            FaultKind::DoubleFault => "#DF",
            FaultKind::InvalidTss => "#TS",
            FaultKind::NotPresent => "#NP",
            FaultKind::StackSegment => "#SS",
            FaultKind::GeneralProtection => "#GP",
        }
    }
}

/// A pending exception with its error code.
///
/// `fatal` marks a condition the guest cannot reasonably recover from
/// (currently only the double fault). Everything else is delivered and
/// handled by guest software. Loading a data segment register with an
/// all-zero descriptor is the notable case that stays non-fatal: real
/// software dereferences empty descriptors and expects to survive the
/// resulting `#GP`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fault {
    pub kind: FaultKind,
    pub error: u16,
    pub fatal: bool,
}

impl Fault {
    pub const fn gp(error: u16) -> Self {
        Self {
            kind: FaultKind::GeneralProtection,
            error,
            fatal: false,
        }
    }

    pub const fn np(error: u16) -> Self {
        Self {
            kind: FaultKind::NotPresent,
            error,
            fatal: false,
        }
    }

    pub const fn ss(error: u16) -> Self {
        Self {
            kind: FaultKind::StackSegment,
            error,
            fatal: false,
        }
    }

    pub const fn ts(error: u16) -> Self {
        Self {
            kind: FaultKind::InvalidTss,
            error,
            fatal: false,
        }
    }

    pub const fn df() -> Self {
        Self {
            kind: FaultKind::DoubleFault,
            error: 0,
            fatal: true,
        }
    }
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({:#06x})", self.kind.mnemonic(), self.error)
    }
}

/// Uniform result of a segment load or access check.
///
/// `Invalid` is returned instead of a fault when the caller asked for a
/// suppressed probe (the debugger inspecting selectors must not perturb
/// the machine).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegError {
    Invalid,
    Fault(Fault),
}

impl fmt::Display for SegError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SegError::Invalid => write!(f, "invalid selector"),
            SegError::Fault(fault) => fault.fmt(f),
        }
    }
}

/// What a `load`/`check` returns: the linear base or address on success.
pub type LoadResult = Result<u32, SegError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vectors_match_the_architecture() {
        assert_eq!(FaultKind::DoubleFault.vector(), 8);
        assert_eq!(FaultKind::InvalidTss.vector(), 10);
        assert_eq!(FaultKind::NotPresent.vector(), 11);
        assert_eq!(FaultKind::StackSegment.vector(), 12);
        assert_eq!(FaultKind::GeneralProtection.vector(), 13);
    }

    #[test]
    fn display_carries_the_error_code() {
        assert_eq!(Fault::gp(0x1234).to_string(), "#GP(0x1234)");
        assert_eq!(Fault::ts(0).to_string(), "#TS(0x0000)");
    }
}
