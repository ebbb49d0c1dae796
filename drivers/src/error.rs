//! Unified error type for the interrupt-controller subsystem.

use core::fmt;

use styx_mptable::ProbeError;

/// Interrupt-controller error.
///
/// Absence of optional hardware is *not* represented here; a missing MP
/// table or I/O APIC degrades the configuration instead of failing it.
/// These variants cover the cases a caller must react to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApicError {
    /// No Local APIC could be resolved; the kernel continues without this
    /// subsystem.
    NoHardware,
    /// The operation needs hardware that has not been probed or
    /// calibrated yet. The call was a no-op.
    Unavailable,
    /// IRQ number outside the I/O APIC's input range. No hardware state
    /// was touched.
    InvalidIrq { irq: u8 },
}

impl fmt::Display for ApicError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoHardware => write!(f, "no Local APIC on this machine"),
            Self::Unavailable => write!(f, "interrupt controller not ready"),
            Self::InvalidIrq { irq } => write!(f, "IRQ {} outside redirection range", irq),
        }
    }
}

impl From<ProbeError> for ApicError {
    fn from(err: ProbeError) -> Self {
        match err {
            ProbeError::NoLocalApic => Self::NoHardware,
        }
    }
}

/// Convenience result type for interrupt-controller operations.
pub type ApicResult<T = ()> = Result<T, ApicError>;
