//! Local APIC register access strategy.
//!
//! The hardware offers two mutually-exclusive register interfaces: the
//! classic memory-mapped window, and the x2APIC MSR block. The backend is
//! chosen once during probing and never changes afterwards; no caller may
//! observe which one is active except through timing.

use styx_abi::addr::VirtAddr;
use styx_abi::arch::x86_64::apic::X2APIC_MSR_BASE;
use styx_abi::arch::x86_64::msr::Msr;
use styx_lib::platform::Platform;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum LapicAccess {
    /// Loads and stores against the fixed virtual window.
    Mmio(VirtAddr),
    /// RDMSR/WRMSR against the x2APIC register block.
    Msr,
}

impl LapicAccess {
    #[inline]
    fn msr_for(reg: u32) -> Msr {
        Msr(X2APIC_MSR_BASE + reg / 16)
    }

    pub(crate) fn read<P: Platform>(&self, hw: &P, reg: u32) -> u32 {
        match self {
            Self::Mmio(base) => hw.read_u32(base.offset(reg as u64)),
            Self::Msr => hw.read_msr(Self::msr_for(reg)) as u32,
        }
    }

    pub(crate) fn write<P: Platform>(&self, hw: &mut P, reg: u32, value: u32) {
        match self {
            Self::Mmio(base) => {
                let addr = base.offset(reg as u64);
                // Pentium erratum: a register must be read before it is
                // written.
                let _ = hw.read_u32(addr);
                hw.write_u32(addr, value);
            }
            Self::Msr => hw.write_msr(Self::msr_for(reg), value as u64),
        }
    }
}
