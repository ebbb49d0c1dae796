//! I/O APIC redirection manager.
//!
//! Routes external device IRQs to a destination processor by programming
//! the redirection table. Legacy ISA IRQ numbers (0-15) first pass
//! through the firmware-declared redirect table; higher numbers address
//! input pins directly.

pub(crate) mod regs;

pub use regs::RedirectionEntry;

use styx_abi::addr::VirtAddr;
use styx_lib::klog_warn;
use styx_lib::platform::Platform;

use crate::error::{ApicError, ApicResult};
use regs::{
    IOAPIC_MAX_IRQ, IOAPIC_REG_REDIR_BASE, IOAPIC_REG_VER, IOAPIC_WINDOW_DATA,
    IOAPIC_WINDOW_SELECT, ISA_VECTOR_BASE,
};

/// Handle to the mapped I/O APIC register window.
#[derive(Clone, Copy, Debug)]
pub struct IoApic {
    window: VirtAddr,
}

impl IoApic {
    pub(crate) fn new(window: VirtAddr) -> Self {
        Self { window }
    }

    fn read_reg<P: Platform>(&self, hw: &mut P, reg: u8) -> u32 {
        hw.write_u32(self.window.offset(IOAPIC_WINDOW_SELECT), reg as u32);
        hw.read_u32(self.window.offset(IOAPIC_WINDOW_DATA))
    }

    fn write_reg<P: Platform>(&self, hw: &mut P, reg: u8, value: u32) {
        hw.write_u32(self.window.offset(IOAPIC_WINDOW_SELECT), reg as u32);
        hw.write_u32(self.window.offset(IOAPIC_WINDOW_DATA), value);
    }

    /// Hardware version, bits 0-7 of the version register.
    pub fn version<P: Platform>(&self, hw: &mut P) -> u32 {
        self.read_reg(hw, IOAPIC_REG_VER) & 0xFF
    }

    /// Index of the highest redirection slot this I/O APIC implements.
    pub fn max_redirection_entry<P: Platform>(&self, hw: &mut P) -> u32 {
        (self.read_reg(hw, IOAPIC_REG_VER) >> 16) & 0xFF
    }

    /// Program the redirection slot for `irq`: vector `0x20 + irq`, fixed
    /// delivery to the processor with APIC id `apic_id`, active-high,
    /// edge-triggered. `masked` leaves the encoding in place but inhibits
    /// delivery.
    ///
    /// The slot's two words are written as separate select/data
    /// transactions; the hardware window moves 32 bits at a time.
    pub(crate) fn set_route<P: Platform>(
        &self,
        hw: &mut P,
        redirect: &[u8; 16],
        irq: u8,
        apic_id: u8,
        masked: bool,
    ) -> ApicResult<()> {
        if irq > IOAPIC_MAX_IRQ {
            klog_warn!("IOAPIC: IRQ {} is beyond the redirection table", irq);
            return Err(ApicError::InvalidIrq { irq });
        }

        let pin = if irq < 16 { redirect[irq as usize] } else { irq };
        let slot = IOAPIC_REG_REDIR_BASE + pin * 2;

        let entry = RedirectionEntry {
            vector: ISA_VECTOR_BASE + irq,
            dest: apic_id,
            masked,
        };
        let (low, high) = entry.encode();
        self.write_reg(hw, slot, low);
        self.write_reg(hw, slot + 1, high);

        Ok(())
    }
}
