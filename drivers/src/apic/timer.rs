//! Local APIC timer calibration.
//!
//! The timer decrements at the bus clock divided by the programmed
//! divisor, a rate that differs per machine, so it must be measured once
//! against the already-running system clock. The engine arms a one-shot
//! countdown from the maximum count, lets exactly three whole clock ticks
//! pass, and averages the decrement over them; three ticks smooth the
//! jitter a single short window would pick up. The derived per-tick count
//! is then used for every subsequent periodic (re)arm.

use styx_abi::arch::x86_64::apic::{
    LAPIC_TIMER_CCR, LAPIC_TIMER_DCR, LAPIC_TIMER_DIV_1, LAPIC_TIMER_ICR, LAPIC_TIMER_PERIODIC,
};
use styx_lib::klog_info;
use styx_lib::platform::Platform;

use crate::error::{ApicError, ApicResult};
use crate::pic;

use super::{InterruptController, LAPIC_LVT_TIMER, TIMER_VECTOR};

/// Whole clock ticks in the measurement window.
const CALIBRATION_TICKS: u64 = 3;

impl<P: Platform> InterruptController<P> {
    /// Measure the timer's decrement rate and switch it to periodic
    /// operation, then hand the machine's interrupt routing over to the
    /// APIC path.
    ///
    /// Requires a probed Local APIC and an advancing system clock. The
    /// multi-step register programs run under local-interrupt masking so
    /// this processor's own handlers cannot interleave with them. A
    /// derived count of zero leaves the timer disabled; everything else
    /// still comes up, so `is_enabled` reports true either way.
    pub fn calibrate_timer(&mut self) -> ApicResult<()> {
        if self.lapic.is_none() {
            return Err(ApicError::Unavailable);
        }

        // Align to a clock edge so the window spans whole ticks only.
        let old = self.hw.clock_tick();
        let mut start = self.hw.clock_tick();
        while start == old {
            self.hw.relax();
            start = self.hw.clock_tick();
        }

        let token = self.hw.irq_save();
        self.lapic_write(LAPIC_TIMER_DCR, LAPIC_TIMER_DIV_1);
        self.lapic_write(LAPIC_LVT_TIMER, LAPIC_TIMER_PERIODIC | TIMER_VECTOR as u32);
        self.lapic_write(LAPIC_TIMER_ICR, u32::MAX);
        self.hw.irq_restore(token);

        while self.hw.clock_tick() - start < CALIBRATION_TICKS {
            self.hw.relax();
        }

        let remaining = self.lapic_read(LAPIC_TIMER_CCR);
        self.icr = (u32::MAX - remaining) / CALIBRATION_TICKS as u32;

        let token = self.hw.irq_save();
        self.reset_registers();
        self.hw.irq_restore(token);

        // The APIC path is authoritative from here on.
        pic::quiesce(&mut self.hw);

        klog_info!(
            "APIC: calibration derived a timer count of {:#x} per tick",
            self.icr
        );

        let token = self.hw.irq_save();
        if let Some(ioapic) = &self.ioapic {
            let max_entry = ioapic.max_redirection_entry(&mut self.hw) as u8;
            let boot_id = self.topology.boot_processor_id().unwrap_or(0);
            for irq in 0..=max_entry {
                if irq != 2 {
                    let _ =
                        ioapic.set_route(&mut self.hw, &self.topology.redirect, irq, boot_id, false);
                }
            }
            // Line 2 carried the legacy PIT; the Local APIC keeps time
            // now, so it stays masked.
            let _ = ioapic.set_route(&mut self.hw, &self.topology.redirect, 2, boot_id, true);
        }
        self.initialized = true;
        self.hw.irq_restore(token);

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::{LINT0_VECTOR, LINT1_VECTOR};
    use super::*;
    use crate::ioapic::regs::RedirectionEntry;
    use crate::test_fixtures::probed_controller;
    use styx_abi::arch::x86_64::apic::{LAPIC_LVT_LINT0, LAPIC_LVT_LINT1, LAPIC_LVT_MASKED};
    use styx_lib::testing::MockPlatform;

    #[test]
    fn calibrate_before_probe_is_unavailable() {
        let mut ctl = InterruptController::new(MockPlatform::new());
        assert_eq!(ctl.calibrate_timer(), Err(ApicError::Unavailable));
        assert!(!ctl.is_enabled());
    }

    #[test]
    fn derived_count_matches_the_decrement_rate() {
        let mut ctl = probed_controller();
        ctl.platform_mut().set_lapic_counts_per_tick(300);
        ctl.calibrate_timer().unwrap();

        assert_eq!(ctl.timer_counts_per_tick(), 300);
        assert!(ctl.is_enabled());

        // Steady state after calibration: periodic mode from the derived
        // count at 1-clock granularity.
        let hw = ctl.platform();
        assert_eq!(hw.lapic_reg(LAPIC_TIMER_DCR), LAPIC_TIMER_DIV_1);
        assert_eq!(
            hw.lapic_reg(LAPIC_LVT_TIMER),
            LAPIC_TIMER_PERIODIC | TIMER_VECTOR as u32
        );
        assert_eq!(hw.lapic_reg(LAPIC_TIMER_ICR), 300);
        assert_eq!(hw.lapic_reg(LAPIC_LVT_LINT0), LINT0_VECTOR as u32);
        assert_eq!(hw.lapic_reg(LAPIC_LVT_LINT1), LINT1_VECTOR as u32);
    }

    #[test]
    fn derived_count_scales_with_the_rate() {
        let mut ctl = probed_controller();
        ctl.platform_mut().set_lapic_counts_per_tick(123);
        ctl.calibrate_timer().unwrap();
        assert_eq!(ctl.timer_counts_per_tick(), 123);
    }

    #[test]
    fn critical_sections_are_balanced() {
        let mut ctl = probed_controller();
        ctl.calibrate_timer().unwrap();
        assert_eq!(ctl.platform().irq_depth(), 0);
        assert_eq!(ctl.platform().irq_sections(), 3);
    }

    #[test]
    fn legacy_pic_is_masked_off() {
        let mut ctl = probed_controller();
        ctl.calibrate_timer().unwrap();
        assert_eq!(ctl.platform().port_writes(), [(0xA1, 0xFF), (0x21, 0xFF)]);
    }

    #[test]
    fn ioapic_lines_route_to_the_boot_processor() {
        let mut ctl = probed_controller();
        ctl.calibrate_timer().unwrap();

        // IRQ 1 routes straight to pin 1, unmasked, boot APIC id 1.
        let (low, high) = ctl.platform().ioapic_redirection(1);
        let entry = RedirectionEntry::decode(low, high);
        assert_eq!(entry.vector, 0x21);
        assert_eq!(entry.dest, 1);
        assert!(!entry.masked);

        // Every pin up to the version-reported maximum is populated.
        let (low, _) = ctl.platform().ioapic_redirection(23);
        assert_eq!(low & 0xFF, 0x20 + 23);

        // IRQ 2 is reserved for the displaced PIT line and ends masked.
        let (low, high) = ctl.platform().ioapic_redirection(2);
        let pit = RedirectionEntry::decode(low, high);
        assert!(pit.masked);
        assert_eq!(pit.dest, 1);
    }

    #[test]
    fn zero_decrement_rate_disables_the_timer() {
        let mut ctl = probed_controller();
        ctl.platform_mut().set_lapic_counts_per_tick(0);
        ctl.calibrate_timer().unwrap();

        assert_eq!(ctl.timer_counts_per_tick(), 0);
        assert!(ctl.is_enabled());
        assert_eq!(ctl.platform().lapic_reg(LAPIC_LVT_TIMER), LAPIC_LVT_MASKED);
        assert_eq!(ctl.enable_timer(), Err(ApicError::Unavailable));
    }

    #[test]
    fn timer_can_be_rearmed_and_disabled_after_calibration() {
        let mut ctl = probed_controller();
        ctl.platform_mut().set_lapic_counts_per_tick(64);
        ctl.calibrate_timer().unwrap();

        ctl.disable_timer().unwrap();
        assert_eq!(ctl.platform().lapic_reg(LAPIC_LVT_TIMER), LAPIC_LVT_MASKED);

        ctl.enable_timer().unwrap();
        assert_eq!(
            ctl.platform().lapic_reg(LAPIC_LVT_TIMER),
            LAPIC_TIMER_PERIODIC | TIMER_VECTOR as u32
        );
        assert_eq!(ctl.platform().lapic_reg(LAPIC_TIMER_ICR), 64);
    }
}
