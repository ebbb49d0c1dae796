//! Shared fixtures: a simulated two-core machine with MP tables.

use styx_lib::testing::MockPlatform;
use styx_mptable::raw::{PROC_FLAG_BOOT, PROC_FLAG_USABLE};
use styx_mptable::testutil::MpImageBuilder;

use crate::apic::InterruptController;

pub const LAPIC_PHYS: u64 = 0xFEE0_0000;
pub const IOAPIC_PHYS: u64 = 0xFEC0_0000;
pub const FP_PHYS: u64 = 0xF6100;
pub const TABLE_PHYS: u64 = 0x9E000;

/// Two usable processors (APIC ids 0 and 1, the second one boot-flagged),
/// one I/O APIC, and ISA IRQ 0 redirected to pin 2, with both device
/// windows emulated.
pub fn machine_with_table() -> MockPlatform {
    let mut hw = MockPlatform::new();
    MpImageBuilder::new(FP_PHYS, TABLE_PHYS)
        .lapic(LAPIC_PHYS as u32)
        .processor(0, PROC_FLAG_USABLE)
        .processor(1, PROC_FLAG_USABLE | PROC_FLAG_BOOT)
        .bus(0, b"ISA   ")
        .ioapic(2, IOAPIC_PHYS as u32)
        .io_interrupt(0, 0, 2)
        .install(&mut hw);
    hw.attach_lapic(LAPIC_PHYS);
    hw.attach_ioapic(IOAPIC_PHYS);
    hw
}

/// A controller that already probed [`machine_with_table`] successfully.
pub fn probed_controller() -> InterruptController<MockPlatform> {
    let mut ctl = InterruptController::new(machine_with_table());
    ctl.probe_and_init().expect("probe must succeed on the fixture");
    ctl
}
