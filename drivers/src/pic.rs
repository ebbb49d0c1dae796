//! Legacy 8259 PIC mask-off.

use styx_lib::platform::Platform;
use styx_lib::ports::{PIC1_DATA, PIC2_DATA};

/// Mask every line on both legacy controllers. Called once the Local
/// APIC timer is calibrated and the APIC path owns interrupt delivery.
pub fn quiesce<P: Platform>(hw: &mut P) {
    hw.outb(PIC2_DATA.number(), 0xFF);
    hw.outb(PIC1_DATA.number(), 0xFF);
}
