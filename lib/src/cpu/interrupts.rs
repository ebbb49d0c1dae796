//! Interrupt flag management: sti, cli, irqsave/irqrestore.

use core::arch::asm;

/// Enable interrupts (STI).
#[inline(always)]
pub fn enable_interrupts() {
    unsafe {
        asm!("sti", options(nomem, nostack));
    }
}

/// Disable interrupts (CLI).
#[inline(always)]
pub fn disable_interrupts() {
    unsafe {
        asm!("cli", options(nomem, nostack));
    }
}

/// Save RFLAGS and disable interrupts (irqsave pattern).
/// Returns the saved RFLAGS value.
#[inline(always)]
pub fn save_flags_cli() -> u64 {
    let flags: u64;
    unsafe {
        asm!(
            "pushfq",
            "pop {}",
            "cli",
            out(reg) flags,
            options(nomem)
        );
    }
    flags
}

/// Restore interrupt flag from saved RFLAGS (irqrestore pattern).
/// Only re-enables interrupts if they were enabled in the saved flags.
#[inline(always)]
pub fn restore_flags(flags: u64) {
    if flags & (1 << 9) != 0 {
        enable_interrupts();
    }
}
