//! Primitive CPU instructions.

use core::arch::asm;

/// Execute the PAUSE instruction (spin-loop hint).
#[inline(always)]
pub fn pause() {
    unsafe {
        asm!("pause", options(nomem, nostack, preserves_flags));
    }
}
