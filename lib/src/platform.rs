//! Platform services consumed by the interrupt-controller core.
//!
//! The surrounding kernel supplies paging, clock, vector-dispatch, and raw
//! register access; this trait is the single seam between the controller
//! and that machinery. Drivers hold one `Platform` value for the lifetime
//! of the subsystem and route every hardware touch through it, which keeps
//! the register-programming logic testable against a simulated machine
//! (see `testing::MockPlatform`).

use styx_abi::addr::{PhysAddr, VirtAddr};
use styx_abi::arch::x86_64::msr::Msr;
use styx_abi::arch::x86_64::paging::PageFlags;

use core::fmt;

/// Handler installed into the interrupt-vector dispatch table.
pub type IrqHandlerFn = fn(vector: u8);

/// Failure from the page-mapping service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapError {
    /// No mapping capacity left for another window.
    NoCapacity,
    /// The requested physical or virtual address is not mappable.
    BadAddress,
}

impl fmt::Display for MapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoCapacity => write!(f, "page mapping capacity exhausted"),
            Self::BadAddress => write!(f, "address not mappable"),
        }
    }
}

/// The services the interrupt-controller core consumes from the kernel.
///
/// Implementations must uphold two contracts:
///
/// - `map`/`unmap` are strictly paired; the core never reads or writes a
///   virtual address outside a currently mapped window.
/// - `irq_save`/`irq_restore` nest like the usual irqsave pattern: the
///   token returned by `irq_save` restores the exact prior state.
pub trait Platform {
    /// Map `pages` pages of physical memory starting at `phys` to the
    /// virtual window starting at `virt`.
    fn map(
        &mut self,
        virt: VirtAddr,
        phys: PhysAddr,
        pages: usize,
        flags: PageFlags,
    ) -> Result<(), MapError>;

    /// Unmap `pages` pages starting at the virtual address `virt`.
    fn unmap(&mut self, virt: VirtAddr, pages: usize);

    /// Volatile single-byte load from a mapped window.
    fn read_u8(&self, addr: VirtAddr) -> u8;

    /// Volatile byte-wise copy out of a mapped window.
    fn read_bytes(&self, addr: VirtAddr, buf: &mut [u8]) {
        for (i, slot) in buf.iter_mut().enumerate() {
            *slot = self.read_u8(addr.offset(i as u64));
        }
    }

    /// Volatile 32-bit load from a mapped window.
    fn read_u32(&self, addr: VirtAddr) -> u32;

    /// Volatile 32-bit store to a mapped window.
    fn write_u32(&mut self, addr: VirtAddr, value: u32);

    /// Whether CPUID reports an on-chip APIC.
    fn cpu_has_apic(&self) -> bool;

    /// Whether CPUID reports x2APIC (MSR-based register access) support.
    fn cpu_has_x2apic(&self) -> bool;

    /// RDMSR.
    fn read_msr(&self, msr: Msr) -> u64;

    /// WRMSR.
    fn write_msr(&mut self, msr: Msr, value: u64);

    /// Single-byte port write.
    fn outb(&mut self, port: u16, value: u8);

    /// Monotonic system-clock tick counter. Must already be advancing by
    /// the time timer calibration runs.
    fn clock_tick(&self) -> u64;

    /// Cooperative hint while busy-polling the clock.
    fn relax(&self);

    /// Mask local interrupt delivery, returning a token for
    /// [`Platform::irq_restore`].
    fn irq_save(&mut self) -> u64;

    /// Restore the local-interrupt state captured by the matching
    /// [`Platform::irq_save`].
    fn irq_restore(&mut self, token: u64);

    /// Bind `handler` to `vector` in the interrupt-dispatch table.
    fn install_handler(&mut self, vector: u8, handler: IrqHandlerFn);
}
