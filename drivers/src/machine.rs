//! [`Platform`] implementation backed by the real machine.
//!
//! Register and port access, CPUID feature queries, and local-interrupt
//! masking run directly on the CPU. The services that belong to other
//! subsystems (page mapping, the system clock, and vector-table
//! installation) are supplied as function hooks when the boot path
//! constructs the platform.

use core::ptr::{read_volatile, write_volatile};

use styx_abi::addr::{PhysAddr, VirtAddr};
use styx_abi::arch::x86_64::msr::Msr;
use styx_abi::arch::x86_64::paging::PageFlags;
use styx_lib::cpu;
use styx_lib::io::Port;
use styx_lib::platform::{IrqHandlerFn, MapError, Platform};

/// Hooks into the kernel services this subsystem consumes but does not
/// own.
pub struct KernelHooks {
    pub map_page: fn(VirtAddr, PhysAddr, usize, PageFlags) -> Result<(), MapError>,
    pub unmap_page: fn(VirtAddr, usize),
    pub install_handler: fn(u8, IrqHandlerFn),
    pub clock_tick: fn() -> u64,
}

pub struct HardwarePlatform {
    hooks: KernelHooks,
}

impl HardwarePlatform {
    pub fn new(hooks: KernelHooks) -> Self {
        Self { hooks }
    }
}

impl Platform for HardwarePlatform {
    fn map(
        &mut self,
        virt: VirtAddr,
        phys: PhysAddr,
        pages: usize,
        flags: PageFlags,
    ) -> Result<(), MapError> {
        (self.hooks.map_page)(virt, phys, pages, flags)
    }

    fn unmap(&mut self, virt: VirtAddr, pages: usize) {
        (self.hooks.unmap_page)(virt, pages)
    }

    fn read_u8(&self, addr: VirtAddr) -> u8 {
        unsafe { read_volatile(addr.as_u64() as *const u8) }
    }

    fn read_u32(&self, addr: VirtAddr) -> u32 {
        unsafe { read_volatile(addr.as_u64() as *const u32) }
    }

    fn write_u32(&mut self, addr: VirtAddr, value: u32) {
        unsafe { write_volatile(addr.as_u64() as *mut u32, value) }
    }

    fn cpu_has_apic(&self) -> bool {
        cpu::has_apic()
    }

    fn cpu_has_x2apic(&self) -> bool {
        cpu::has_x2apic()
    }

    fn read_msr(&self, msr: Msr) -> u64 {
        cpu::read_msr(msr)
    }

    fn write_msr(&mut self, msr: Msr, value: u64) {
        cpu::write_msr(msr, value)
    }

    fn outb(&mut self, port: u16, value: u8) {
        unsafe { Port::<u8>::new(port).write(value) }
    }

    fn clock_tick(&self) -> u64 {
        (self.hooks.clock_tick)()
    }

    fn relax(&self) {
        cpu::pause();
    }

    fn irq_save(&mut self) -> u64 {
        cpu::save_flags_cli()
    }

    fn irq_restore(&mut self, token: u64) {
        cpu::restore_flags(token)
    }

    fn install_handler(&mut self, vector: u8, handler: IrqHandlerFn) {
        (self.hooks.install_handler)(vector, handler)
    }
}
