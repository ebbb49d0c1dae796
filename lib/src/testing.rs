//! Simulated machine for host-side driver tests.
//!
//! [`MockPlatform`] implements [`Platform`] over an in-memory model:
//! byte-addressable physical memory, page-mapping bookkeeping, an emulated
//! Local APIC (reachable through its MMIO window or, once enabled, through
//! the x2APIC MSR block) with a deterministic count-down timer, and an
//! emulated I/O APIC select/data register pair. The mock clock advances by
//! one tick per [`Platform::relax`] call, which makes every busy-poll loop
//! in the drivers terminate deterministically.
//!
//! Contract violations (access to an unmapped address, unbalanced unmap)
//! panic so they surface as test failures rather than silent misreads.

use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use core::cell::Cell;

use styx_abi::addr::{PhysAddr, VirtAddr};
use styx_abi::arch::x86_64::apic::{
    ApicBaseMsr, LAPIC_EOI, LAPIC_TIMER_CCR, LAPIC_TIMER_ICR, LAPIC_VERSION, X2APIC_MSR_BASE,
};
use styx_abi::arch::x86_64::msr::Msr;
use styx_abi::arch::x86_64::paging::{PAGE_SIZE_4KB, PageFlags};

use crate::platform::{IrqHandlerFn, MapError, Platform};

/// Size of an emulated device register window.
const DEVICE_WINDOW: u64 = PAGE_SIZE_4KB;

/// Default version register: version 0x14 (integrated APIC), max LVT
/// entry 6.
const LAPIC_VERSION_RESET: u32 = 0x0006_0014;

/// Default I/O APIC version register: version 0x11, max redirection
/// entry 23.
const IOAPIC_VERSION_RESET: u32 = 0x0017_0011;

struct Mapping {
    virt: u64,
    phys: u64,
    bytes: u64,
}

// ---------------------------------------------------------------------------
// Emulated devices
// ---------------------------------------------------------------------------

struct MockLapic {
    regs: BTreeMap<u32, u32>,
    /// (tick at arm time, initial count) of the running countdown.
    armed: Option<(u64, u32)>,
    /// How many timer counts elapse per clock tick.
    counts_per_tick: u32,
    eoi_writes: usize,
}

impl MockLapic {
    fn new() -> Self {
        let mut regs = BTreeMap::new();
        regs.insert(LAPIC_VERSION, LAPIC_VERSION_RESET);
        Self {
            regs,
            armed: None,
            counts_per_tick: 100,
            eoi_writes: 0,
        }
    }

    fn read(&self, reg: u32, now: u64) -> u32 {
        if reg == LAPIC_TIMER_CCR {
            return match self.armed {
                Some((at, initial)) => {
                    let elapsed = now.saturating_sub(at) * self.counts_per_tick as u64;
                    initial.saturating_sub(elapsed.min(u32::MAX as u64) as u32)
                }
                None => 0,
            };
        }
        self.regs.get(&reg).copied().unwrap_or(0)
    }

    fn write(&mut self, reg: u32, value: u32, now: u64) {
        if reg == LAPIC_TIMER_ICR {
            self.armed = Some((now, value));
        }
        if reg == LAPIC_EOI {
            self.eoi_writes += 1;
        }
        self.regs.insert(reg, value);
    }
}

struct MockIoapic {
    sel: u32,
    regs: BTreeMap<u32, u32>,
}

impl MockIoapic {
    fn new() -> Self {
        let mut regs = BTreeMap::new();
        regs.insert(1, IOAPIC_VERSION_RESET);
        Self { sel: 0, regs }
    }

    fn read(&self, off: u32) -> u32 {
        match off {
            0x00 => self.sel,
            0x10 => self.regs.get(&self.sel).copied().unwrap_or(0),
            _ => 0,
        }
    }

    fn write(&mut self, off: u32, value: u32) {
        match off {
            0x00 => self.sel = value,
            0x10 => {
                self.regs.insert(self.sel, value);
            }
            _ => {}
        }
    }
}

// ---------------------------------------------------------------------------
// MockPlatform
// ---------------------------------------------------------------------------

/// A simulated machine implementing [`Platform`].
pub struct MockPlatform {
    mem: BTreeMap<u64, u8>,
    mappings: Vec<Mapping>,
    map_count: usize,
    unmap_count: usize,
    max_live: usize,
    has_apic: bool,
    has_x2apic: bool,
    msrs: BTreeMap<u32, u64>,
    port_writes: Vec<(u16, u8)>,
    installed: Vec<(u8, IrqHandlerFn)>,
    irq_depth: u32,
    irq_sections: u32,
    tick: Cell<u64>,
    lapic: Option<(u64, MockLapic)>,
    ioapic: Option<(u64, MockIoapic)>,
    x2apic_routed: bool,
}

impl MockPlatform {
    /// A machine with an APIC-capable CPU, no x2APIC, and no devices
    /// attached yet.
    pub fn new() -> Self {
        Self {
            mem: BTreeMap::new(),
            mappings: Vec::new(),
            map_count: 0,
            unmap_count: 0,
            max_live: 0,
            has_apic: true,
            has_x2apic: false,
            msrs: BTreeMap::new(),
            port_writes: Vec::new(),
            installed: Vec::new(),
            irq_depth: 0,
            irq_sections: 0,
            tick: Cell::new(0),
            lapic: None,
            ioapic: None,
            x2apic_routed: false,
        }
    }

    /// Configure the CPUID feature bits the mock reports.
    pub fn set_cpu_features(&mut self, apic: bool, x2apic: bool) {
        self.has_apic = apic;
        self.has_x2apic = x2apic;
    }

    /// Copy bytes into simulated physical memory.
    pub fn load_phys(&mut self, phys: u64, bytes: &[u8]) {
        for (i, &b) in bytes.iter().enumerate() {
            self.mem.insert(phys + i as u64, b);
        }
    }

    /// Attach an emulated Local APIC register window at `phys`.
    pub fn attach_lapic(&mut self, phys: u64) {
        self.lapic = Some((phys, MockLapic::new()));
    }

    /// Attach an emulated I/O APIC select/data window at `phys`.
    pub fn attach_ioapic(&mut self, phys: u64) {
        self.ioapic = Some((phys, MockIoapic::new()));
    }

    /// Override the emulated Local APIC version register.
    pub fn set_lapic_version(&mut self, value: u32) {
        if let Some((_, lapic)) = self.lapic.as_mut() {
            lapic.regs.insert(LAPIC_VERSION, value);
        }
    }

    /// Set how many timer counts the emulated countdown loses per clock
    /// tick.
    pub fn set_lapic_counts_per_tick(&mut self, counts: u32) {
        if let Some((_, lapic)) = self.lapic.as_mut() {
            lapic.counts_per_tick = counts;
        }
    }

    /// Direct (mapping-free) view of an emulated Local APIC register.
    pub fn lapic_reg(&self, reg: u32) -> u32 {
        let (_, lapic) = self.lapic.as_ref().expect("no Local APIC attached");
        lapic.read(reg, self.tick.get())
    }

    /// Number of writes the emulated Local APIC saw on its EOI register.
    pub fn lapic_eoi_writes(&self) -> usize {
        let (_, lapic) = self.lapic.as_ref().expect("no Local APIC attached");
        lapic.eoi_writes
    }

    /// Direct view of one I/O APIC redirection slot: (low, high) words.
    pub fn ioapic_redirection(&self, pin: u32) -> (u32, u32) {
        let (_, ioapic) = self.ioapic.as_ref().expect("no I/O APIC attached");
        let low = ioapic.regs.get(&(0x10 + pin * 2)).copied().unwrap_or(0);
        let high = ioapic.regs.get(&(0x10 + pin * 2 + 1)).copied().unwrap_or(0);
        (low, high)
    }

    /// Vectors with an installed handler, in installation order.
    pub fn installed_vectors(&self) -> Vec<u8> {
        self.installed.iter().map(|(v, _)| *v).collect()
    }

    /// Bytes written to I/O ports, in order.
    pub fn port_writes(&self) -> &[(u16, u8)] {
        &self.port_writes
    }

    /// Raw MSR cell (0 if never written).
    pub fn msr_value(&self, address: u32) -> u64 {
        self.msrs.get(&address).copied().unwrap_or(0)
    }

    /// Whether Local APIC register traffic currently flows through the
    /// x2APIC MSR block.
    pub fn x2apic_routed(&self) -> bool {
        self.x2apic_routed
    }

    /// Number of currently mapped windows.
    pub fn live_mappings(&self) -> usize {
        self.mappings.len()
    }

    /// High-water mark of simultaneously mapped windows.
    pub fn max_live_mappings(&self) -> usize {
        self.max_live
    }

    pub fn map_calls(&self) -> usize {
        self.map_count
    }

    pub fn unmap_calls(&self) -> usize {
        self.unmap_count
    }

    /// Current irqsave nesting depth (0 = interrupts notionally open).
    pub fn irq_depth(&self) -> u32 {
        self.irq_depth
    }

    /// Total number of irqsave critical sections entered.
    pub fn irq_sections(&self) -> u32 {
        self.irq_sections
    }

    fn translate(&self, virt: u64) -> u64 {
        for m in &self.mappings {
            if virt >= m.virt && virt < m.virt + m.bytes {
                return m.phys + (virt - m.virt);
            }
        }
        panic!("access to unmapped virtual address 0x{:x}", virt);
    }

    fn device_offset(base: u64, phys: u64) -> Option<u32> {
        if phys >= base && phys < base + DEVICE_WINDOW {
            Some((phys - base) as u32)
        } else {
            None
        }
    }
}

impl Default for MockPlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl Platform for MockPlatform {
    fn map(
        &mut self,
        virt: VirtAddr,
        phys: PhysAddr,
        pages: usize,
        _flags: PageFlags,
    ) -> Result<(), MapError> {
        self.map_count += 1;
        self.mappings.push(Mapping {
            virt: virt.as_u64(),
            phys: phys.as_u64(),
            bytes: pages as u64 * PAGE_SIZE_4KB,
        });
        self.max_live = self.max_live.max(self.mappings.len());
        Ok(())
    }

    fn unmap(&mut self, virt: VirtAddr, _pages: usize) {
        let idx = self
            .mappings
            .iter()
            .position(|m| m.virt == virt.as_u64())
            .expect("unmap of a window that is not mapped");
        self.mappings.remove(idx);
        self.unmap_count += 1;
    }

    fn read_u8(&self, addr: VirtAddr) -> u8 {
        let phys = self.translate(addr.as_u64());
        self.mem.get(&phys).copied().unwrap_or(0)
    }

    fn read_u32(&self, addr: VirtAddr) -> u32 {
        let phys = self.translate(addr.as_u64());
        if let Some((base, lapic)) = self.lapic.as_ref() {
            if let Some(off) = Self::device_offset(*base, phys) {
                return lapic.read(off, self.tick.get());
            }
        }
        if let Some((base, ioapic)) = self.ioapic.as_ref() {
            if let Some(off) = Self::device_offset(*base, phys) {
                return ioapic.read(off);
            }
        }
        let mut word = [0u8; 4];
        for (i, slot) in word.iter_mut().enumerate() {
            *slot = self.mem.get(&(phys + i as u64)).copied().unwrap_or(0);
        }
        u32::from_le_bytes(word)
    }

    fn write_u32(&mut self, addr: VirtAddr, value: u32) {
        let phys = self.translate(addr.as_u64());
        let now = self.tick.get();
        if let Some((base, lapic)) = self.lapic.as_mut() {
            if let Some(off) = Self::device_offset(*base, phys) {
                lapic.write(off, value, now);
                return;
            }
        }
        if let Some((base, ioapic)) = self.ioapic.as_mut() {
            if let Some(off) = Self::device_offset(*base, phys) {
                ioapic.write(off, value);
                return;
            }
        }
        for (i, b) in value.to_le_bytes().iter().enumerate() {
            self.mem.insert(phys + i as u64, *b);
        }
    }

    fn cpu_has_apic(&self) -> bool {
        self.has_apic
    }

    fn cpu_has_x2apic(&self) -> bool {
        self.has_x2apic
    }

    fn read_msr(&self, msr: Msr) -> u64 {
        let address = msr.address();
        if self.x2apic_routed && address >= X2APIC_MSR_BASE && address < X2APIC_MSR_BASE + 0x40 {
            if let Some((_, lapic)) = self.lapic.as_ref() {
                return lapic.read((address - X2APIC_MSR_BASE) * 16, self.tick.get()) as u64;
            }
        }
        self.msrs.get(&address).copied().unwrap_or(0)
    }

    fn write_msr(&mut self, msr: Msr, value: u64) {
        let address = msr.address();
        let now = self.tick.get();
        if self.x2apic_routed && address >= X2APIC_MSR_BASE && address < X2APIC_MSR_BASE + 0x40 {
            if let Some((_, lapic)) = self.lapic.as_mut() {
                lapic.write((address - X2APIC_MSR_BASE) * 16, value as u32, now);
                return;
            }
        }
        if msr == Msr::APIC_BASE && value & ApicBaseMsr::X2APIC_ENABLE != 0 {
            self.x2apic_routed = true;
        }
        self.msrs.insert(address, value);
    }

    fn outb(&mut self, port: u16, value: u8) {
        self.port_writes.push((port, value));
    }

    fn clock_tick(&self) -> u64 {
        self.tick.get()
    }

    fn relax(&self) {
        self.tick.set(self.tick.get() + 1);
    }

    fn irq_save(&mut self) -> u64 {
        self.irq_depth += 1;
        self.irq_sections += 1;
        u64::from(self.irq_depth - 1)
    }

    fn irq_restore(&mut self, _token: u64) {
        assert!(self.irq_depth > 0, "irq_restore without matching irq_save");
        self.irq_depth -= 1;
    }

    fn install_handler(&mut self, vector: u8, handler: IrqHandlerFn) {
        self.installed.push((vector, handler));
    }
}
