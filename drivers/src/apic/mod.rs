//! Local APIC driver and interrupt-controller orchestration.
//!
//! [`InterruptController`] is the single owned home of everything the
//! subsystem learns and configures at boot: the parsed machine topology,
//! the chosen Local APIC access backend, the mapped I/O APIC, and the
//! calibrated timer count. It is constructed once by the boot path and
//! handed by reference to every later caller.

mod access;
mod timer;

use styx_abi::addr::{PhysAddr, VirtAddr};
use styx_abi::arch::x86_64::apic::{
    ApicBaseMsr, LAPIC_EOI, LAPIC_ESR, LAPIC_ID, LAPIC_LVT_ERROR, LAPIC_LVT_LINT0,
    LAPIC_LVT_LINT1, LAPIC_LVT_MASKED, LAPIC_LVT_PERFCNT, LAPIC_LVT_THERMAL, LAPIC_LVT_TIMER,
    LAPIC_SPURIOUS, LAPIC_SPURIOUS_ENABLE, LAPIC_TIMER_DCR, LAPIC_TIMER_DIV_1, LAPIC_TIMER_ICR,
    LAPIC_TIMER_PERIODIC, LAPIC_TPR, LAPIC_VERSION,
};
use styx_abi::arch::x86_64::msr::Msr;
use styx_abi::arch::x86_64::paging::{PAGE_SIZE_4KB, PageFlags};
use styx_lib::platform::Platform;
use styx_lib::{klog_error, klog_info, klog_warn};
use styx_mptable::{Topology, locate_and_parse};

use crate::error::{ApicError, ApicResult};
use crate::ioapic::IoApic;
use crate::ioapic::regs::IOAPIC_MAX_IRQ;

use access::LapicAccess;

/// Fixed virtual window the Local APIC register page is mapped at.
const LAPIC_VIRT_WINDOW: u64 = 0x90000;

/// Fixed virtual window the I/O APIC register page is mapped at.
const IOAPIC_VIRT_WINDOW: u64 = 0x91000;

/// Software interrupt vectors the Local APIC sources are bound to.
const TIMER_VECTOR: u8 = 0x7B;
const LINT0_VECTOR: u8 = 0x7C;
const LINT1_VECTOR: u8 = 0x7D;
const ERROR_VECTOR: u8 = 0x7E;
const SPURIOUS_VECTOR: u8 = 0x7F;

fn apic_error_interrupt(vector: u8) {
    klog_error!("APIC: error interrupt on vector {:#x}", vector);
}

/// Owned state of the interrupt-controller subsystem.
pub struct InterruptController<P: Platform> {
    hw: P,
    topology: Topology,
    lapic: Option<LapicAccess>,
    ioapic: Option<IoApic>,
    /// Calibrated timer counts per clock tick; zero until calibration,
    /// and zero afterwards means the timer stays disabled.
    icr: u32,
    initialized: bool,
}

impl<P: Platform> InterruptController<P> {
    /// A controller that has not probed anything yet. Every operation
    /// except [`probe_and_init`](Self::probe_and_init) reports
    /// [`ApicError::Unavailable`] until probing succeeds.
    pub fn new(hw: P) -> Self {
        Self {
            hw,
            topology: Topology::fallback(PhysAddr::NULL),
            lapic: None,
            ioapic: None,
            icr: 0,
            initialized: false,
        }
    }

    /// Borrow the underlying platform services.
    pub fn platform(&self) -> &P {
        &self.hw
    }

    /// Mutably borrow the underlying platform services.
    pub fn platform_mut(&mut self) -> &mut P {
        &mut self.hw
    }

    // -----------------------------------------------------------------------
    // Boot orchestration
    // -----------------------------------------------------------------------

    /// Discover the machine's interrupt hardware and bring the Local APIC
    /// under software control.
    ///
    /// Runs the MP-table probe, maps the Local APIC (and, when present,
    /// the I/O APIC) into the fixed windows, selects the register access
    /// backend, and installs the error-vector handler. Failure leaves the
    /// controller in the single-core fallback configuration; the kernel
    /// is expected to continue without this subsystem.
    pub fn probe_and_init(&mut self) -> ApicResult<()> {
        let topology = locate_and_parse(&mut self.hw)?;

        let lapic_page = topology.lapic_phys.align_down(PAGE_SIZE_4KB);
        klog_info!("APIC: Local APIC at {:#x}", topology.lapic_phys.as_u64());
        self.hw
            .map(
                VirtAddr::new(LAPIC_VIRT_WINDOW),
                lapic_page,
                1,
                PageFlags::MMIO,
            )
            .map_err(|err| {
                klog_warn!("APIC: cannot map the Local APIC window: {}", err);
                ApicError::NoHardware
            })?;

        self.lapic = Some(if self.hw.cpu_has_x2apic() {
            klog_info!("APIC: enabling x2APIC register access");
            let base = topology.lapic_phys.as_u64() & ApicBaseMsr::ADDR_MASK;
            self.hw.write_msr(
                Msr::APIC_BASE,
                base | ApicBaseMsr::GLOBAL_ENABLE | ApicBaseMsr::X2APIC_ENABLE,
            );
            LapicAccess::Msr
        } else {
            LapicAccess::Mmio(VirtAddr::new(LAPIC_VIRT_WINDOW))
        });

        let version = self.version();
        let max_lvt = self.lvt_entry_count();
        klog_info!("APIC: version {:#x}, max LVT entry {}", version, max_lvt);

        if version >> 4 == 0 {
            klog_warn!("APIC: external 82489DX-class controllers are not supported");
            return self.abandon();
        }
        if max_lvt < 3 {
            klog_warn!("APIC: local vector table too small");
            return self.abandon();
        }

        if let Some(ioapic_phys) = topology.ioapic_phys {
            let window = VirtAddr::new(IOAPIC_VIRT_WINDOW);
            match self
                .hw
                .map(window, ioapic_phys.align_down(PAGE_SIZE_4KB), 1, PageFlags::MMIO)
            {
                Ok(()) => {
                    klog_info!(
                        "APIC: I/O APIC {:#x} mapped at {:#x}",
                        ioapic_phys.as_u64(),
                        window.as_u64()
                    );
                    self.ioapic = Some(IoApic::new(window));
                }
                Err(err) => {
                    klog_warn!("APIC: cannot map the I/O APIC window: {}", err);
                }
            }
        }

        self.hw.install_handler(ERROR_VECTOR, apic_error_interrupt);
        match (topology.boot_processor, topology.boot_processor_id()) {
            (Some(index), Some(id)) => {
                klog_info!("APIC: boot processor {} (APIC id {})", index, id);
            }
            _ => klog_info!("APIC: no boot processor record, assuming APIC id 0"),
        }

        self.topology = topology;
        Ok(())
    }

    /// Drop everything discovered so far and report absence.
    fn abandon(&mut self) -> ApicResult<()> {
        self.hw.unmap(VirtAddr::new(LAPIC_VIRT_WINDOW), 1);
        self.lapic = None;
        self.ioapic = None;
        self.topology = Topology::fallback(PhysAddr::NULL);
        Err(ApicError::NoHardware)
    }

    // -----------------------------------------------------------------------
    // Register access helpers
    // -----------------------------------------------------------------------

    fn lapic_read(&self, reg: u32) -> u32 {
        match &self.lapic {
            Some(access) => access.read(&self.hw, reg),
            None => 0,
        }
    }

    fn lapic_write(&mut self, reg: u32, value: u32) {
        if let Some(access) = &self.lapic {
            access.write(&mut self.hw, reg, value);
        }
    }

    // -----------------------------------------------------------------------
    // Derived accessors
    // -----------------------------------------------------------------------

    /// Whether probing and calibration both completed.
    pub fn is_enabled(&self) -> bool {
        self.lapic.is_some() && self.initialized
    }

    /// Signal end-of-interrupt to the Local APIC.
    pub fn end_of_interrupt(&mut self) {
        self.lapic_write(LAPIC_EOI, 0);
    }

    /// APIC id of the executing processor, 0 when the controller is not
    /// ready.
    pub fn this_cpu_id(&self) -> u32 {
        if self.is_enabled() {
            self.lapic_read(LAPIC_ID) >> 24
        } else {
            0
        }
    }

    /// Rewrite the executing processor's APIC id.
    pub fn set_cpu_id(&mut self, id: u32) {
        if self.is_enabled() {
            self.lapic_write(LAPIC_ID, id << 24);
        }
    }

    /// Local APIC version (0 when unmapped).
    pub fn version(&self) -> u32 {
        self.lapic_read(LAPIC_VERSION) & 0xFF
    }

    /// Highest local-vector-table entry the hardware implements.
    pub fn lvt_entry_count(&self) -> u32 {
        (self.lapic_read(LAPIC_VERSION) >> 16) & 0xFF
    }

    /// Error status register contents.
    pub fn error_status(&self) -> u32 {
        self.lapic_read(LAPIC_ESR)
    }

    /// Processor records the firmware declared (1 in fallback mode).
    pub fn core_count(&self) -> u32 {
        self.topology.core_count
    }

    /// Calibrated timer counts per clock tick (0 before calibration).
    pub fn timer_counts_per_tick(&self) -> u32 {
        self.icr
    }

    // -----------------------------------------------------------------------
    // Timer control
    // -----------------------------------------------------------------------

    /// Arm the timer in periodic mode from the calibrated count.
    pub fn enable_timer(&mut self) -> ApicResult<()> {
        if !self.is_enabled() || self.icr == 0 {
            return Err(ApicError::Unavailable);
        }
        self.lapic_write(LAPIC_TIMER_DCR, LAPIC_TIMER_DIV_1);
        self.lapic_write(LAPIC_LVT_TIMER, LAPIC_TIMER_PERIODIC | TIMER_VECTOR as u32);
        self.lapic_write(LAPIC_TIMER_ICR, self.icr);
        Ok(())
    }

    /// Mask the timer interrupt.
    pub fn disable_timer(&mut self) -> ApicResult<()> {
        if !self.is_enabled() {
            return Err(ApicError::Unavailable);
        }
        self.lapic_write(LAPIC_LVT_TIMER, LAPIC_LVT_MASKED);
        Ok(())
    }

    /// Put the Local APIC into its steady operating state: controller
    /// enabled on the spurious vector, all priorities open, timer armed
    /// from the calibration value (or masked while none is known),
    /// thermal and performance-counter sources masked where the LVT has
    /// slots for them, and the local pins and error source bound to
    /// their vectors.
    pub fn reset(&mut self) -> ApicResult<()> {
        if self.lapic.is_none() {
            return Err(ApicError::Unavailable);
        }
        self.reset_registers();
        Ok(())
    }

    fn reset_registers(&mut self) {
        let max_lvt = self.lvt_entry_count();

        self.lapic_write(LAPIC_SPURIOUS, LAPIC_SPURIOUS_ENABLE | SPURIOUS_VECTOR as u32);
        self.lapic_write(LAPIC_TPR, 0);
        if self.icr != 0 {
            self.lapic_write(LAPIC_TIMER_DCR, LAPIC_TIMER_DIV_1);
            self.lapic_write(LAPIC_LVT_TIMER, LAPIC_TIMER_PERIODIC | TIMER_VECTOR as u32);
            self.lapic_write(LAPIC_TIMER_ICR, self.icr);
        } else {
            self.lapic_write(LAPIC_LVT_TIMER, LAPIC_LVT_MASKED);
        }
        if max_lvt >= 4 {
            self.lapic_write(LAPIC_LVT_THERMAL, LAPIC_LVT_MASKED);
        }
        if max_lvt >= 5 {
            self.lapic_write(LAPIC_LVT_PERFCNT, LAPIC_LVT_MASKED);
        }
        self.lapic_write(LAPIC_LVT_LINT0, LINT0_VECTOR as u32);
        self.lapic_write(LAPIC_LVT_LINT1, LINT1_VECTOR as u32);
        self.lapic_write(LAPIC_LVT_ERROR, ERROR_VECTOR as u32);
    }

    // -----------------------------------------------------------------------
    // IRQ routing
    // -----------------------------------------------------------------------

    /// Route `irq` to the processor with APIC id `apic_id` and enable
    /// delivery.
    pub fn route_irq(&mut self, irq: u8, apic_id: u8) -> ApicResult<()> {
        self.program_route(irq, apic_id, false)
    }

    /// Keep `irq`'s routing in place but inhibit delivery.
    pub fn mask_irq(&mut self, irq: u8, apic_id: u8) -> ApicResult<()> {
        self.program_route(irq, apic_id, true)
    }

    fn program_route(&mut self, irq: u8, apic_id: u8, masked: bool) -> ApicResult<()> {
        if irq > IOAPIC_MAX_IRQ {
            return Err(ApicError::InvalidIrq { irq });
        }
        let Some(ioapic) = &self.ioapic else {
            return Err(ApicError::Unavailable);
        };
        ioapic.set_route(&mut self.hw, &self.topology.redirect, irq, apic_id, masked)
    }

    // -----------------------------------------------------------------------
    // Diagnostics
    // -----------------------------------------------------------------------

    /// Log the controller's current configuration.
    pub fn dump_state(&self) {
        klog_info!("=== APIC STATE ===");
        if self.lapic.is_none() {
            klog_info!("APIC: not present");
            return;
        }
        klog_info!(
            "APIC: initialized {}, cores {}, counts/tick {:#x}",
            self.initialized,
            self.topology.core_count,
            self.icr
        );
        klog_info!(
            "APIC: version {:#x}, spurious {:#x}, timer LVT {:#x}, ESR {:#x}",
            self.version(),
            self.lapic_read(LAPIC_SPURIOUS),
            self.lapic_read(LAPIC_LVT_TIMER),
            self.error_status()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_fixtures::{LAPIC_PHYS, machine_with_table, probed_controller};
    use styx_lib::testing::MockPlatform;

    #[test]
    fn absence_scenario() {
        let mut hw = MockPlatform::new();
        hw.set_cpu_features(false, false);
        let mut ctl = InterruptController::new(hw);

        assert_eq!(ctl.probe_and_init(), Err(ApicError::NoHardware));
        assert!(!ctl.is_enabled());
        assert_eq!(ctl.route_irq(5, 0), Err(ApicError::Unavailable));
        assert_eq!(ctl.enable_timer(), Err(ApicError::Unavailable));
        assert_eq!(ctl.this_cpu_id(), 0);
        assert_eq!(ctl.version(), 0);
    }

    #[test]
    fn probe_maps_lapic_and_installs_error_handler() {
        let mut ctl = probed_controller();
        assert_eq!(ctl.platform().installed_vectors(), [ERROR_VECTOR]);
        assert_eq!(ctl.version(), 0x14);
        assert_eq!(ctl.lvt_entry_count(), 6);
        assert_eq!(ctl.core_count(), 2);
        // Probed but not calibrated: timer and id queries stay inert.
        assert!(!ctl.is_enabled());
        assert_eq!(ctl.this_cpu_id(), 0);
        assert_eq!(ctl.enable_timer(), Err(ApicError::Unavailable));
        assert_eq!(ctl.disable_timer(), Err(ApicError::Unavailable));
        ctl.dump_state();
    }

    #[test]
    fn probe_without_table_uses_default_base() {
        let mut hw = MockPlatform::new();
        hw.attach_lapic(0xFEE0_0000);
        let mut ctl = InterruptController::new(hw);
        ctl.probe_and_init().unwrap();
        assert_eq!(ctl.core_count(), 1);
        assert_eq!(ctl.route_irq(1, 0), Err(ApicError::Unavailable));
    }

    #[test]
    fn probe_rejects_external_apic_version() {
        let mut hw = machine_with_table();
        hw.set_lapic_version(0x0006_0004);
        let mut ctl = InterruptController::new(hw);
        assert_eq!(ctl.probe_and_init(), Err(ApicError::NoHardware));
        assert!(!ctl.is_enabled());
        assert_eq!(ctl.platform().live_mappings(), 0);
    }

    #[test]
    fn probe_rejects_undersized_lvt() {
        let mut hw = machine_with_table();
        hw.set_lapic_version(0x0002_0014);
        let mut ctl = InterruptController::new(hw);
        assert_eq!(ctl.probe_and_init(), Err(ApicError::NoHardware));
        assert_eq!(ctl.platform().live_mappings(), 0);
    }

    #[test]
    fn x2apic_backend_goes_through_msrs() {
        let mut hw = machine_with_table();
        hw.set_cpu_features(true, true);
        let mut ctl = InterruptController::new(hw);
        ctl.probe_and_init().unwrap();

        assert!(ctl.platform().x2apic_routed());
        let base_msr = ctl.platform().msr_value(Msr::APIC_BASE.address());
        assert_eq!(base_msr & ApicBaseMsr::ADDR_MASK, LAPIC_PHYS);
        assert_ne!(base_msr & ApicBaseMsr::X2APIC_ENABLE, 0);
        assert_ne!(base_msr & ApicBaseMsr::GLOBAL_ENABLE, 0);
        // Register traffic reaches the device through the MSR block.
        assert_eq!(ctl.version(), 0x14);
        ctl.reset().unwrap();
        assert_eq!(
            ctl.platform().lapic_reg(LAPIC_SPURIOUS),
            LAPIC_SPURIOUS_ENABLE | SPURIOUS_VECTOR as u32
        );
    }

    #[test]
    fn reset_programs_the_documented_state() {
        let mut ctl = probed_controller();
        ctl.reset().unwrap();
        let hw = ctl.platform();
        assert_eq!(
            hw.lapic_reg(LAPIC_SPURIOUS),
            LAPIC_SPURIOUS_ENABLE | SPURIOUS_VECTOR as u32
        );
        assert_eq!(hw.lapic_reg(LAPIC_TPR), 0);
        // No calibration value yet: timer masked, not armed.
        assert_eq!(hw.lapic_reg(LAPIC_LVT_TIMER), LAPIC_LVT_MASKED);
        assert_eq!(hw.lapic_reg(LAPIC_LVT_THERMAL), LAPIC_LVT_MASKED);
        assert_eq!(hw.lapic_reg(LAPIC_LVT_PERFCNT), LAPIC_LVT_MASKED);
        assert_eq!(hw.lapic_reg(LAPIC_LVT_LINT0), LINT0_VECTOR as u32);
        assert_eq!(hw.lapic_reg(LAPIC_LVT_LINT1), LINT1_VECTOR as u32);
        assert_eq!(hw.lapic_reg(LAPIC_LVT_ERROR), ERROR_VECTOR as u32);
    }

    #[test]
    fn reset_before_probe_is_unavailable() {
        let mut ctl = InterruptController::new(MockPlatform::new());
        assert_eq!(ctl.reset(), Err(ApicError::Unavailable));
    }

    #[test]
    fn eoi_reaches_the_hardware() {
        let mut ctl = probed_controller();
        ctl.end_of_interrupt();
        ctl.end_of_interrupt();
        assert_eq!(ctl.platform().lapic_eoi_writes(), 2);
    }

    #[test]
    fn route_rejects_out_of_range_irq_without_hardware_access() {
        let mut ctl = probed_controller();
        let before = ctl.platform().ioapic_redirection(1);
        assert_eq!(ctl.route_irq(25, 0), Err(ApicError::InvalidIrq { irq: 25 }));
        assert_eq!(ctl.mask_irq(200, 0), Err(ApicError::InvalidIrq { irq: 200 }));
        assert_eq!(ctl.platform().ioapic_redirection(1), before);
    }

    #[test]
    fn route_round_trip() {
        use crate::ioapic::regs::RedirectionEntry;

        let mut ctl = probed_controller();
        ctl.route_irq(4, 3).unwrap();
        let (low, high) = ctl.platform().ioapic_redirection(4);
        let entry = RedirectionEntry::decode(low, high);
        assert_eq!(entry.vector, 0x24);
        assert_eq!(entry.dest, 3);
        assert!(!entry.masked);

        ctl.mask_irq(4, 3).unwrap();
        let (low_masked, high_masked) = ctl.platform().ioapic_redirection(4);
        let masked = RedirectionEntry::decode(low_masked, high_masked);
        assert_eq!(masked.vector, entry.vector);
        assert_eq!(masked.dest, entry.dest);
        assert!(masked.masked);
    }

    #[test]
    fn legacy_irq_translates_through_redirect_table() {
        // The fixture table redirects ISA IRQ 0 to pin 2.
        let mut ctl = probed_controller();
        ctl.route_irq(0, 1).unwrap();
        let (low, _) = ctl.platform().ioapic_redirection(2);
        assert_eq!(low & 0xFF, 0x20);
        // The identity slot for pin 0 stays untouched.
        assert_eq!(ctl.platform().ioapic_redirection(0), (0, 0));
    }

    #[test]
    fn high_irq_addresses_pin_directly() {
        let mut ctl = probed_controller();
        ctl.route_irq(20, 1).unwrap();
        let (low, _) = ctl.platform().ioapic_redirection(20);
        assert_eq!(low & 0xFF, 0x20 + 20);
    }

    #[test]
    fn set_cpu_id_round_trips_after_calibration() {
        let mut ctl = probed_controller();
        ctl.calibrate_timer().unwrap();
        ctl.set_cpu_id(5);
        assert_eq!(ctl.this_cpu_id(), 5);
    }
}
