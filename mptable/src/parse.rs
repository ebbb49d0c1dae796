//! Two-phase configuration-table parse and the top-level probe.
//!
//! Pass one only hunts for the ISA bus id; pass two consumes the full
//! record stream with that id in hand, because interrupt-assignment
//! records may precede the bus record that makes them interpretable.

use styx_abi::addr::{PhysAddr, VirtAddr};
use styx_abi::arch::x86_64::apic::LAPIC_DEFAULT_PHYS_BASE;
use styx_abi::arch::x86_64::paging::{PAGE_SIZE_4KB, PageFlags};
use styx_lib::platform::Platform;
use styx_lib::{klog_debug, klog_info, klog_warn};

use crate::raw;
use crate::scan::find_floating_pointer;
use crate::topology::{IDENTITY_REDIRECT, MAX_CORES, ProbeError, ProcessorEntry, TableError, Topology};

/// Identity-placed window covering the whole configuration table.
/// Unmapped on every exit path via `Drop`.
struct TableWindow<'a, P: Platform> {
    hw: &'a mut P,
    page: u64,
    pages: usize,
}

impl<'a, P: Platform> TableWindow<'a, P> {
    fn map(hw: &'a mut P, phys: u64, bytes: usize) -> Result<Self, TableError> {
        let page = phys & !(PAGE_SIZE_4KB - 1);
        let span = (phys - page) as usize + bytes;
        let pages = span.div_ceil(PAGE_SIZE_4KB as usize);
        hw.map(VirtAddr::new(page), PhysAddr::new(page), pages, PageFlags::MMIO)
            .map_err(|_| TableError::Unmappable)?;
        Ok(Self { hw, page, pages })
    }

    fn read_u8(&self, phys: u64) -> u8 {
        self.hw.read_u8(VirtAddr::new(phys))
    }

    fn read(&self, phys: u64, buf: &mut [u8]) {
        self.hw.read_bytes(VirtAddr::new(phys), buf);
    }
}

impl<P: Platform> Drop for TableWindow<'_, P> {
    fn drop(&mut self) {
        self.hw.unmap(VirtAddr::new(self.page), self.pages);
    }
}

/// Walk `count` records starting at `start`, handing each tag and record
/// buffer to `visit`. A record that would run past `end` rejects the
/// stream as truncated before any of its fields are interpreted.
fn walk_entries<P, F>(
    window: &TableWindow<'_, P>,
    start: u64,
    end: u64,
    count: u32,
    mut visit: F,
) -> Result<(), TableError>
where
    P: Platform,
    F: FnMut(u8, &[u8]),
{
    let mut at = start;
    for _ in 0..count {
        if at >= end {
            return Err(TableError::Truncated);
        }
        let tag = window.read_u8(at);
        let stride = raw::stride_for(tag);
        if at + stride as u64 > end {
            return Err(TableError::Truncated);
        }
        let mut buf = [0u8; raw::PROCESSOR_STRIDE];
        window.read(at, &mut buf[..stride]);
        visit(tag, &buf[..stride]);
        at += stride as u64;
    }
    Ok(())
}

fn parse_config_table<P: Platform>(hw: &mut P, config_ptr: u32) -> Result<Topology, TableError> {
    if config_ptr == 0 {
        return Err(TableError::NullPointer);
    }
    let phys = config_ptr as u64;

    let mut header = [0u8; raw::HEADER_LEN];
    {
        let window = TableWindow::map(hw, phys, raw::HEADER_LEN)?;
        window.read(phys, &mut header);
    }

    if header[..4] != raw::CONFIG_TABLE_SIGNATURE {
        return Err(TableError::BadSignature);
    }

    let base_len = raw::read_u16(&header, raw::HDR_BASE_TABLE_LENGTH) as usize;
    let entry_count = raw::read_u16(&header, raw::HDR_ENTRY_COUNT) as u32;
    let lapic_addr = raw::read_u32(&header, raw::HDR_LAPIC_ADDR);
    if base_len < raw::HEADER_LEN {
        return Err(TableError::Truncated);
    }

    let window = TableWindow::map(hw, phys, base_len)?;
    let entries_start = (phys + raw::HEADER_LEN as u64).next_multiple_of(4);
    let table_end = phys + base_len as u64;

    // Pass 1: the ISA bus id, needed to interpret interrupt assignments.
    let mut isa_bus = None;
    walk_entries(&window, entries_start, table_end, entry_count, |tag, buf| {
        if tag == raw::ENTRY_BUS && buf[raw::BUS_NAME..raw::BUS_NAME + 3] == *b"ISA" {
            isa_bus = Some(buf[raw::BUS_ID]);
        }
    })?;

    // Pass 2: populate the registries.
    let mut processors = [None; MAX_CORES];
    let mut boot_processor = None;
    let mut core_count = 0u32;
    let mut ioapic_phys = None;
    let mut redirect = IDENTITY_REDIRECT;

    walk_entries(&window, entries_start, table_end, entry_count, |tag, buf| match tag {
        raw::ENTRY_PROCESSOR => {
            let ordinal = core_count as usize;
            if ordinal < MAX_CORES {
                let flags = buf[raw::PROC_CPU_FLAGS];
                if flags & raw::PROC_FLAG_USABLE != 0 {
                    processors[ordinal] = Some(ProcessorEntry {
                        id: buf[raw::PROC_LAPIC_ID],
                        flags,
                    });
                    if flags & raw::PROC_FLAG_BOOT != 0 {
                        boot_processor = Some(ordinal);
                    }
                }
            }
            core_count += 1;
        }
        raw::ENTRY_IOAPIC => {
            let addr = raw::read_u32(buf, raw::IOAPIC_ADDR);
            if buf[raw::IOAPIC_FLAGS] & raw::IOAPIC_FLAG_USABLE != 0 && addr != 0 {
                klog_info!("MPTABLE: I/O APIC at {:#x}", addr);
                ioapic_phys = Some(PhysAddr::new(addr as u64));
            }
        }
        raw::ENTRY_IO_INTERRUPT => {
            let src_irq = buf[raw::IOINT_SRC_IRQ];
            if isa_bus == Some(buf[raw::IOINT_SRC_BUS]) && (src_irq as usize) < redirect.len() {
                let pin = buf[raw::IOINT_DEST_PIN];
                klog_info!("MPTABLE: redirect ISA IRQ {} -> pin {}", src_irq, pin);
                redirect[src_irq as usize] = pin;
            }
        }
        _ => {}
    })?;
    drop(window);

    if core_count > MAX_CORES as u32 {
        return Err(TableError::TooManyCores { count: core_count });
    }

    Ok(Topology {
        processors,
        boot_processor,
        core_count: core_count.max(1),
        floating_pointer: None,
        ioapic_phys,
        redirect,
        lapic_phys: PhysAddr::new(lapic_addr as u64),
    })
}

/// Scan for the MP floating pointer and parse the configuration table it
/// points at.
///
/// A missing or malformed table is not an error: the machine degrades to
/// a single-core topology with the Local APIC at its architectural
/// default, provided CPUID reports APIC hardware at all. Only the complete
/// absence of a Local APIC is a failure.
pub fn locate_and_parse<P: Platform>(hw: &mut P) -> Result<Topology, ProbeError> {
    let parsed = match find_floating_pointer(hw) {
        Some(fp) => {
            klog_info!(
                "MPTABLE: floating pointer at {:#x}, MP spec 1.{}",
                fp.addr.as_u64(),
                fp.spec_rev
            );
            match parse_config_table(hw, fp.config_ptr) {
                Ok(mut topology) => {
                    topology.floating_pointer = Some(fp.addr);
                    Some(topology)
                }
                Err(reason) => {
                    klog_warn!("MPTABLE: config table rejected: {}", reason);
                    None
                }
            }
        }
        None => {
            klog_debug!("MPTABLE: no floating pointer found");
            None
        }
    };

    match parsed {
        Some(topology) => {
            if topology.lapic_phys.is_null() {
                klog_warn!("MPTABLE: table declares no Local APIC");
                return Err(ProbeError::NoLocalApic);
            }
            klog_info!("MPTABLE: {} cores", topology.core_count);
            Ok(topology)
        }
        None if hw.cpu_has_apic() => Ok(Topology::fallback(PhysAddr::new(LAPIC_DEFAULT_PHYS_BASE))),
        None => Err(ProbeError::NoLocalApic),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::MpImageBuilder;
    use styx_lib::testing::MockPlatform;

    const FP_PHYS: u64 = 0xF6100;
    const TABLE_PHYS: u64 = 0x9E000;

    #[test]
    fn no_table_no_apic_feature_fails() {
        let mut hw = MockPlatform::new();
        hw.set_cpu_features(false, false);
        assert_eq!(locate_and_parse(&mut hw), Err(ProbeError::NoLocalApic));
    }

    #[test]
    fn no_table_falls_back_to_default_base() {
        let mut hw = MockPlatform::new();
        let topology = locate_and_parse(&mut hw).unwrap();
        assert_eq!(topology.lapic_phys.as_u64(), LAPIC_DEFAULT_PHYS_BASE);
        assert_eq!(topology.core_count, 1);
        assert!(topology.ioapic_phys.is_none());
        assert!(topology.floating_pointer.is_none());
        assert_eq!(topology.redirect, IDENTITY_REDIRECT);
    }

    #[test]
    fn scan_releases_every_window() {
        let mut hw = MockPlatform::new();
        let _ = locate_and_parse(&mut hw).unwrap();
        assert_eq!(hw.live_mappings(), 0);
        assert_eq!(hw.max_live_mappings(), 1);
        assert_eq!(hw.map_calls(), hw.unmap_calls());
    }

    #[test]
    fn windows_released_on_early_match_too() {
        let mut hw = MockPlatform::new();
        MpImageBuilder::new(FP_PHYS, TABLE_PHYS)
            .processor(0, raw::PROC_FLAG_USABLE | raw::PROC_FLAG_BOOT)
            .install(&mut hw);
        let _ = locate_and_parse(&mut hw).unwrap();
        assert_eq!(hw.live_mappings(), 0);
        assert_eq!(hw.max_live_mappings(), 1);
    }

    #[test]
    fn rejects_revision_above_four_but_keeps_scanning() {
        let mut hw = MockPlatform::new();
        // A revision-5 candidate earlier in the scan order must be skipped
        // in favor of a valid one further on.
        MpImageBuilder::new(0xF0040, 0).spec_rev(5).install(&mut hw);
        MpImageBuilder::new(FP_PHYS, TABLE_PHYS)
            .processor(3, raw::PROC_FLAG_USABLE | raw::PROC_FLAG_BOOT)
            .install(&mut hw);
        let topology = locate_and_parse(&mut hw).unwrap();
        assert_eq!(topology.floating_pointer.unwrap().as_u64(), FP_PHYS);
    }

    #[test]
    fn rejects_default_configuration_feature_byte() {
        let mut hw = MockPlatform::new();
        MpImageBuilder::new(FP_PHYS, TABLE_PHYS)
            .feature1(1)
            .processor(0, raw::PROC_FLAG_USABLE)
            .install(&mut hw);
        let topology = locate_and_parse(&mut hw).unwrap();
        // Treated as absent: single-core fallback, not a parsed table.
        assert!(topology.floating_pointer.is_none());
        assert_eq!(topology.core_count, 1);
    }

    #[test]
    fn rejects_bad_table_signature_wholesale() {
        let mut hw = MockPlatform::new();
        MpImageBuilder::new(FP_PHYS, TABLE_PHYS)
            .table_signature(*b"PCMQ")
            .processor(0, raw::PROC_FLAG_USABLE | raw::PROC_FLAG_BOOT)
            .ioapic(0, 0xFEC0_0000)
            .install(&mut hw);
        let topology = locate_and_parse(&mut hw).unwrap();
        assert!(topology.floating_pointer.is_none());
        assert!(topology.ioapic_phys.is_none());
        assert_eq!(topology.core_count, 1);
    }

    #[test]
    fn two_processor_scenario() {
        let mut hw = MockPlatform::new();
        MpImageBuilder::new(FP_PHYS, TABLE_PHYS)
            .processor(0, raw::PROC_FLAG_USABLE)
            .processor(1, raw::PROC_FLAG_USABLE | raw::PROC_FLAG_BOOT)
            .bus(0, b"ISA   ")
            .ioapic(2, 0xFEC0_0000)
            .io_interrupt(0, 0, 2)
            .install(&mut hw);

        let topology = locate_and_parse(&mut hw).unwrap();
        assert_eq!(topology.core_count, 2);
        assert_eq!(topology.boot_processor, Some(1));
        assert_eq!(topology.boot_processor_id(), Some(1));
        assert_eq!(topology.ioapic_phys.unwrap().as_u64(), 0xFEC0_0000);
        assert_eq!(topology.redirect[0], 2);
        for irq in 1..16 {
            assert_eq!(topology.redirect[irq], irq as u8);
        }
    }

    #[test]
    fn isa_bus_record_after_interrupt_records_still_applies() {
        let mut hw = MockPlatform::new();
        MpImageBuilder::new(FP_PHYS, TABLE_PHYS)
            .processor(0, raw::PROC_FLAG_USABLE | raw::PROC_FLAG_BOOT)
            .io_interrupt(1, 5, 7)
            .bus(1, b"ISA   ")
            .install(&mut hw);
        let topology = locate_and_parse(&mut hw).unwrap();
        assert_eq!(topology.redirect[5], 7);
    }

    #[test]
    fn interrupt_records_for_other_buses_are_ignored() {
        let mut hw = MockPlatform::new();
        MpImageBuilder::new(FP_PHYS, TABLE_PHYS)
            .processor(0, raw::PROC_FLAG_USABLE | raw::PROC_FLAG_BOOT)
            .bus(0, b"PCI   ")
            .bus(1, b"ISA   ")
            .io_interrupt(0, 3, 9)
            .install(&mut hw);
        let topology = locate_and_parse(&mut hw).unwrap();
        assert_eq!(topology.redirect[3], 3);
    }

    #[test]
    fn unusable_processor_consumes_slot_but_is_not_retained() {
        let mut hw = MockPlatform::new();
        MpImageBuilder::new(FP_PHYS, TABLE_PHYS)
            .processor(0, 0)
            .processor(1, raw::PROC_FLAG_USABLE | raw::PROC_FLAG_BOOT)
            .install(&mut hw);
        let topology = locate_and_parse(&mut hw).unwrap();
        assert_eq!(topology.core_count, 2);
        assert!(topology.processors[0].is_none());
        assert_eq!(topology.processors[1].unwrap().id, 1);
        assert_eq!(topology.boot_processor, Some(1));
    }

    #[test]
    fn too_many_cores_falls_back_to_single_core() {
        let mut hw = MockPlatform::new();
        let mut image = MpImageBuilder::new(FP_PHYS, TABLE_PHYS);
        for id in 0..(MAX_CORES as u8 + 1) {
            image = image.processor(id, raw::PROC_FLAG_USABLE);
        }
        image.install(&mut hw);
        let topology = locate_and_parse(&mut hw).unwrap();
        assert!(topology.floating_pointer.is_none());
        assert_eq!(topology.core_count, 1);
        assert!(topology.processors.iter().all(Option::is_none));
    }

    #[test]
    fn truncated_entry_stream_rejects_table() {
        let mut hw = MockPlatform::new();
        MpImageBuilder::new(FP_PHYS, TABLE_PHYS)
            .processor(0, raw::PROC_FLAG_USABLE | raw::PROC_FLAG_BOOT)
            .entry_count_override(9)
            .install(&mut hw);
        let topology = locate_and_parse(&mut hw).unwrap();
        assert!(topology.floating_pointer.is_none());
        assert_eq!(topology.core_count, 1);
    }

    #[test]
    fn unknown_tags_use_generic_stride() {
        let mut hw = MockPlatform::new();
        MpImageBuilder::new(FP_PHYS, TABLE_PHYS)
            .raw_record(&[0x7F, 0, 0, 0, 0, 0, 0, 0])
            .processor(4, raw::PROC_FLAG_USABLE | raw::PROC_FLAG_BOOT)
            .install(&mut hw);
        let topology = locate_and_parse(&mut hw).unwrap();
        assert_eq!(topology.boot_processor_id(), Some(4));
    }

    #[test]
    fn table_without_lapic_address_is_fatal() {
        let mut hw = MockPlatform::new();
        MpImageBuilder::new(FP_PHYS, TABLE_PHYS)
            .lapic(0)
            .processor(0, raw::PROC_FLAG_USABLE | raw::PROC_FLAG_BOOT)
            .install(&mut hw);
        assert_eq!(locate_and_parse(&mut hw), Err(ProbeError::NoLocalApic));
    }

    #[test]
    fn source_irq_out_of_redirect_range_is_ignored() {
        let mut hw = MockPlatform::new();
        MpImageBuilder::new(FP_PHYS, TABLE_PHYS)
            .processor(0, raw::PROC_FLAG_USABLE | raw::PROC_FLAG_BOOT)
            .bus(0, b"ISA   ")
            .io_interrupt(0, 20, 5)
            .install(&mut hw);
        let topology = locate_and_parse(&mut hw).unwrap();
        assert_eq!(topology.redirect, IDENTITY_REDIRECT);
    }
}
