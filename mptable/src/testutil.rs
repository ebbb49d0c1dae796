//! MP table image builder for tests.
//!
//! Assembles a floating pointer and a `"PCMP"` configuration table,
//! byte-exact per the wire format in [`raw`](crate::raw), and loads both
//! into a [`MockPlatform`]'s simulated physical memory.

use alloc::vec::Vec;

use styx_lib::testing::MockPlatform;

use crate::raw;

pub struct MpImageBuilder {
    fp_phys: u64,
    table_phys: u64,
    spec_rev: u8,
    feature1: u8,
    lapic_addr: u32,
    table_signature: [u8; 4],
    entry_count_override: Option<u16>,
    entries: Vec<u8>,
    count: u16,
}

impl MpImageBuilder {
    /// A valid, empty MP 1.4 image: floating pointer at `fp_phys`,
    /// configuration table at `table_phys`, Local APIC at the
    /// architectural default.
    pub fn new(fp_phys: u64, table_phys: u64) -> Self {
        Self {
            fp_phys,
            table_phys,
            spec_rev: 4,
            feature1: 0,
            lapic_addr: 0xFEE0_0000,
            table_signature: raw::CONFIG_TABLE_SIGNATURE,
            entry_count_override: None,
            entries: Vec::new(),
            count: 0,
        }
    }

    pub fn spec_rev(mut self, rev: u8) -> Self {
        self.spec_rev = rev;
        self
    }

    pub fn feature1(mut self, value: u8) -> Self {
        self.feature1 = value;
        self
    }

    pub fn lapic(mut self, addr: u32) -> Self {
        self.lapic_addr = addr;
        self
    }

    pub fn table_signature(mut self, signature: [u8; 4]) -> Self {
        self.table_signature = signature;
        self
    }

    /// Lie about the number of entries in the header (for truncation
    /// tests).
    pub fn entry_count_override(mut self, count: u16) -> Self {
        self.entry_count_override = Some(count);
        self
    }

    pub fn processor(self, id: u8, flags: u8) -> Self {
        let mut record = [0u8; raw::PROCESSOR_STRIDE];
        record[0] = raw::ENTRY_PROCESSOR;
        record[raw::PROC_LAPIC_ID] = id;
        record[2] = 0x14; // Local APIC version
        record[raw::PROC_CPU_FLAGS] = flags;
        self.push(&record)
    }

    pub fn bus(self, id: u8, name: &[u8; raw::BUS_NAME_LEN]) -> Self {
        let mut record = [0u8; raw::GENERIC_STRIDE];
        record[0] = raw::ENTRY_BUS;
        record[raw::BUS_ID] = id;
        record[raw::BUS_NAME..raw::BUS_NAME + raw::BUS_NAME_LEN].copy_from_slice(name);
        self.push(&record)
    }

    pub fn ioapic(self, id: u8, addr: u32) -> Self {
        let mut record = [0u8; raw::GENERIC_STRIDE];
        record[0] = raw::ENTRY_IOAPIC;
        record[1] = id;
        record[2] = 0x11; // I/O APIC version
        record[raw::IOAPIC_FLAGS] = raw::IOAPIC_FLAG_USABLE;
        record[raw::IOAPIC_ADDR..raw::IOAPIC_ADDR + 4].copy_from_slice(&addr.to_le_bytes());
        self.push(&record)
    }

    pub fn io_interrupt(self, src_bus: u8, src_irq: u8, dest_pin: u8) -> Self {
        let mut record = [0u8; raw::GENERIC_STRIDE];
        record[0] = raw::ENTRY_IO_INTERRUPT;
        record[raw::IOINT_SRC_BUS] = src_bus;
        record[raw::IOINT_SRC_IRQ] = src_irq;
        record[raw::IOINT_DEST_PIN] = dest_pin;
        self.push(&record)
    }

    /// Append an arbitrary record (first byte is the tag).
    pub fn raw_record(mut self, record: &[u8]) -> Self {
        self.push_slice(record);
        self
    }

    fn push(mut self, record: &[u8]) -> Self {
        self.push_slice(record);
        self
    }

    fn push_slice(&mut self, record: &[u8]) {
        self.entries.extend_from_slice(record);
        self.count += 1;
    }

    /// The 16-byte floating pointer structure.
    pub fn floating_pointer_bytes(&self) -> [u8; raw::FP_LEN] {
        let mut fp = [0u8; raw::FP_LEN];
        fp[..4].copy_from_slice(&raw::FLOATING_POINTER_SIGNATURE);
        fp[raw::FP_CONFIG_PTR..raw::FP_CONFIG_PTR + 4]
            .copy_from_slice(&(self.table_phys as u32).to_le_bytes());
        fp[8] = 1; // structure length in 16-byte units
        fp[raw::FP_SPEC_REV] = self.spec_rev;
        fp[raw::FP_FEATURE_1] = self.feature1;
        fp
    }

    /// The configuration table: header followed by the entry stream.
    pub fn table_bytes(&self) -> Vec<u8> {
        let base_len = (raw::HEADER_LEN + self.entries.len()) as u16;
        let count = self.entry_count_override.unwrap_or(self.count);

        let mut table = Vec::with_capacity(base_len as usize);
        table.extend_from_slice(&self.table_signature);
        table.extend_from_slice(&base_len.to_le_bytes());
        table.push(self.spec_rev);
        table.push(0); // checksum
        table.extend_from_slice(b"STYXTEST"); // OEM id
        table.extend_from_slice(b"MP IMAGE    "); // product id
        table.extend_from_slice(&0u32.to_le_bytes()); // OEM table pointer
        table.extend_from_slice(&0u16.to_le_bytes()); // OEM table size
        table.extend_from_slice(&count.to_le_bytes());
        table.extend_from_slice(&self.lapic_addr.to_le_bytes());
        table.extend_from_slice(&0u16.to_le_bytes()); // extended table length
        table.push(0); // extended table checksum
        table.push(0); // reserved
        debug_assert_eq!(table.len(), raw::HEADER_LEN);
        table.extend_from_slice(&self.entries);
        table
    }

    /// Load the floating pointer and table into simulated memory.
    pub fn install(&self, hw: &mut MockPlatform) {
        hw.load_phys(self.fp_phys, &self.floating_pointer_bytes());
        hw.load_phys(self.table_phys, &self.table_bytes());
    }
}
