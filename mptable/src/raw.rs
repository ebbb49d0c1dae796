//! MP table wire format: signatures, field offsets, and record strides.
//!
//! Byte layouts follow the Intel MultiProcessor Specification 1.4. All
//! multi-byte fields are little-endian. Offsets are used instead of
//! `#[repr(C)]` overlays because the structures are read byte-wise out of
//! mapped firmware pages that owe us no alignment.

/// `"_MP_"`: floating pointer structure signature.
pub const FLOATING_POINTER_SIGNATURE: [u8; 4] = *b"_MP_";

/// `"PCMP"`: configuration table header signature.
pub const CONFIG_TABLE_SIGNATURE: [u8; 4] = *b"PCMP";

// =============================================================================
// Floating Pointer Structure (16 bytes)
// =============================================================================

pub const FP_LEN: usize = 16;
/// Physical pointer to the configuration table (u32).
pub const FP_CONFIG_PTR: usize = 4;
/// MP specification revision (1 = 1.1, 4 = 1.4).
pub const FP_SPEC_REV: usize = 9;
/// MP feature byte 1; nonzero selects a default configuration instead of
/// a configuration table.
pub const FP_FEATURE_1: usize = 11;

/// Highest specification revision this parser accepts.
pub const FP_MAX_SPEC_REV: u8 = 4;

// =============================================================================
// Configuration Table Header (44 bytes)
// =============================================================================

pub const HEADER_LEN: usize = 44;
/// Length of the base table including the header (u16).
pub const HDR_BASE_TABLE_LENGTH: usize = 4;
/// Number of entries following the header (u16).
pub const HDR_ENTRY_COUNT: usize = 34;
/// Physical address of the Local APIC register window (u32).
pub const HDR_LAPIC_ADDR: usize = 36;

// =============================================================================
// Entries
// =============================================================================

pub const ENTRY_PROCESSOR: u8 = 0;
pub const ENTRY_BUS: u8 = 1;
pub const ENTRY_IOAPIC: u8 = 2;
pub const ENTRY_IO_INTERRUPT: u8 = 3;
pub const ENTRY_LOCAL_INTERRUPT: u8 = 4;

/// Processor entries are 20 bytes; every other record type (and any
/// unknown tag) uses the generic 8-byte stride.
pub const PROCESSOR_STRIDE: usize = 20;
pub const GENERIC_STRIDE: usize = 8;

/// Processor entry: Local APIC id.
pub const PROC_LAPIC_ID: usize = 1;
/// Processor entry: CPU flags (bit 0 usable, bit 1 boot processor).
pub const PROC_CPU_FLAGS: usize = 3;
pub const PROC_FLAG_USABLE: u8 = 0x01;
pub const PROC_FLAG_BOOT: u8 = 0x02;

/// Bus entry: bus id.
pub const BUS_ID: usize = 1;
/// Bus entry: 6-character blank-padded type string.
pub const BUS_NAME: usize = 2;
pub const BUS_NAME_LEN: usize = 6;

/// I/O APIC entry: physical base of the register window (u32).
pub const IOAPIC_ADDR: usize = 4;
/// I/O APIC entry: flags (bit 0 usable).
pub const IOAPIC_FLAGS: usize = 3;
pub const IOAPIC_FLAG_USABLE: u8 = 0x01;

/// I/O interrupt entry: source bus id.
pub const IOINT_SRC_BUS: usize = 4;
/// I/O interrupt entry: source bus IRQ.
pub const IOINT_SRC_IRQ: usize = 5;
/// I/O interrupt entry: destination I/O APIC input pin.
pub const IOINT_DEST_PIN: usize = 7;

/// Read a little-endian u16 field out of a record buffer.
#[inline]
pub fn read_u16(buf: &[u8], off: usize) -> u16 {
    u16::from_le_bytes([buf[off], buf[off + 1]])
}

/// Read a little-endian u32 field out of a record buffer.
#[inline]
pub fn read_u32(buf: &[u8], off: usize) -> u32 {
    u32::from_le_bytes([buf[off], buf[off + 1], buf[off + 2], buf[off + 3]])
}

/// Stride for a record with the given tag byte.
#[inline]
pub fn stride_for(tag: u8) -> usize {
    match tag {
        ENTRY_PROCESSOR => PROCESSOR_STRIDE,
        _ => GENERIC_STRIDE,
    }
}
