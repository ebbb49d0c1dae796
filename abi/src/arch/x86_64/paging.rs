//! Page table flags and paging constants.
//!
//! Type-safe bitflags for x86_64 page table entries, used when asking the
//! page-mapping service to bring a physical window into the address space.

use bitflags::bitflags;

/// 4KB page size.
pub const PAGE_SIZE_4KB: u64 = 0x1000;

/// 4KB page size as `usize`, for buffer arithmetic.
pub const PAGE_SIZE_4KB_USIZE: usize = 0x1000;

bitflags! {
    /// x86_64 page table entry flags.
    ///
    /// These flags control page permissions and caching behavior.
    /// Combine with the `|` operator.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct PageFlags: u64 {
        /// Page is present in memory (bit 0).
        const PRESENT       = 1 << 0;
        /// Page is writable (otherwise read-only) (bit 1).
        const WRITABLE      = 1 << 1;
        /// Page is accessible from user mode (ring 3) (bit 2).
        const USER          = 1 << 2;
        /// Write-through caching (vs write-back) (bit 3).
        const WRITE_THROUGH = 1 << 3;
        /// Disable caching for this page (bit 4).
        const CACHE_DISABLE = 1 << 4;
        /// Page is global (not flushed on CR3 change) (bit 8).
        const GLOBAL        = 1 << 8;
        /// Disable instruction fetch from this page (bit 63).
        const NO_EXECUTE    = 1 << 63;

        // =====================================================================
        // Convenience Combinations
        // =====================================================================

        /// Kernel read-write page (PRESENT | WRITABLE).
        const KERNEL_RW = Self::PRESENT.bits() | Self::WRITABLE.bits();
        /// Device register window: uncached, global, non-executable.
        const MMIO = Self::PRESENT.bits()
            | Self::WRITABLE.bits()
            | Self::CACHE_DISABLE.bits()
            | Self::GLOBAL.bits()
            | Self::NO_EXECUTE.bits();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mmio_flags_are_uncached() {
        assert!(PageFlags::MMIO.contains(PageFlags::CACHE_DISABLE));
        assert!(PageFlags::MMIO.contains(PageFlags::WRITABLE));
        assert!(!PageFlags::MMIO.contains(PageFlags::USER));
    }
}
