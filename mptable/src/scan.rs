//! Floating-pointer scan over the firmware memory areas.

use styx_abi::addr::{PhysAddr, VirtAddr};
use styx_abi::arch::x86_64::paging::{PAGE_SIZE_4KB, PageFlags};
use styx_lib::klog_warn;
use styx_lib::platform::Platform;

use crate::raw;

/// `(base, limit)` physical ranges searched for the floating pointer: the
/// BIOS extended area and the top of conventional memory.
const SCAN_RANGES: [(u64, u64); 2] = [(0xF0000, 0x10_0000), (0x9F000, 0xA0000)];

#[derive(Clone, Copy, Debug)]
pub(crate) struct FloatingPointer {
    pub addr: PhysAddr,
    pub config_ptr: u32,
    pub spec_rev: u8,
}

/// Byte cursor over physical memory, backed by identity-placed single-page
/// windows. At most one page is mapped at any time, and the live window is
/// released on every exit path, so the mapping service sees a strict
/// map/unmap pairing no matter where the scan stops.
struct ScanCursor<'a, P: Platform> {
    hw: &'a mut P,
    window: Option<u64>,
}

impl<'a, P: Platform> ScanCursor<'a, P> {
    fn new(hw: &'a mut P) -> Self {
        Self { hw, window: None }
    }

    /// Read one byte of physical memory, sliding the window as needed.
    /// `None` means the mapping service refused the window.
    fn read_u8(&mut self, phys: u64) -> Option<u8> {
        let page = phys & !(PAGE_SIZE_4KB - 1);
        if self.window != Some(page) {
            if let Some(old) = self.window.take() {
                self.hw.unmap(VirtAddr::new(old), 1);
            }
            if self
                .hw
                .map(VirtAddr::new(page), PhysAddr::new(page), 1, PageFlags::MMIO)
                .is_err()
            {
                klog_warn!("MPTABLE: cannot map scan window at {:#x}", page);
                return None;
            }
            self.window = Some(page);
        }
        Some(self.hw.read_u8(VirtAddr::new(phys)))
    }

    fn read_u32(&mut self, phys: u64) -> Option<u32> {
        let mut word = [0u8; 4];
        for (i, slot) in word.iter_mut().enumerate() {
            *slot = self.read_u8(phys + i as u64)?;
        }
        Some(u32::from_le_bytes(word))
    }

    fn matches_signature(&mut self, phys: u64, signature: &[u8; 4]) -> Option<bool> {
        for (i, expected) in signature.iter().enumerate() {
            if self.read_u8(phys + i as u64)? != *expected {
                return Some(false);
            }
        }
        Some(true)
    }
}

impl<P: Platform> Drop for ScanCursor<'_, P> {
    fn drop(&mut self) {
        if let Some(page) = self.window.take() {
            self.hw.unmap(VirtAddr::new(page), 1);
        }
    }
}

/// Byte-by-byte search for an acceptable floating pointer structure.
///
/// Candidates whose revision exceeds 1.4 or whose first feature byte is
/// nonzero (a default configuration, with no table to parse) are skipped and
/// the scan continues. A mapping failure aborts the scan and reports
/// absence.
pub(crate) fn find_floating_pointer<P: Platform>(hw: &mut P) -> Option<FloatingPointer> {
    let mut cursor = ScanCursor::new(hw);

    for (base, limit) in SCAN_RANGES {
        let mut ptr = base;
        while ptr + 4 <= limit {
            if cursor.matches_signature(ptr, &raw::FLOATING_POINTER_SIGNATURE)? {
                let spec_rev = cursor.read_u8(ptr + raw::FP_SPEC_REV as u64)?;
                let feature1 = cursor.read_u8(ptr + raw::FP_FEATURE_1 as u64)?;
                if spec_rev <= raw::FP_MAX_SPEC_REV && feature1 == 0 {
                    let config_ptr = cursor.read_u32(ptr + raw::FP_CONFIG_PTR as u64)?;
                    return Some(FloatingPointer {
                        addr: PhysAddr::new(ptr),
                        config_ptr,
                        spec_rev,
                    });
                }
            }
            ptr += 1;
        }
    }

    None
}
