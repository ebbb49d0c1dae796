//! CPU feature detection via the CPUID instruction.

use styx_abi::arch::x86_64::cpuid::{
    CPUID_FEAT_ECX_X2APIC, CPUID_FEAT_EDX_APIC, CPUID_LEAF_FEATURES,
};

/// Execute CPUID with the given leaf (subleaf defaults to 0).
/// Returns (eax, ebx, ecx, edx).
#[inline(always)]
#[allow(unused_unsafe)]
pub fn cpuid(leaf: u32) -> (u32, u32, u32, u32) {
    let res = unsafe { core::arch::x86_64::__cpuid(leaf) };
    (res.eax, res.ebx, res.ecx, res.edx)
}

/// Whether the processor reports an on-chip APIC.
#[inline]
pub fn has_apic() -> bool {
    let (_, _, _, edx) = cpuid(CPUID_LEAF_FEATURES);
    edx & CPUID_FEAT_EDX_APIC != 0
}

/// Whether the processor reports x2APIC support.
#[inline]
pub fn has_x2apic() -> bool {
    let (_, _, ecx, _) = cpuid(CPUID_LEAF_FEATURES);
    ecx & CPUID_FEAT_ECX_X2APIC != 0
}
