pub mod x86_64;

pub use x86_64::Msr;
pub use x86_64::apic::ApicBaseMsr;
pub use x86_64::paging::PageFlags;
