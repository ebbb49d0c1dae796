#![no_std]

pub mod apic;
pub mod error;
pub mod ioapic;
pub mod pic;

#[cfg(target_arch = "x86_64")]
pub mod machine;

#[cfg(test)]
mod test_fixtures;

pub use apic::InterruptController;
pub use error::{ApicError, ApicResult};
