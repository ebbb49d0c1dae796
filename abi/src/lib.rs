//! StyxOS Hardware ABI Types
//!
//! This crate provides the canonical definitions for hardware-defined
//! values shared across the kernel: address newtypes, register offsets,
//! CPUID feature bits, MSR addresses, and page-table flags. Having a
//! single source of truth eliminates duplicate constant tables and the
//! subtle mismatches that come with them.
//!
//! Everything here is data: no instruction wrappers, no device access.

#![no_std]
#![forbid(unsafe_code)]

pub mod addr;
pub mod arch;

pub use addr::*;
