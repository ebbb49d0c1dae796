//! Intel MultiProcessor (MP) configuration table discovery and parsing.
//!
//! Firmware that predates ACPI describes the machine's processors, buses,
//! and interrupt controllers through the MP floating pointer structure and
//! the `"PCMP"` configuration table it points at. This crate scans the
//! conventional firmware areas for the floating pointer, walks the
//! tag-discriminated entry stream, and condenses it into an owned
//! [`Topology`] the interrupt-controller drivers consume.
//!
//! All physical memory access goes through the [`Platform`] page-mapping
//! and volatile-read services; the scanner holds at most one mapped page
//! at any time.
//!
//! [`Platform`]: styx_lib::platform::Platform

#![no_std]

#[cfg(any(test, feature = "testutil"))]
extern crate alloc;

pub mod raw;
pub mod topology;

mod parse;
mod scan;

#[cfg(any(test, feature = "testutil"))]
pub mod testutil;

pub use parse::locate_and_parse;
pub use topology::{MAX_CORES, ProbeError, ProcessorEntry, Topology};
