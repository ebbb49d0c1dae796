#![no_std]
#![allow(unsafe_op_in_unsafe_fn)]

#[cfg(any(test, feature = "testing"))]
extern crate alloc;

pub mod io;
pub mod klog;
pub mod platform;
pub mod ports;

#[cfg(target_arch = "x86_64")]
pub mod cpu;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use klog::{KlogLevel, klog_get_level, klog_register_backend, klog_set_level};
pub use platform::{IrqHandlerFn, MapError, Platform};
