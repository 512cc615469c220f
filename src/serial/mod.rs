//! Byte sources and the event loop that multiplexes them.
//!
//! A [`SerialDevice`] is a uniform front over a TTY, a sub-process stdout, a
//! file or stdin, or an in-memory simulator. The [`SerialManager`] owns the
//! devices, runs the readiness and timer loops, and delivers `on_data` /
//! `on_disappear` callbacks with no manager lock held.

pub mod device;
pub mod manager;

pub use device::{AccessCheck, BaudRate, DeviceError, Parity, SerialDevice};
pub use manager::{SerialManager, TimerId};
