//! Reference peripherals for the virtual bus.
//!
//! Each device covers one or more bus capabilities so hosts have working parts to start from:
//!
//! - [`Ram`] / [`Rom`]: word memories
//! - [`SerialConsole`]: byte console with an `rx` interrupt
//! - [`InterruptLatch`]: interrupt sink that records deliveries
//! - [`ScriptedCpu`]: processor stand-in driven by a queue of [`BusOp`]s
//! - [`Cable`]: topology node linking elements and carrying devices

#![forbid(unsafe_code)]

mod cable;
mod common;
mod cpu;
mod latch;
mod memory;
pub mod serial;

pub use cable::Cable;
pub use common::{DeviceCore, Placement};
pub use cpu::{BusOp, OpResult, ScriptedCpu};
pub use latch::{InterruptLatch, Latched};
pub use memory::{Ram, Rom};
pub use serial::SerialConsole;
