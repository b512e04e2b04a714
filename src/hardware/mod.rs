//! Instrument hardware.
//!
//! Devices are described by the capability traits in [`capabilities`] and bundled by
//! [`HardwareController`], which is what the run engine talks to. [`mock`] provides
//! simulated devices with a shared call trace.

pub mod capabilities;
pub mod controller;
pub mod mock;

pub use capabilities::{DataRecorder, FrameBuffer, Movable, PressureControl, VoltageSource, XyStage};
pub use controller::{HardwareController, HardwareControllerBuilder};
