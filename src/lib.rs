//! # Capillary DAQ Core Library
//!
//! Control core for a capillary-electrophoresis / single-cell-analysis instrument. The
//! crate runs multi-step methods (Separate / Rinse / Inject) across the wells of a sample
//! plate while an acquisition thread continuously samples, decimates and buffers the
//! voltage, current and fluorescence channels.
//!
//! ## Crate Structure
//!
//! - **`engine`**: the `RunEngine` sequencer, its run handle, states and events.
//! - **`acquisition`**: the `AcquisitionPipeline` sampler thread with its decimation
//!   cascade, snapshot and CSV persistence.
//! - **`hardware`**: capability traits, the `HardwareController` that bundles them, and
//!   mock devices.
//! - **`method`**: the typed `Step` model and the projection from authoring-tool payloads.
//! - **`insert`**: sample plate model and the `WellMap` resolver.
//! - **`cancellation`**: pause / stop / inject signals shared with the operator.
//! - **`config`**: figment-based configuration loading and validation.
//! - **`storage`**: run folder and file naming.
//! - **`error`**: the `DaqError` enum used across the crate.
//! - **`tracing_setup`**: subscriber initialisation.

pub mod acquisition;
pub mod cancellation;
pub mod config;
pub mod engine;
pub mod error;
pub mod hardware;
pub mod insert;
pub mod method;
pub mod storage;
pub mod tracing_setup;

pub use acquisition::{AcquisitionPipeline, AcquisitionSnapshot};
pub use cancellation::CancellationContext;
pub use config::Settings;
pub use engine::{EngineState, RunEngine, RunEvent, RunHandle, RunReport};
pub use error::{AppResult, DaqError};
pub use hardware::HardwareController;
pub use insert::{Insert, Well, WellMap};
pub use method::{Method, RunRequest, Step};
