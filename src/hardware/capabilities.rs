//! Atomic Hardware Capabilities
//!
//! Fine-grained capability traits that instrument devices implement. The instrument is
//! not one monolithic device: the XY stage, the inlet (Z) and outlet axes, the
//! objective focus, the high-voltage output, the pressure valves, the data recorder and
//! the camera are each a separate capability, and any of them may be absent.
//!
//! # Design
//!
//! Each capability trait:
//! - Is synchronous; calls block until the device answers
//! - Is thread-safe (requires Send + Sync) so the operator thread can read positions
//!   while the engine thread waits
//! - Uses anyhow::Result for errors
//! - Focuses on ONE thing
//!
//! Motion traits separate *requesting* a move from *waiting* for it, mirroring the axis
//! controllers: `move_abs` returns once the controller accepted the target,
//! `wait_settled` blocks until it reports motion complete.

use anyhow::Result;
use std::path::Path;
use std::time::Duration;

/// Capability: single-axis motion
///
/// Inlet (Z), outlet and objective focus axes.
///
/// # Contract
/// - Positions are in device-native units
/// - `move_abs` and `move_rel` initiate motion and may return before completion
/// - `wait_settled` blocks until motion completes
pub trait Movable: Send + Sync {
    /// Move to absolute position
    fn move_abs(&self, position: f64) -> Result<()>;

    /// Move relative to current position
    fn move_rel(&self, distance: f64) -> Result<()> {
        let current = self.position()?;
        self.move_abs(current + distance)
    }

    /// Current position (may be approximate while moving)
    fn position(&self) -> Result<f64>;

    /// Block until the axis reports motion complete
    fn wait_settled(&self) -> Result<()>;
}

/// Capability: two-axis stage
///
/// Same contract as [`Movable`], with `(x, y)` positions in µm.
pub trait XyStage: Send + Sync {
    /// Move to absolute `(x, y)`
    fn move_xy(&self, target: (f64, f64)) -> Result<()>;

    /// Current `(x, y)`
    fn position_xy(&self) -> Result<(f64, f64)>;

    /// Block until both axes report motion complete
    fn wait_settled(&self) -> Result<()>;
}

/// Capability: high-voltage output
///
/// # Contract
/// - Values are in kV; the sign selects polarity
/// - `stop_voltage` drives the output to 0 and is idempotent
pub trait VoltageSource: Send + Sync {
    /// Command a new output level
    fn set_voltage(&self, kv: f64) -> Result<()>;

    /// Command a new output level, reaching it over `ramp`
    ///
    /// Sources without ramp control jump straight to the target.
    fn ramp_voltage(&self, kv: f64, _ramp: Duration) -> Result<()> {
        self.set_voltage(kv)
    }

    /// Drive the output to 0 kV
    fn stop_voltage(&self) -> Result<()> {
        self.set_voltage(0.0)
    }

    /// Last commanded level
    fn voltage(&self) -> Result<f64>;
}

/// Capability: pressure valves
pub trait PressureControl: Send + Sync {
    /// Open the rinse pressure line
    fn rinse_start(&self) -> Result<()>;

    /// Close the rinse pressure line
    fn rinse_stop(&self) -> Result<()>;
}

/// Capability: persist the acquired signal
pub trait DataRecorder: Send + Sync {
    /// Write the current acquisition snapshot as CSV to `path`
    fn save_data(&self, path: &Path) -> Result<()>;

    /// Discard everything acquired so far, so the next `save_data` covers only what
    /// follows.
    fn clear_data(&self) -> Result<()>;
}

/// Capability: recent image buffer (camera ring buffer)
pub trait FrameBuffer: Send + Sync {
    /// Persist the recent frames under `dir` using `name` as the file stem
    fn save_buffer(&self, dir: &Path, name: &str) -> Result<()>;
}
