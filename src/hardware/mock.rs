//! Mock Hardware Implementations
//!
//! Simulated instrument devices for tests and the `check`/demo modes of the binary.
//! Every mock writes to a shared [`CallRecorder`], so a test can assert the exact
//! order in which the engine touched the hardware across all devices.
//!
//! # Available Mocks
//!
//! - `MockAxis` - single axis (inlet, outlet, objective)
//! - `MockXyStage` - two-axis stage
//! - `MockVoltageSource` - high-voltage output
//! - `MockPressure` - rinse pressure valves
//! - `MockRecorder` - data recorder that writes a header-only CSV
//! - `MockCamera` - frame buffer that records save requests
//!
//! Motion completes instantly unless a settle time is configured.

use anyhow::{bail, Result};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::hardware::capabilities::{
    DataRecorder, FrameBuffer, Movable, PressureControl, VoltageSource, XyStage,
};

// =============================================================================
// CallRecorder - shared device trace
// =============================================================================

/// One hardware call seen by a mock.
#[derive(Debug, Clone, PartialEq)]
#[allow(missing_docs)]
pub enum Call {
    MoveAbs { device: String, target: f64 },
    MoveRel { device: String, distance: f64 },
    MoveXy { x: f64, y: f64 },
    Wait { device: String },
    SetVoltage { kv: f64 },
    RampVoltage { kv: f64, ramp_s: f64 },
    PressureStart,
    PressureStop,
    SaveData { path: PathBuf },
    ClearData,
    SaveBuffer { dir: PathBuf, name: String },
}

impl Call {
    /// Short operation name, e.g. `inlet.move_abs` or `xy.wait`.
    pub fn op(&self) -> String {
        match self {
            Call::MoveAbs { device, .. } => format!("{device}.move_abs"),
            Call::MoveRel { device, .. } => format!("{device}.move_rel"),
            Call::MoveXy { .. } => "xy.move".to_string(),
            Call::Wait { device } => format!("{device}.wait"),
            Call::SetVoltage { .. } => "voltage.set".to_string(),
            Call::RampVoltage { .. } => "voltage.ramp".to_string(),
            Call::PressureStart => "pressure.start".to_string(),
            Call::PressureStop => "pressure.stop".to_string(),
            Call::SaveData { .. } => "recorder.save".to_string(),
            Call::ClearData => "recorder.clear".to_string(),
            Call::SaveBuffer { .. } => "camera.save".to_string(),
        }
    }
}

impl fmt::Display for Call {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Call::MoveAbs { target, .. } => write!(f, "{}({target})", self.op()),
            Call::MoveRel { distance, .. } => write!(f, "{}({distance})", self.op()),
            Call::MoveXy { x, y } => write!(f, "xy.move({x}, {y})"),
            Call::SetVoltage { kv } => write!(f, "voltage.set({kv})"),
            Call::RampVoltage { kv, ramp_s } => write!(f, "voltage.ramp({kv}, {ramp_s}s)"),
            Call::SaveData { path } => write!(f, "recorder.save({})", path.display()),
            Call::SaveBuffer { name, .. } => write!(f, "camera.save({name})"),
            _ => f.write_str(&self.op()),
        }
    }
}

#[derive(Debug, Default)]
struct RecorderState {
    calls: Vec<Call>,
    fail_once: HashSet<String>,
}

/// Ordered log of calls shared by a set of mocks.
#[derive(Debug, Clone, Default)]
pub struct CallRecorder {
    state: Arc<Mutex<RecorderState>>,
}

impl CallRecorder {
    /// Empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a call. Fails if a failure was armed for this operation.
    pub fn record(&self, call: Call) -> Result<()> {
        let op = call.op();
        let mut state = self.state.lock();
        state.calls.push(call);
        if state.fail_once.remove(&op) {
            bail!("simulated failure in {op}");
        }
        Ok(())
    }

    /// Make the next call to `op` fail.
    pub fn fail_once(&self, op: impl Into<String>) {
        self.state.lock().fail_once.insert(op.into());
    }

    /// Snapshot of every call so far.
    pub fn calls(&self) -> Vec<Call> {
        self.state.lock().calls.clone()
    }

    /// Operation names in call order.
    pub fn ops(&self) -> Vec<String> {
        self.state.lock().calls.iter().map(Call::op).collect()
    }

    /// Index of the first call whose operation is `op`.
    pub fn position(&self, op: &str) -> Option<usize> {
        self.state.lock().calls.iter().position(|c| c.op() == op)
    }

    /// Number of calls whose operation is `op`.
    pub fn count(&self, op: &str) -> usize {
        self.state.lock().calls.iter().filter(|c| c.op() == op).count()
    }

    /// Forget all recorded calls.
    pub fn clear(&self) {
        self.state.lock().calls.clear();
    }
}

// =============================================================================
// Motion
// =============================================================================

/// Mock single axis.
pub struct MockAxis {
    name: String,
    position: Mutex<f64>,
    settle: Duration,
    calls: CallRecorder,
}

impl MockAxis {
    /// Axis named `name` (used as the trace prefix), starting at 0.
    pub fn new(name: impl Into<String>, calls: CallRecorder) -> Self {
        Self {
            name: name.into(),
            position: Mutex::new(0.0),
            settle: Duration::ZERO,
            calls,
        }
    }

    /// Start at `position` instead of 0.
    pub fn with_position(self, position: f64) -> Self {
        *self.position.lock() = position;
        self
    }

    /// Block for `settle` in every `wait_settled`.
    pub fn with_settle_time(mut self, settle: Duration) -> Self {
        self.settle = settle;
        self
    }
}

impl Movable for MockAxis {
    fn move_abs(&self, position: f64) -> Result<()> {
        self.calls.record(Call::MoveAbs {
            device: self.name.clone(),
            target: position,
        })?;
        *self.position.lock() = position;
        Ok(())
    }

    fn move_rel(&self, distance: f64) -> Result<()> {
        self.calls.record(Call::MoveRel {
            device: self.name.clone(),
            distance,
        })?;
        *self.position.lock() += distance;
        Ok(())
    }

    fn position(&self) -> Result<f64> {
        Ok(*self.position.lock())
    }

    fn wait_settled(&self) -> Result<()> {
        if !self.settle.is_zero() {
            std::thread::sleep(self.settle);
        }
        self.calls.record(Call::Wait {
            device: self.name.clone(),
        })
    }
}

/// Mock XY stage.
pub struct MockXyStage {
    position: Mutex<(f64, f64)>,
    calls: CallRecorder,
}

impl MockXyStage {
    /// Stage at the origin.
    pub fn new(calls: CallRecorder) -> Self {
        Self {
            position: Mutex::new((0.0, 0.0)),
            calls,
        }
    }

    /// Make the next `wait_settled` fail.
    pub fn fail_next_wait(&self) {
        self.calls.fail_once("xy.wait");
    }
}

impl XyStage for MockXyStage {
    fn move_xy(&self, target: (f64, f64)) -> Result<()> {
        self.calls.record(Call::MoveXy {
            x: target.0,
            y: target.1,
        })?;
        *self.position.lock() = target;
        Ok(())
    }

    fn position_xy(&self) -> Result<(f64, f64)> {
        Ok(*self.position.lock())
    }

    fn wait_settled(&self) -> Result<()> {
        self.calls.record(Call::Wait {
            device: "xy".to_string(),
        })
    }
}

// =============================================================================
// Outputs
// =============================================================================

/// Mock high-voltage output.
pub struct MockVoltageSource {
    level: Mutex<f64>,
    calls: CallRecorder,
}

impl MockVoltageSource {
    #[allow(missing_docs)]
    pub fn new(calls: CallRecorder) -> Self {
        Self {
            level: Mutex::new(0.0),
            calls,
        }
    }
}

impl VoltageSource for MockVoltageSource {
    fn set_voltage(&self, kv: f64) -> Result<()> {
        self.calls.record(Call::SetVoltage { kv })?;
        *self.level.lock() = kv;
        Ok(())
    }

    fn ramp_voltage(&self, kv: f64, ramp: Duration) -> Result<()> {
        self.calls.record(Call::RampVoltage {
            kv,
            ramp_s: ramp.as_secs_f64(),
        })?;
        *self.level.lock() = kv;
        Ok(())
    }

    fn voltage(&self) -> Result<f64> {
        Ok(*self.level.lock())
    }
}

/// Mock rinse pressure valves.
pub struct MockPressure {
    open: Mutex<bool>,
    calls: CallRecorder,
}

impl MockPressure {
    #[allow(missing_docs)]
    pub fn new(calls: CallRecorder) -> Self {
        Self {
            open: Mutex::new(false),
            calls,
        }
    }

    /// True while the rinse line is open.
    pub fn is_open(&self) -> bool {
        *self.open.lock()
    }
}

impl PressureControl for MockPressure {
    fn rinse_start(&self) -> Result<()> {
        self.calls.record(Call::PressureStart)?;
        *self.open.lock() = true;
        Ok(())
    }

    fn rinse_stop(&self) -> Result<()> {
        self.calls.record(Call::PressureStop)?;
        *self.open.lock() = false;
        Ok(())
    }
}

// =============================================================================
// Persistence
// =============================================================================

/// Mock data recorder; writes the CSV header only.
pub struct MockRecorder {
    calls: CallRecorder,
}

impl MockRecorder {
    #[allow(missing_docs)]
    pub fn new(calls: CallRecorder) -> Self {
        Self { calls }
    }
}

impl DataRecorder for MockRecorder {
    fn save_data(&self, path: &Path) -> Result<()> {
        self.calls.record(Call::SaveData {
            path: path.to_path_buf(),
        })?;
        std::fs::write(path, "time,rfu,kV,uA,avg,raw\n")?;
        Ok(())
    }

    fn clear_data(&self) -> Result<()> {
        self.calls.record(Call::ClearData)
    }
}

/// Mock camera ring buffer.
pub struct MockCamera {
    calls: CallRecorder,
}

impl MockCamera {
    #[allow(missing_docs)]
    pub fn new(calls: CallRecorder) -> Self {
        Self { calls }
    }
}

impl FrameBuffer for MockCamera {
    fn save_buffer(&self, dir: &Path, name: &str) -> Result<()> {
        self.calls.record(Call::SaveBuffer {
            dir: dir.to_path_buf(),
            name: name.to_string(),
        })
    }
}
