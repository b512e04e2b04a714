//! Capability-based hardware controller.
//!
//! `HardwareController` bundles the instrument's devices, each as an optional
//! capability. Nothing is validated up front: a missing device only matters when a
//! step needs it, at which point the call fails with
//! [`DaqError::MissingCapability`]. Device failures come back as
//! [`DaqError::Hardware`].
//!
//! # Example
//!
//! ```rust,ignore
//! let hardware = HardwareController::builder()
//!     .xy(Arc::new(MockXyStage::new(recorder.clone())))
//!     .inlet(Arc::new(MockAxis::new("inlet", recorder.clone())))
//!     .voltage(pipeline.clone())
//!     .recorder(pipeline)
//!     .build();
//! ```

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tracing::debug;

use super::capabilities::{
    DataRecorder, FrameBuffer, Movable, PressureControl, VoltageSource, XyStage,
};
use crate::error::{AppResult, DaqError};

/// Instrument devices, each optional.
#[derive(Clone, Default)]
pub struct HardwareController {
    xy: Option<Arc<dyn XyStage>>,
    inlet: Option<Arc<dyn Movable>>,
    outlet: Option<Arc<dyn Movable>>,
    objective: Option<Arc<dyn Movable>>,
    voltage: Option<Arc<dyn VoltageSource>>,
    pressure: Option<Arc<dyn PressureControl>>,
    recorder: Option<Arc<dyn DataRecorder>>,
    camera: Option<Arc<dyn FrameBuffer>>,
}

impl std::fmt::Debug for HardwareController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HardwareController")
            .field("xy", &self.has_xy())
            .field("inlet", &self.has_inlet())
            .field("outlet", &self.has_outlet())
            .field("objective", &self.has_objective())
            .field("voltage", &self.has_voltage())
            .field("pressure", &self.has_pressure())
            .field("recorder", &self.recorder.is_some())
            .field("camera", &self.camera.is_some())
            .finish()
    }
}

fn hardware(op: &'static str) -> impl FnOnce(anyhow::Error) -> DaqError {
    move |e| DaqError::Hardware(e.context(op))
}

impl HardwareController {
    /// Start building a controller.
    pub fn builder() -> HardwareControllerBuilder {
        HardwareControllerBuilder::default()
    }

    #[allow(missing_docs)]
    pub fn has_xy(&self) -> bool {
        self.xy.is_some()
    }
    #[allow(missing_docs)]
    pub fn has_inlet(&self) -> bool {
        self.inlet.is_some()
    }
    #[allow(missing_docs)]
    pub fn has_outlet(&self) -> bool {
        self.outlet.is_some()
    }
    #[allow(missing_docs)]
    pub fn has_objective(&self) -> bool {
        self.objective.is_some()
    }
    #[allow(missing_docs)]
    pub fn has_voltage(&self) -> bool {
        self.voltage.is_some()
    }
    #[allow(missing_docs)]
    pub fn has_pressure(&self) -> bool {
        self.pressure.is_some()
    }

    fn xy(&self) -> AppResult<&Arc<dyn XyStage>> {
        self.xy.as_ref().ok_or(DaqError::MissingCapability("xy stage"))
    }

    fn inlet(&self) -> AppResult<&Arc<dyn Movable>> {
        self.inlet
            .as_ref()
            .ok_or(DaqError::MissingCapability("inlet axis"))
    }

    fn outlet(&self) -> AppResult<&Arc<dyn Movable>> {
        self.outlet
            .as_ref()
            .ok_or(DaqError::MissingCapability("outlet axis"))
    }

    fn objective(&self) -> AppResult<&Arc<dyn Movable>> {
        self.objective
            .as_ref()
            .ok_or(DaqError::MissingCapability("objective axis"))
    }

    fn voltage(&self) -> AppResult<&Arc<dyn VoltageSource>> {
        self.voltage
            .as_ref()
            .ok_or(DaqError::MissingCapability("voltage source"))
    }

    fn pressure(&self) -> AppResult<&Arc<dyn PressureControl>> {
        self.pressure
            .as_ref()
            .ok_or(DaqError::MissingCapability("pressure control"))
    }

    /// Current XY position.
    pub fn get_xy(&self) -> AppResult<(f64, f64)> {
        self.xy()?.position_xy().map_err(hardware("get_xy"))
    }

    /// Request an XY move.
    pub fn set_xy(&self, xy: (f64, f64)) -> AppResult<()> {
        debug!(x = xy.0, y = xy.1, "set_xy");
        self.xy()?.move_xy(xy).map_err(hardware("set_xy"))
    }

    /// Block until the XY stage settles.
    pub fn wait_xy(&self) -> AppResult<()> {
        self.xy()?.wait_settled().map_err(hardware("wait_xy"))
    }

    /// Current inlet height.
    pub fn get_z(&self) -> AppResult<f64> {
        self.inlet()?.position().map_err(hardware("get_z"))
    }

    /// Request an absolute inlet move.
    pub fn set_z(&self, z: f64) -> AppResult<()> {
        debug!(z, "set_z");
        self.inlet()?.move_abs(z).map_err(hardware("set_z"))
    }

    /// Block until the inlet settles.
    pub fn wait_z(&self) -> AppResult<()> {
        self.inlet()?.wait_settled().map_err(hardware("wait_z"))
    }

    /// Current outlet height.
    pub fn get_outlet(&self) -> AppResult<f64> {
        self.outlet()?.position().map_err(hardware("get_outlet"))
    }

    /// Request a relative outlet move.
    pub fn set_outlet(&self, relative: f64) -> AppResult<()> {
        debug!(relative, "set_outlet");
        self.outlet()?
            .move_rel(relative)
            .map_err(hardware("set_outlet"))
    }

    /// Block until the outlet settles.
    pub fn wait_outlet(&self) -> AppResult<()> {
        self.outlet()?
            .wait_settled()
            .map_err(hardware("wait_outlet"))
    }

    /// Current objective focus.
    pub fn get_objective(&self) -> AppResult<f64> {
        self.objective()?
            .position()
            .map_err(hardware("get_objective"))
    }

    /// Request an absolute objective move.
    pub fn set_objective(&self, h: f64) -> AppResult<()> {
        debug!(h, "set_objective");
        self.objective()?
            .move_abs(h)
            .map_err(hardware("set_objective"))
    }

    /// Block until the objective settles.
    pub fn wait_objective(&self) -> AppResult<()> {
        self.objective()?
            .wait_settled()
            .map_err(hardware("wait_objective"))
    }

    /// Command a voltage, ramped over `ramp` when non-zero.
    pub fn set_voltage(&self, kv: f64, ramp: Duration) -> AppResult<()> {
        debug!(kv, ramp_s = ramp.as_secs_f64(), "set_voltage");
        let source = self.voltage()?;
        if ramp.is_zero() {
            source.set_voltage(kv).map_err(hardware("set_voltage"))
        } else {
            source
                .ramp_voltage(kv, ramp)
                .map_err(hardware("ramp_voltage"))
        }
    }

    /// Drive the voltage to 0. Without a voltage source there is nothing to stop.
    pub fn stop_voltage(&self) -> AppResult<()> {
        match &self.voltage {
            Some(source) => source.stop_voltage().map_err(hardware("stop_voltage")),
            None => Ok(()),
        }
    }

    /// Open the rinse pressure line.
    pub fn pressure_rinse_start(&self) -> AppResult<()> {
        self.pressure()?
            .rinse_start()
            .map_err(hardware("pressure_rinse_start"))
    }

    /// Close the rinse pressure line. Without pressure control there is nothing to stop.
    pub fn pressure_rinse_stop(&self) -> AppResult<()> {
        match &self.pressure {
            Some(pressure) => pressure
                .rinse_stop()
                .map_err(hardware("pressure_rinse_stop")),
            None => Ok(()),
        }
    }

    /// Write the acquisition snapshot to `path`.
    pub fn save_data(&self, path: &Path) -> AppResult<()> {
        let recorder = self
            .recorder
            .as_ref()
            .ok_or(DaqError::MissingCapability("data recorder"))?;
        recorder
            .save_data(path)
            .with_context(|| format!("writing {}", path.display()))
            .map_err(hardware("save_data"))
    }

    /// Start a new data window. Without a recorder there is nothing to clear.
    pub fn clear_data(&self) -> AppResult<()> {
        match &self.recorder {
            Some(recorder) => recorder.clear_data().map_err(hardware("clear_data")),
            None => Ok(()),
        }
    }

    /// Persist the camera's recent frames.
    pub fn save_buffer(&self, dir: &Path, name: &str) -> AppResult<()> {
        let camera = self
            .camera
            .as_ref()
            .ok_or(DaqError::MissingCapability("camera"))?;
        camera
            .save_buffer(dir, name)
            .map_err(hardware("save_buffer"))
    }
}

/// Builder for [`HardwareController`].
#[derive(Default)]
pub struct HardwareControllerBuilder {
    inner: HardwareController,
}

impl HardwareControllerBuilder {
    #[allow(missing_docs)]
    pub fn xy(mut self, device: Arc<dyn XyStage>) -> Self {
        self.inner.xy = Some(device);
        self
    }
    #[allow(missing_docs)]
    pub fn inlet(mut self, device: Arc<dyn Movable>) -> Self {
        self.inner.inlet = Some(device);
        self
    }
    #[allow(missing_docs)]
    pub fn outlet(mut self, device: Arc<dyn Movable>) -> Self {
        self.inner.outlet = Some(device);
        self
    }
    #[allow(missing_docs)]
    pub fn objective(mut self, device: Arc<dyn Movable>) -> Self {
        self.inner.objective = Some(device);
        self
    }
    #[allow(missing_docs)]
    pub fn voltage(mut self, device: Arc<dyn VoltageSource>) -> Self {
        self.inner.voltage = Some(device);
        self
    }
    #[allow(missing_docs)]
    pub fn pressure(mut self, device: Arc<dyn PressureControl>) -> Self {
        self.inner.pressure = Some(device);
        self
    }
    #[allow(missing_docs)]
    pub fn recorder(mut self, device: Arc<dyn DataRecorder>) -> Self {
        self.inner.recorder = Some(device);
        self
    }
    #[allow(missing_docs)]
    pub fn camera(mut self, device: Arc<dyn FrameBuffer>) -> Self {
        self.inner.camera = Some(device);
        self
    }

    /// Finish building.
    pub fn build(self) -> HardwareController {
        self.inner
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock::{
        CallRecorder, MockAxis, MockRecorder, MockVoltageSource, MockXyStage,
    };

    #[test]
    fn missing_capability_is_reported_lazily() {
        let hw = HardwareController::builder().build();
        assert!(matches!(
            hw.set_xy((0.0, 0.0)),
            Err(DaqError::MissingCapability("xy stage"))
        ));
        assert!(matches!(
            hw.pressure_rinse_start(),
            Err(DaqError::MissingCapability("pressure control"))
        ));
        // Shutdown paths are no-ops without the device.
        assert!(hw.stop_voltage().is_ok());
        assert!(hw.pressure_rinse_stop().is_ok());
    }

    #[test]
    fn clear_data_reaches_the_recorder() {
        assert!(HardwareController::builder().build().clear_data().is_ok());

        let calls = CallRecorder::new();
        let hw = HardwareController::builder()
            .recorder(Arc::new(MockRecorder::new(calls.clone())))
            .build();
        hw.clear_data().unwrap();
        assert_eq!(calls.ops(), vec!["recorder.clear"]);

        calls.fail_once("recorder.clear");
        let err = hw.clear_data().unwrap_err();
        assert!(err.to_string().contains("clear_data"));
    }

    #[test]
    fn outlet_moves_are_relative() {
        let calls = CallRecorder::new();
        let hw = HardwareController::builder()
            .outlet(Arc::new(MockAxis::new("outlet", calls.clone())))
            .build();
        hw.set_outlet(2.0).unwrap();
        hw.set_outlet(-0.5).unwrap();
        assert_eq!(hw.get_outlet().unwrap(), 1.5);
    }

    #[test]
    fn stop_voltage_is_idempotent() {
        let calls = CallRecorder::new();
        let source = Arc::new(MockVoltageSource::new(calls.clone()));
        let hw = HardwareController::builder().voltage(source.clone()).build();

        hw.set_voltage(5.0, Duration::ZERO).unwrap();
        hw.stop_voltage().unwrap();
        hw.stop_voltage().unwrap();
        assert_eq!(source.voltage().unwrap(), 0.0);
    }

    #[test]
    fn device_failures_become_hardware_errors() {
        let calls = CallRecorder::new();
        let stage = Arc::new(MockXyStage::new(calls));
        stage.fail_next_wait();
        let hw = HardwareController::builder().xy(stage).build();
        hw.set_xy((1.0, 2.0)).unwrap();
        let err = hw.wait_xy().unwrap_err();
        assert!(matches!(err, DaqError::Hardware(_)));
        assert!(err.to_string().contains("wait_xy"));
    }
}
