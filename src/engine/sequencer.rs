//! Step loop executed on the `run-engine` thread.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, instrument, warn};

use super::{capture_cell_position, EngineShared, EngineState, RunEvent, RunReport};
use crate::cancellation::{CancellationContext, PauseOutcome};
use crate::config::{EngineConfig, PersistPolicy};
use crate::error::{AppResult, DaqError};
use crate::hardware::HardwareController;
use crate::insert::WellMap;
use crate::method::{
    Assist, InjectDrive, Method, Polarity, RinseDrive, SeparationDrive, SingleCellMode, Step,
    StepAction, StepCommon, StepKind,
};
use crate::storage;

/// How a step or the whole run ended, short of an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Completed,
    Stopped,
}

impl Outcome {
    fn from_wait(completed: bool) -> Self {
        if completed {
            Outcome::Completed
        } else {
            Outcome::Stopped
        }
    }
}

/// Where the current step writes its files.
struct StepTarget<'a> {
    method_id: &'a str,
    step_id: usize,
    rep: u32,
}

pub(super) struct Sequencer {
    pub(super) hardware: Arc<HardwareController>,
    pub(super) config: EngineConfig,
    pub(super) shared: Arc<EngineShared>,
    pub(super) ctx: Arc<CancellationContext>,
    pub(super) wells: WellMap,
    pub(super) methods: Vec<(Method, String)>,
    pub(super) repetitions: u32,
    pub(super) folder: PathBuf,
    pub(super) stem: String,
    pub(super) previous: Option<StepKind>,
    pub(super) files: Vec<PathBuf>,
    pub(super) steps_completed: usize,
}

fn seconds(s: f64) -> Duration {
    Duration::try_from_secs_f64(s.max(0.0)).unwrap_or(Duration::ZERO)
}

fn unsupported(step: &Step, reason: &str) -> DaqError {
    DaqError::UnsupportedDrive {
        step: step.label(),
        reason: reason.to_string(),
    }
}

impl Sequencer {
    /// Run every repetition and report the terminal state.
    pub(super) fn run(mut self) -> RunReport {
        let (state, error) = match self.run_all() {
            Ok(Outcome::Completed) => {
                info!(steps = self.steps_completed, "run completed");
                (EngineState::Completed, None)
            }
            Ok(Outcome::Stopped) => {
                info!(steps = self.steps_completed, "run stopped by operator");
                (EngineState::Stopped, None)
            }
            Err(e) => (EngineState::Failed, Some(e.to_string())),
        };

        let report = RunReport {
            state,
            steps_completed: self.steps_completed,
            files: std::mem::take(&mut self.files),
            error,
        };
        *self.shared.active.lock() = None;
        self.shared.set_state(state);
        self.shared.emit(RunEvent::RunFinished(report.clone()));
        report
    }

    fn run_all(&mut self) -> AppResult<Outcome> {
        let methods = std::mem::take(&mut self.methods);
        for rep in 0..self.repetitions {
            self.ctx.set_inject_pending(false);
            info!(rep, "repetition started");
            for (method, method_id) in &methods {
                for (step_id, step) in method.steps.iter().enumerate() {
                    let target = StepTarget {
                        method_id,
                        step_id,
                        rep,
                    };
                    if self.run_one(step, &target)? == Outcome::Stopped {
                        return Ok(Outcome::Stopped);
                    }
                }
            }
        }
        Ok(Outcome::Completed)
    }

    fn run_one(&mut self, step: &Step, target: &StepTarget<'_>) -> AppResult<Outcome> {
        self.shared.emit(RunEvent::StepStarted {
            method_id: target.method_id.to_string(),
            step_id: target.step_id,
            rep: target.rep,
            kind: step.kind(),
        });

        let outcome = self.run_step(step, target).inspect_err(|e| {
            error!(
                method_id = target.method_id,
                step_id = target.step_id,
                rep = target.rep,
                summary = %step.label(),
                error = %e,
                "step failed"
            );
        })?;

        self.shared.emit(RunEvent::StepFinished {
            method_id: target.method_id.to_string(),
            step_id: target.step_id,
            rep: target.rep,
            completed: outcome == Outcome::Completed,
        });
        if outcome == Outcome::Completed {
            self.steps_completed += 1;
            info!(
                method_id = target.method_id,
                step_id = target.step_id,
                rep = target.rep,
                summary = %step.label(),
                "step completed"
            );
        }
        self.previous = Some(step.kind());
        Ok(outcome)
    }

    #[instrument(skip_all, fields(method_id = target.method_id, step_id = target.step_id, rep = target.rep, kind = %step.kind()))]
    fn run_step(&mut self, step: &Step, target: &StepTarget<'_>) -> AppResult<Outcome> {
        let started = Instant::now();

        if self.wait_if_paused() == Outcome::Stopped {
            return Ok(Outcome::Stopped);
        }

        // Raise the capillary before crossing the plate.
        self.hardware.set_z(self.config.clearance_height_mm)?;
        self.hardware.wait_z()?;

        let xy = self.resolve_well(&step.common, target.rep)?;
        self.hardware.set_xy(xy)?;
        self.hardware.wait_xy()?;

        if self.previous == Some(StepKind::Inject) {
            let elapsed = started.elapsed();
            if elapsed < self.config.inject_settle {
                let remaining = self.config.inject_settle - elapsed;
                debug!(remaining_ms = remaining.as_millis() as u64, "injection settle");
                if !self.ctx.sleep(remaining) {
                    return Ok(Outcome::Stopped);
                }
            }
        }

        self.hardware.set_outlet(step.common.outlet_travel_cm)?;
        self.hardware.wait_outlet()?;
        self.hardware.set_z(step.common.inlet_travel_mm)?;
        self.hardware.wait_z()?;

        match &step.action {
            StepAction::Separate {
                drive,
                assist,
                polarity,
                duration_s,
                ramp_time_s,
            } => self.separate(step, target, *drive, *assist, *polarity, *duration_s, *ramp_time_s),
            StepAction::Rinse {
                drive,
                direction,
                duration_s,
            } => {
                if *drive == RinseDrive::Vacuum {
                    return Err(unsupported(step, "vacuum rinse"));
                }
                debug!(?direction, duration_s, "rinse");
                self.hardware.pressure_rinse_start()?;
                // Rinses always run to the end; a stop takes effect at the next step.
                std::thread::sleep(seconds(*duration_s));
                self.hardware.pressure_rinse_stop()?;
                Ok(Outcome::Completed)
            }
            StepAction::Inject {
                drive,
                duration_s,
                single_cell,
                allow_override,
            } => self.inject(step, target, *drive, *duration_s, *single_cell, *allow_override),
            StepAction::Unconfigured => Err(DaqError::Configuration(format!(
                "step '{}' has no drive selected",
                step.label()
            ))),
        }
    }

    /// Block while paused. Returns `Stopped` when a stop arrives first.
    fn wait_if_paused(&self) -> Outcome {
        if self.ctx.is_stopped() {
            return Outcome::Stopped;
        }
        if !self.ctx.is_paused() {
            return Outcome::Completed;
        }

        self.shared.set_state(EngineState::Paused);
        info!("paused");
        let outcome = self
            .ctx
            .wait_while_paused(self.config.poll_interval, |inject_pending| {
                if inject_pending {
                    self.copy_cell_position();
                }
            });
        match outcome {
            PauseOutcome::Continue => {
                info!("resumed");
                self.shared.set_state(EngineState::Running);
                Outcome::Completed
            }
            PauseOutcome::Stopped => Outcome::Stopped,
        }
    }

    fn copy_cell_position(&self) {
        match capture_cell_position(&self.hardware) {
            Ok(position) => *self.shared.cell.lock() = position,
            Err(e) => warn!(error = %e, "could not read cell position"),
        }
    }

    fn resolve_well(&self, common: &StepCommon, rep: u32) -> AppResult<(f64, f64)> {
        let label = &common.inlet_well;
        match common.increment_every_n_cycles {
            Some(every) if every > 0 && rep + 1 > every => {
                let increment = rep / every;
                self.wells.next_well(label, increment).ok_or_else(|| {
                    DaqError::UnknownWell(format!("{label} advanced by {increment}"))
                })
            }
            _ => self
                .wells
                .well(label)
                .ok_or_else(|| DaqError::UnknownWell(label.clone())),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn separate(
        &mut self,
        step: &Step,
        target: &StepTarget<'_>,
        drive: SeparationDrive,
        assist: Assist,
        polarity: Polarity,
        duration_s: f64,
        ramp_time_s: f64,
    ) -> AppResult<Outcome> {
        let kv = match drive {
            SeparationDrive::Voltage(kv) => Some(kv),
            SeparationDrive::Pressure => None,
            SeparationDrive::Current => return Err(unsupported(step, "current-driven separation")),
            SeparationDrive::Power => return Err(unsupported(step, "power-driven separation")),
            SeparationDrive::Vacuum => return Err(unsupported(step, "vacuum-driven separation")),
        };
        match assist {
            Assist::Vacuum => return Err(unsupported(step, "vacuum assist")),
            Assist::Both => return Err(unsupported(step, "pressure and vacuum assist")),
            Assist::None | Assist::Pressure => {}
        }
        let pressure = drive == SeparationDrive::Pressure || assist == Assist::Pressure;

        // The saved file covers this step only.
        self.hardware.clear_data()?;

        let signed = kv.map(|kv| match polarity {
            Polarity::Normal => kv,
            Polarity::Reverse => -kv,
        });
        let saved = match self.energize(signed, seconds(ramp_time_s), pressure) {
            Ok(()) => {
                let completed = self.ctx.sleep(seconds(duration_s));
                let path = storage::step_file(
                    &self.folder,
                    &self.stem,
                    target.method_id,
                    target.step_id,
                    target.rep,
                );
                self.persist(completed, path).map(|()| completed)
            }
            Err(e) => Err(e),
        };
        let zeroed = self.zero_outputs();
        let completed = saved?;
        zeroed?;
        Ok(Outcome::from_wait(completed))
    }

    #[allow(clippy::too_many_arguments)]
    fn inject(
        &mut self,
        step: &Step,
        target: &StepTarget<'_>,
        drive: InjectDrive,
        duration_s: f64,
        single_cell: Option<SingleCellMode>,
        allow_override: bool,
    ) -> AppResult<Outcome> {
        let kv = match drive {
            InjectDrive::Voltage(kv) => Some(kv),
            InjectDrive::Pressure => None,
            InjectDrive::Vacuum => return Err(unsupported(step, "vacuum injection")),
        };

        match single_cell {
            Some(SingleCellMode::Auto) => {
                warn!("automatic single-cell injection is not implemented; injecting in place");
            }
            Some(SingleCellMode::Manual) => {
                if self.single_cell_manual()? == Outcome::Stopped {
                    return Ok(Outcome::Stopped);
                }
            }
            None => {}
        }
        if allow_override {
            debug!("injection allows operator override");
        }

        let waited = match self.energize(kv, Duration::ZERO, kv.is_none()) {
            Ok(()) => Ok(self.ctx.sleep(seconds(duration_s))),
            Err(e) => Err(e),
        };
        let zeroed = self.zero_outputs();
        let completed = waited?;
        zeroed?;

        if single_cell.is_some() && self.should_persist(completed) {
            let name = storage::step_name(&self.stem, target.method_id, target.step_id, target.rep);
            self.hardware.save_buffer(&self.folder, &name)?;
            info!(name = %name, "saved camera buffer");
        }
        Ok(Outcome::from_wait(completed))
    }

    /// Operator-assisted positioning: return to the last recorded cell, then pause until
    /// the operator resumes.
    fn single_cell_manual(&self) -> AppResult<Outcome> {
        if !self.ctx.begin_injection_pause() {
            return Err(DaqError::InjectionInProgress);
        }

        let cell = *self.shared.cell.lock();
        if let Some(xy) = cell.xy {
            self.hardware.set_xy(xy)?;
            self.hardware.wait_xy()?;
        }
        if let Some(z) = cell.cap {
            self.hardware.set_z(z)?;
            self.hardware.wait_z()?;
        }
        if let Some(h) = cell.objective {
            self.hardware.set_objective(h)?;
            self.hardware.wait_objective()?;
        }

        info!("single-cell injection waiting for operator");
        Ok(self.wait_if_paused())
    }

    fn energize(&self, kv: Option<f64>, ramp: Duration, pressure: bool) -> AppResult<()> {
        if let Some(kv) = kv {
            self.hardware.set_voltage(kv, ramp)?;
        }
        if pressure {
            self.hardware.pressure_rinse_start()?;
        }
        Ok(())
    }

    fn zero_outputs(&self) -> AppResult<()> {
        let voltage = self.hardware.stop_voltage();
        let pressure = self.hardware.pressure_rinse_stop();
        voltage.and(pressure)
    }

    fn should_persist(&self, completed: bool) -> bool {
        completed || self.config.persist_policy == PersistPolicy::Always
    }

    fn persist(&mut self, completed: bool, path: PathBuf) -> AppResult<()> {
        if !self.should_persist(completed) {
            debug!(path = %path.display(), "skipping data of interrupted step");
            return Ok(());
        }
        self.hardware.save_data(&path)?;
        self.shared.emit(RunEvent::DataSaved(path.clone()));
        self.files.push(path);
        Ok(())
    }
}
