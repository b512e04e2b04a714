//! RunEngine - sequencer for methods across repetitions.
//!
//! The RunEngine walks every step of every method of a [`RunRequest`], once per
//! repetition, on a dedicated `run-engine` thread. Each step moves the capillary into
//! place, performs its Separate / Rinse / Inject action through the
//! [`HardwareController`], and persists the acquisition snapshot into the run folder.
//!
//! # State Machine
//!
//! ```text
//! ┌──────┐   start()   ┌─────────┐  finished   ┌───────────┐
//! │ Idle │────────────▶│ Running │────────────▶│ Completed │
//! └──────┘             └────┬────┘             └───────────┘
//!                       ▲   │ pause() / single-cell injection
//!              resume() │   ▼
//!                      ┌────────┐   stop()    ┌─────────┐
//!                      │ Paused │────────────▶│ Stopped │
//!                      └────────┘             └─────────┘
//!                  any error from Running ──▶  Failed
//! ```
//!
//! Completed, Stopped and Failed are terminal; a new `start()` is accepted from any of
//! them. Only one run may be active at a time.
//!
//! # Usage
//!
//! ```rust,ignore
//! let engine = RunEngine::new(hardware, settings.engine.clone());
//! let mut events = engine.subscribe();
//! let handle = engine.start(request)?;
//!
//! // From an operator thread
//! engine.pause()?;
//! engine.resume()?;
//!
//! let report = handle.join()?;
//! println!("{} after {} steps", report.state, report.steps_completed);
//! ```

mod sequencer;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::JoinHandle;

use chrono::Local;
use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast;
use tracing::{debug, info, instrument};

use crate::cancellation::CancellationContext;
use crate::config::EngineConfig;
use crate::error::{AppResult, DaqError};
use crate::hardware::HardwareController;
use crate::insert::WellMap;
use crate::method::{RunRequest, StepKind};
use crate::storage;

use sequencer::Sequencer;

/// Engine state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// No run has been started
    Idle,
    /// Executing steps
    Running,
    /// Blocked on a pause (operator or single-cell injection)
    Paused,
    /// Every step of every repetition finished
    Completed,
    /// Ended early by `stop()`
    Stopped,
    /// Ended by an error
    Failed,
}

impl EngineState {
    /// True while a run is executing or paused.
    pub fn is_active(self) -> bool {
        matches!(self, EngineState::Running | EngineState::Paused)
    }

    /// True for Completed, Stopped and Failed.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            EngineState::Completed | EngineState::Stopped | EngineState::Failed
        )
    }
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineState::Idle => write!(f, "idle"),
            EngineState::Running => write!(f, "running"),
            EngineState::Paused => write!(f, "paused"),
            EngineState::Completed => write!(f, "completed"),
            EngineState::Stopped => write!(f, "stopped"),
            EngineState::Failed => write!(f, "failed"),
        }
    }
}

/// Stage positions captured while a single-cell injection is pending.
///
/// Fields stay `None` until recorded, or when the device is absent.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LastCellPosition {
    /// XY stage position.
    pub xy: Option<(f64, f64)>,
    /// Inlet (capillary) height.
    pub cap: Option<f64>,
    /// Objective focus.
    pub objective: Option<f64>,
}

/// Summary of a finished run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunReport {
    /// Terminal state.
    pub state: EngineState,
    /// Steps whose action ran to completion.
    pub steps_completed: usize,
    /// Data files written, in order.
    pub files: Vec<PathBuf>,
    /// Error message when `state` is Failed.
    pub error: Option<String>,
}

/// Progress notifications.
#[derive(Debug, Clone, PartialEq)]
pub enum RunEvent {
    /// The engine moved to a new state.
    StateChanged(EngineState),
    /// A step's motion prelude is about to begin.
    StepStarted {
        #[allow(missing_docs)]
        method_id: String,
        #[allow(missing_docs)]
        step_id: usize,
        #[allow(missing_docs)]
        rep: u32,
        #[allow(missing_docs)]
        kind: StepKind,
    },
    /// A step returned; `completed` is false when it was cut short by a stop.
    StepFinished {
        #[allow(missing_docs)]
        method_id: String,
        #[allow(missing_docs)]
        step_id: usize,
        #[allow(missing_docs)]
        rep: u32,
        #[allow(missing_docs)]
        completed: bool,
    },
    /// An acquisition snapshot was written.
    DataSaved(PathBuf),
    /// The run reached a terminal state.
    RunFinished(RunReport),
}

/// State shared between the engine, its handles and the sequencer thread.
pub(crate) struct EngineShared {
    state: RwLock<EngineState>,
    events: broadcast::Sender<RunEvent>,
    active: Mutex<Option<Arc<CancellationContext>>>,
    cell: Mutex<LastCellPosition>,
}

impl EngineShared {
    fn set_state(&self, next: EngineState) {
        let changed = {
            let mut state = self.state.write();
            let changed = *state != next;
            *state = next;
            changed
        };
        if changed {
            debug!(state = %next, "engine state changed");
            self.emit(RunEvent::StateChanged(next));
        }
    }

    fn emit(&self, event: RunEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn active(&self) -> AppResult<Arc<CancellationContext>> {
        self.active.lock().clone().ok_or(DaqError::NotRunning)
    }
}

/// Capture the stage positions that exist; absent devices leave their field unset.
pub(crate) fn capture_cell_position(hardware: &HardwareController) -> AppResult<LastCellPosition> {
    Ok(LastCellPosition {
        xy: hardware.has_xy().then(|| hardware.get_xy()).transpose()?,
        cap: hardware.has_inlet().then(|| hardware.get_z()).transpose()?,
        objective: hardware
            .has_objective()
            .then(|| hardware.get_objective())
            .transpose()?,
    })
}

/// Executes run requests on the instrument.
pub struct RunEngine {
    hardware: Arc<HardwareController>,
    config: EngineConfig,
    shared: Arc<EngineShared>,
}

impl RunEngine {
    /// Engine driving `hardware`.
    pub fn new(hardware: Arc<HardwareController>, config: EngineConfig) -> Self {
        let (events, _) = broadcast::channel(1024);
        Self {
            hardware,
            config,
            shared: Arc::new(EngineShared {
                state: RwLock::new(EngineState::Idle),
                events,
                active: Mutex::new(None),
                cell: Mutex::new(LastCellPosition::default()),
            }),
        }
    }

    /// Subscribe to run events.
    pub fn subscribe(&self) -> broadcast::Receiver<RunEvent> {
        self.shared.events.subscribe()
    }

    /// Current state.
    pub fn state(&self) -> EngineState {
        *self.shared.state.read()
    }

    /// True while a run is executing or paused.
    pub fn is_active(&self) -> bool {
        self.state().is_active()
    }

    /// Last recorded cell position.
    pub fn last_cell_position(&self) -> LastCellPosition {
        *self.shared.cell.lock()
    }

    /// Start executing `request` on the `run-engine` thread.
    ///
    /// # Errors
    ///
    /// - `EngineBusy` while another run is active
    /// - `Configuration` for a request without methods or repetitions, or an insert
    ///   with duplicate well labels
    /// - `Io` when the run folder cannot be created
    #[instrument(skip(self, request), fields(reps = request.repetitions, methods = request.methods.len()))]
    pub fn start(&self, request: RunRequest) -> AppResult<RunHandle> {
        if request.methods.is_empty() {
            return Err(DaqError::Configuration(
                "run request contains no methods".to_string(),
            ));
        }
        if request.repetitions == 0 {
            return Err(DaqError::Configuration(
                "run request asks for zero repetitions".to_string(),
            ));
        }

        let mut active = self.shared.active.lock();
        if active.is_some() || self.is_active() {
            return Err(DaqError::EngineBusy);
        }

        let wells = WellMap::new(&request.insert)?;
        let folder = storage::create_run_folder(&request.output_prefix, Local::now())?;
        let stem = storage::file_stem(&request.output_prefix);
        let cancellation = Arc::new(CancellationContext::new());
        *self.shared.cell.lock() = LastCellPosition::default();

        let sequencer = Sequencer {
            hardware: Arc::clone(&self.hardware),
            config: self.config.clone(),
            shared: Arc::clone(&self.shared),
            ctx: Arc::clone(&cancellation),
            wells,
            methods: request.methods,
            repetitions: request.repetitions,
            folder: folder.clone(),
            stem,
            previous: None,
            files: Vec::new(),
            steps_completed: 0,
        };

        self.shared.set_state(EngineState::Running);
        let thread = std::thread::Builder::new()
            .name("run-engine".to_string())
            .spawn(move || sequencer.run());
        let thread = match thread {
            Ok(thread) => thread,
            Err(e) => {
                self.shared.set_state(EngineState::Failed);
                return Err(DaqError::Io(e));
            }
        };
        *active = Some(Arc::clone(&cancellation));
        info!(folder = %folder.display(), "run started");

        Ok(RunHandle {
            thread: Some(thread),
            shared: Arc::clone(&self.shared),
            cancellation,
            folder,
        })
    }

    /// Ask the active run to pause at its next check.
    pub fn pause(&self) -> AppResult<()> {
        self.shared.active()?.request_pause();
        info!("pause requested");
        Ok(())
    }

    /// Clear a pause, including a single-cell injection pause.
    pub fn resume(&self) -> AppResult<()> {
        self.shared.active()?.resume();
        info!("resume requested");
        Ok(())
    }

    /// Ask the active run to stop.
    pub fn stop(&self) -> AppResult<()> {
        self.shared.active()?.request_stop();
        info!("stop requested");
        Ok(())
    }

    /// Record the current XY, inlet and objective positions for the pending
    /// single-cell injection.
    pub fn record_cell_position(&self) -> AppResult<LastCellPosition> {
        let ctx = self.shared.active()?;
        if !ctx.inject_pending() {
            return Err(DaqError::InjectionNotPending);
        }
        let position = capture_cell_position(&self.hardware)?;
        *self.shared.cell.lock() = position;
        info!(?position, "cell position recorded");
        Ok(position)
    }
}

/// Handle to one started run.
pub struct RunHandle {
    thread: Option<JoinHandle<RunReport>>,
    shared: Arc<EngineShared>,
    cancellation: Arc<CancellationContext>,
    folder: PathBuf,
}

impl RunHandle {
    /// Wait for the run to reach a terminal state.
    pub fn join(mut self) -> AppResult<RunReport> {
        let Some(thread) = self.thread.take() else {
            return Err(DaqError::EnginePanicked);
        };
        thread.join().map_err(|_| {
            *self.shared.active.lock() = None;
            self.shared.set_state(EngineState::Failed);
            DaqError::EnginePanicked
        })
    }

    /// Engine state.
    pub fn state(&self) -> EngineState {
        *self.shared.state.read()
    }

    /// True once the sequencer thread has returned.
    pub fn is_finished(&self) -> bool {
        self.thread.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Folder receiving this run's files.
    pub fn run_folder(&self) -> &Path {
        &self.folder
    }

    /// Signals of this run (pause, stop, inject, plot).
    pub fn cancellation(&self) -> &Arc<CancellationContext> {
        &self.cancellation
    }
}
