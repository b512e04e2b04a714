//! Method and Step definitions
//!
//! A `Method` is the chemistry of one run: an ordered list of `Step`s. Each step is a
//! tagged union over Separate / Rinse / Inject (plus `Unconfigured` for payloads the
//! authoring tool left empty), with the motion parameters shared by every variant
//! held in [`StepCommon`].
//!
//! Drive/assist combinations the instrument cannot run are representable here on
//! purpose; they are rejected when the engine dispatches the step.

pub mod payload;

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::AppResult;
use crate::insert::Insert;

/// Fields shared by every step variant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepCommon {
    /// Well the capillary inlet is dipped into.
    pub inlet_well: String,
    /// Well the outlet sits in.
    pub outlet_well: String,
    /// Absolute inlet height for the action.
    pub inlet_travel_mm: f64,
    /// Relative outlet move for the action.
    pub outlet_travel_cm: f64,
    /// Advance the inlet well every `n` repetitions.
    pub increment_every_n_cycles: Option<u32>,
    /// Human-readable description, used in logs.
    pub summary: String,
}

impl StepCommon {
    /// Common fields with no motion and no well increment.
    pub fn at_well(inlet_well: impl Into<String>) -> Self {
        Self {
            inlet_well: inlet_well.into(),
            outlet_well: String::new(),
            inlet_travel_mm: 0.0,
            outlet_travel_cm: 0.0,
            increment_every_n_cycles: None,
            summary: String::new(),
        }
    }
}

/// How a separation is driven.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum SeparationDrive {
    /// Constant voltage, in kV.
    Voltage(f64),
    /// Constant current.
    Current,
    /// Constant power.
    Power,
    /// Pressure only.
    Pressure,
    /// Vacuum only.
    Vacuum,
}

/// Pressure assist applied alongside the separation drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Assist {
    #[allow(missing_docs)]
    #[default]
    None,
    #[allow(missing_docs)]
    Pressure,
    #[allow(missing_docs)]
    Vacuum,
    /// Pressure and vacuum together.
    Both,
}

/// High-voltage polarity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Polarity {
    #[allow(missing_docs)]
    #[default]
    Normal,
    #[allow(missing_docs)]
    Reverse,
}

/// How a rinse is driven.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RinseDrive {
    #[allow(missing_docs)]
    Pressure,
    #[allow(missing_docs)]
    Vacuum,
}

/// Flow direction of a rinse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum RinseDirection {
    #[allow(missing_docs)]
    #[default]
    Forward,
    #[allow(missing_docs)]
    Reverse,
}

/// How an injection is driven.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum InjectDrive {
    /// Electrokinetic injection, in kV.
    Voltage(f64),
    /// Hydrodynamic injection.
    Pressure,
    /// Vacuum injection.
    Vacuum,
}

/// Single-cell gating of an injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SingleCellMode {
    /// Automated cell finding (not available on this instrument).
    Auto,
    /// Operator positions the capillary over the cell, then resumes.
    Manual,
}

/// Variant-specific part of a step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StepAction {
    /// Apply voltage and/or pressure for a duration.
    Separate {
        #[allow(missing_docs)]
        drive: SeparationDrive,
        #[allow(missing_docs)]
        assist: Assist,
        #[allow(missing_docs)]
        polarity: Polarity,
        #[allow(missing_docs)]
        duration_s: f64,
        #[allow(missing_docs)]
        ramp_time_s: f64,
    },
    /// Flush the capillary.
    Rinse {
        #[allow(missing_docs)]
        drive: RinseDrive,
        #[allow(missing_docs)]
        direction: RinseDirection,
        #[allow(missing_docs)]
        duration_s: f64,
    },
    /// Load sample at the inlet.
    Inject {
        #[allow(missing_docs)]
        drive: InjectDrive,
        #[allow(missing_docs)]
        duration_s: f64,
        #[allow(missing_docs)]
        single_cell: Option<SingleCellMode>,
        #[allow(missing_docs)]
        allow_override: bool,
    },
    /// Payload without any drive selected.
    Unconfigured,
}

/// Discriminant of [`StepAction`], used to remember the previous step's type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StepKind {
    #[allow(missing_docs)]
    Separate,
    #[allow(missing_docs)]
    Rinse,
    #[allow(missing_docs)]
    Inject,
    #[allow(missing_docs)]
    Unconfigured,
}

impl std::fmt::Display for StepKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StepKind::Separate => write!(f, "separate"),
            StepKind::Rinse => write!(f, "rinse"),
            StepKind::Inject => write!(f, "inject"),
            StepKind::Unconfigured => write!(f, "unconfigured"),
        }
    }
}

/// One step of a method.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    /// Motion parameters and labels.
    pub common: StepCommon,
    /// What the step does once the capillary is in place.
    pub action: StepAction,
}

impl Step {
    /// Variant of this step.
    pub fn kind(&self) -> StepKind {
        match self.action {
            StepAction::Separate { .. } => StepKind::Separate,
            StepAction::Rinse { .. } => StepKind::Rinse,
            StepAction::Inject { .. } => StepKind::Inject,
            StepAction::Unconfigured => StepKind::Unconfigured,
        }
    }

    /// Summary if one was given, otherwise the step kind.
    pub fn label(&self) -> String {
        if self.common.summary.is_empty() {
            self.kind().to_string()
        } else {
            self.common.summary.clone()
        }
    }

    /// Voltage separation with no assist.
    pub fn separate_voltage(inlet_well: &str, kv: f64, duration_s: f64) -> Self {
        Self {
            common: StepCommon::at_well(inlet_well),
            action: StepAction::Separate {
                drive: SeparationDrive::Voltage(kv),
                assist: Assist::None,
                polarity: Polarity::Normal,
                duration_s,
                ramp_time_s: 0.0,
            },
        }
    }

    /// Forward pressure rinse.
    pub fn rinse(inlet_well: &str, duration_s: f64) -> Self {
        Self {
            common: StepCommon::at_well(inlet_well),
            action: StepAction::Rinse {
                drive: RinseDrive::Pressure,
                direction: RinseDirection::Forward,
                duration_s,
            },
        }
    }

    /// Injection without single-cell gating.
    pub fn inject(inlet_well: &str, drive: InjectDrive, duration_s: f64) -> Self {
        Self {
            common: StepCommon::at_well(inlet_well),
            action: StepAction::Inject {
                drive,
                duration_s,
                single_cell: None,
                allow_override: false,
            },
        }
    }

    /// Replace the common fields.
    pub fn with_common(mut self, common: StepCommon) -> Self {
        self.common = common;
        self
    }
}

/// Ordered list of steps; insertion order is execution order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Method {
    /// Steps in execution order.
    pub steps: Vec<Step>,
}

impl Method {
    /// Method from already typed steps.
    pub fn new(steps: Vec<Step>) -> Self {
        Self { steps }
    }

    /// Load a method exported by the authoring tool: a JSON array of step payloads.
    pub fn from_json_file(path: impl AsRef<Path>) -> AppResult<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        let value: serde_json::Value = serde_json::from_str(&text)?;
        payload::method_from_payload(&value)
    }

    /// Number of steps.
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// True when the method has no steps.
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

/// Everything one call to `RunEngine::start` consumes.
#[derive(Debug, Clone)]
pub struct RunRequest {
    /// Methods in execution order, each with the id used in file names.
    pub methods: Vec<(Method, String)>,
    /// Number of passes over all methods.
    pub repetitions: u32,
    /// Plate the wells are resolved against.
    pub insert: Insert,
    /// Prefix of the run folder.
    pub output_prefix: String,
}
