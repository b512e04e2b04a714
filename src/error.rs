//! Custom error types for the application.
//!
//! This module defines the primary error type, `DaqError`, for the whole crate. Using the
//! `thiserror` crate, it gives one place where configuration faults, hardware faults and
//! persistence faults are told apart.
//!
//! ## Error Hierarchy
//!
//! - **`Config`** / **`Configuration`**: parse-level and semantic configuration problems.
//! - **`UnsupportedDrive`**: a step asks for a drive/assist combination the engine cannot
//!   run (e.g. a vacuum-driven separation). Detected when the step is dispatched.
//! - **`MissingCapability`**: the step needs a device the `HardwareController` does not
//!   have. Also detected lazily, per step.
//! - **`Hardware`**: a device call failed. Device drivers report `anyhow::Error`; the
//!   controller wraps it here so the engine only sees a step failure.
//! - **`Io`** / **`Csv`** / **`Json`**: persistence and file loading.
//!
//! A deliberate operator stop is *not* an error; the engine reports it as a terminal
//! state instead.

use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, DaqError>;

#[allow(missing_docs)]
#[derive(Error, Debug)]
pub enum DaqError {
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    #[error("Configuration validation error: {0}")]
    Configuration(String),

    #[error("Unsupported drive in step '{step}': {reason}")]
    UnsupportedDrive { step: String, reason: String },

    #[error("Required capability not present: {0}")]
    MissingCapability(&'static str),

    #[error("Unknown well '{0}'")]
    UnknownWell(String),

    #[error("Another single-cell injection is already in progress")]
    InjectionInProgress,

    #[error("A run is already active")]
    EngineBusy,

    #[error("No run is active")]
    NotRunning,

    #[error("No single-cell injection is waiting for a cell position")]
    InjectionNotPending,

    #[error("Hardware error: {0:#}")]
    Hardware(#[source] anyhow::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[cfg(feature = "storage_csv")]
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid step payload: {0}")]
    Payload(String),

    #[error("Feature '{0}' is not enabled. Please build with --features {0}")]
    FeatureNotEnabled(String),

    #[error("Run engine thread panicked")]
    EnginePanicked,
}

impl From<figment::Error> for DaqError {
    fn from(value: figment::Error) -> Self {
        DaqError::Config(Box::new(value))
    }
}

impl DaqError {
    /// True for errors caused by the run definition rather than by the instrument.
    ///
    /// Configuration faults are fatal to the run and are never worth retrying with the
    /// same request.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            DaqError::Config(_)
                | DaqError::Configuration(_)
                | DaqError::UnsupportedDrive { .. }
                | DaqError::MissingCapability(_)
                | DaqError::UnknownWell(_)
                | DaqError::Payload(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unsupported_drive_names_step() {
        let err = DaqError::UnsupportedDrive {
            step: "Separate 10kV".into(),
            reason: "vacuum separation".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("Separate 10kV"));
        assert!(msg.contains("vacuum separation"));
        assert!(err.is_configuration());
    }

    #[test]
    fn hardware_error_keeps_context_chain() {
        let source = anyhow::anyhow!("axis timeout").context("wait_xy");
        let err = DaqError::Hardware(source);
        let msg = err.to_string();
        assert!(msg.contains("wait_xy"));
        assert!(msg.contains("axis timeout"));
        assert!(!err.is_configuration());
    }

    #[test]
    fn figment_errors_convert() {
        let err: DaqError = figment::Error::from("bad key".to_string()).into();
        assert!(matches!(err, DaqError::Config(_)));
    }
}
