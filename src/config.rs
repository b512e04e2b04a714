//! Configuration System using Figment
//!
//! Configuration is loaded from:
//! 1. a TOML file (base configuration)
//! 2. Environment variables (prefixed with `CAPILLARY_DAQ_`, sections split on `__`)
//!
//! Every section has defaults, so a missing or empty file still yields a usable
//! configuration.
//!
//! # Example
//! ```no_run
//! use capillary_daq::config::Settings;
//!
//! let settings = Settings::load()?;
//! println!("Application: {}", settings.application.name);
//! # Ok::<(), capillary_daq::error::DaqError>(())
//! ```

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{AppResult, DaqError};

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Application settings
    pub application: ApplicationConfig,
    /// Run engine constants
    pub engine: EngineConfig,
    /// Acquisition pipeline settings
    pub acquisition: AcquisitionConfig,
    /// Output locations
    pub storage: StorageConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationConfig {
    /// Application name
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "capillary-daq".to_string(),
            log_level: "info".to_string(),
        }
    }
}

/// What to do with acquired data when a step's wait was cut short by `stop`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PersistPolicy {
    /// Persist whatever was collected, even for an interrupted step.
    #[default]
    Always,
    /// Persist only when the step's wait ran to completion.
    CompletedOnly,
}

/// Run engine constants
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Inlet height the capillary is raised to before every XY move.
    pub clearance_height_mm: f64,
    /// Minimum time between the start of the step following an Inject and its action.
    #[serde(with = "humantime_serde")]
    pub inject_settle: Duration,
    /// Pause-loop tick; also the interval at which the cell position is copied.
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
    /// Data persistence after a cancelled wait.
    pub persist_policy: PersistPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            clearance_height_mm: 1.0,
            inject_settle: Duration::from_secs(2),
            poll_interval: Duration::from_millis(100),
            persist_policy: PersistPolicy::Always,
        }
    }
}

/// Acquisition pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AcquisitionConfig {
    /// Base sampling rate of every analog input channel.
    pub base_rate_hz: f64,
    /// Samples per channel delivered by one sampler callback.
    pub chunk_size: usize,
    /// Rate reduction of a single decimation stage.
    pub decimation_factor: usize,
    /// The cascade keeps decimating while the rate is above this value.
    pub max_output_rate_hz: f64,
    /// Shortest input a decimation stage accepts.
    pub min_stage_len: usize,
    /// Clock of the analog output used for voltage ramps.
    pub output_clock_hz: f64,
    /// Default voltage ramp rate.
    pub ramp_kv_per_s: f64,
    /// Longest ramp a single output burst may span.
    #[serde(with = "humantime_serde")]
    pub max_ramp: Duration,
    /// Append-only raw trail file. Defaults to a unique file in the temp directory.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trail_path: Option<PathBuf>,
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            base_rate_hz: 50_000.0,
            chunk_size: 50_000,
            decimation_factor: 10,
            max_output_rate_hz: 10.0,
            min_stage_len: 30,
            output_clock_hz: 100.0,
            ramp_kv_per_s: 1.0,
            max_ramp: Duration::from_secs(60),
            trail_path: None,
        }
    }
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Prefix prepended to every run folder name.
    pub output_prefix: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            output_prefix: "data/".to_string(),
        }
    }
}

impl Settings {
    /// Load configuration from `config/capillary_daq.toml` and environment variables
    ///
    /// Environment variables override the file, e.g.
    /// `CAPILLARY_DAQ_APPLICATION__LOG_LEVEL=debug`.
    pub fn load() -> AppResult<Self> {
        Self::load_from("config/capillary_daq.toml")
    }

    /// Load configuration from a specific file path
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let settings: Settings = Figment::from(Serialized::defaults(Settings::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("CAPILLARY_DAQ_").split("__"))
            .extract()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Render the effective configuration as TOML, in the layout `load_from` reads.
    pub fn to_toml(&self) -> AppResult<String> {
        toml::to_string_pretty(self)
            .map_err(|e| DaqError::Configuration(format!("cannot render settings: {e}")))
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> AppResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.to_lowercase().as_str()) {
            return Err(DaqError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        let acq = &self.acquisition;
        if acq.base_rate_hz <= 0.0 || acq.output_clock_hz <= 0.0 || acq.ramp_kv_per_s <= 0.0 {
            return Err(DaqError::Configuration(
                "acquisition rates must be positive".to_string(),
            ));
        }
        if acq.max_ramp.is_zero() {
            return Err(DaqError::Configuration(
                "acquisition.max_ramp must be non-zero".to_string(),
            ));
        }
        if acq.chunk_size == 0 {
            return Err(DaqError::Configuration(
                "acquisition.chunk_size must be at least 1".to_string(),
            ));
        }
        if acq.decimation_factor < 2 {
            return Err(DaqError::Configuration(format!(
                "Invalid decimation_factor {}. Must be >= 2",
                acq.decimation_factor
            )));
        }
        if acq.min_stage_len < 1 {
            return Err(DaqError::Configuration(
                "acquisition.min_stage_len must be at least 1".to_string(),
            ));
        }
        if acq.max_output_rate_hz <= 0.0 || acq.max_output_rate_hz >= acq.base_rate_hz {
            return Err(DaqError::Configuration(format!(
                "max_output_rate_hz {} must lie in (0, base_rate_hz)",
                acq.max_output_rate_hz
            )));
        }

        if self.engine.poll_interval.is_zero() {
            return Err(DaqError::Configuration(
                "engine.poll_interval must be non-zero".to_string(),
            ));
        }
        if self.engine.clearance_height_mm.is_nan() {
            return Err(DaqError::Configuration(
                "engine.clearance_height_mm must be a number".to_string(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;

    #[test]
    fn defaults_validate() {
        assert!(Settings::default().validate().is_ok());
    }

    #[test]
    #[serial]
    fn load_partial_file_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[application]
log_level = "debug"

[engine]
inject_settle = "500ms"
persist_policy = "completed_only"

[acquisition]
chunk_size = 25000
"#
        )
        .unwrap();

        let settings = Settings::load_from(file.path()).unwrap();
        assert_eq!(settings.application.log_level, "debug");
        assert_eq!(settings.application.name, "capillary-daq");
        assert_eq!(settings.engine.inject_settle, Duration::from_millis(500));
        assert_eq!(settings.engine.persist_policy, PersistPolicy::CompletedOnly);
        assert_eq!(settings.acquisition.chunk_size, 25_000);
        assert_eq!(settings.acquisition.decimation_factor, 10);
    }

    #[test]
    #[serial]
    fn missing_file_yields_defaults() {
        let settings = Settings::load_from("/nonexistent/capillary_daq.toml").unwrap();
        assert_eq!(settings.storage.output_prefix, "data/");
    }

    #[test]
    fn rejects_bad_log_level() {
        let mut settings = Settings::default();
        settings.application.log_level = "loud".to_string();
        assert!(settings.validate().is_err());
    }

    #[test]
    fn rejects_degenerate_decimation() {
        let mut settings = Settings::default();
        settings.acquisition.decimation_factor = 1;
        assert!(settings.validate().is_err());

        let mut settings = Settings::default();
        settings.acquisition.max_output_rate_hz = settings.acquisition.base_rate_hz;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn rejects_zero_max_ramp() {
        let mut settings = Settings::default();
        settings.acquisition.max_ramp = Duration::ZERO;
        assert!(settings.validate().is_err());
    }

    #[test]
    #[serial]
    fn environment_overrides_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[storage]\noutput_prefix = \"from_file/\"").unwrap();

        std::env::set_var("CAPILLARY_DAQ_STORAGE__OUTPUT_PREFIX", "from_env/");
        let settings = Settings::load_from(file.path());
        std::env::remove_var("CAPILLARY_DAQ_STORAGE__OUTPUT_PREFIX");

        assert_eq!(settings.unwrap().storage.output_prefix, "from_env/");
    }

    #[test]
    #[serial]
    fn rendered_toml_loads_back() {
        let mut settings = Settings::default();
        settings.engine.persist_policy = PersistPolicy::CompletedOnly;
        settings.engine.inject_settle = Duration::from_millis(750);

        let text = settings.to_toml().unwrap();
        assert!(text.contains("persist_policy = \"completed_only\""));
        assert!(!text.contains("trail_path"));

        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(text.as_bytes()).unwrap();
        let loaded = Settings::load_from(file.path()).unwrap();
        assert_eq!(loaded.engine.persist_policy, PersistPolicy::CompletedOnly);
        assert_eq!(loaded.engine.inject_settle, Duration::from_millis(750));
    }
}
