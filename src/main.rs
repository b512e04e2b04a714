//! CLI Entry Point for capillary-daq
//!
//! Provides command-line interface for:
//! - Running a method on a fully simulated instrument
//! - Checking method and insert files before a run
//! - Printing the effective configuration
//!
//! # Usage
//!
//! Run a method three times:
//! ```bash
//! capillary-daq run --method demos/separation.json --insert demos/plate_3x3.json --reps 3
//! ```
//!
//! Check a method:
//! ```bash
//! capillary-daq check --method demos/separation.json
//! ```
//!
//! Show the effective configuration:
//! ```bash
//! capillary-daq config --config config/capillary_daq.toml
//! ```
//!
//! Ctrl-C during a run requests a stop; the step in flight still saves its data.

use anyhow::{Context, Result};
use capillary_daq::acquisition::{AcquisitionPipeline, RecordingOutput, SyntheticSource};
use capillary_daq::config::Settings;
use capillary_daq::engine::{RunEngine, RunEvent};
use capillary_daq::hardware::mock::{
    CallRecorder, MockAxis, MockCamera, MockPressure, MockXyStage,
};
use capillary_daq::hardware::HardwareController;
use capillary_daq::insert::{Insert, WellMap};
use capillary_daq::method::{Method, RunRequest};
use capillary_daq::tracing_setup;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "capillary-daq")]
#[command(about = "Method sequencer for capillary electrophoresis", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a method on the simulated instrument
    Run {
        /// Method file (JSON array of step payloads)
        #[arg(long)]
        method: PathBuf,

        /// Insert file (JSON)
        #[arg(long)]
        insert: PathBuf,

        /// Number of repetitions
        #[arg(long, default_value_t = 1)]
        reps: u32,

        /// Configuration file
        #[arg(long, default_value = "config/capillary_daq.toml")]
        config: PathBuf,

        /// Output prefix; overrides storage.output_prefix
        #[arg(long)]
        prefix: Option<String>,

        /// Print the latest RFU value once a second
        #[arg(long)]
        live: bool,
    },

    /// Validate method and insert files
    Check {
        /// Method file (JSON array of step payloads)
        #[arg(long)]
        method: PathBuf,

        /// Insert file; also checks that every well exists
        #[arg(long)]
        insert: Option<PathBuf>,
    },

    /// Print the effective configuration (file plus environment overrides)
    Config {
        /// Configuration file
        #[arg(long, default_value = "config/capillary_daq.toml")]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            method,
            insert,
            reps,
            config,
            prefix,
            live,
        } => run_method(method, insert, reps, config, prefix, live).await,
        Commands::Check { method, insert } => check(&method, insert.as_deref()),
        Commands::Config { config } => {
            let settings = Settings::load_from(&config)
                .with_context(|| format!("loading {}", config.display()))?;
            print!("{}", settings.to_toml()?);
            Ok(())
        }
    }
}

async fn run_method(
    method_path: PathBuf,
    insert_path: PathBuf,
    reps: u32,
    config_path: PathBuf,
    prefix: Option<String>,
    live: bool,
) -> Result<()> {
    let settings = Settings::load_from(&config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;
    tracing_setup::init_from_settings(&settings).map_err(anyhow::Error::msg)?;

    let method = Method::from_json_file(&method_path)
        .with_context(|| format!("loading method {}", method_path.display()))?;
    let insert = Insert::from_json_file(&insert_path)
        .with_context(|| format!("loading insert {}", insert_path.display()))?;
    info!(steps = method.len(), wells = insert.wells.len(), "method and insert loaded");

    // Simulated instrument: mock motion and valves, real pipeline on a synthetic source.
    let calls = CallRecorder::new();
    let output = Arc::new(RecordingOutput::default());
    let source = SyntheticSource::new(settings.acquisition.base_rate_hz, rand::random())
        .with_voltage_feedback(Arc::clone(&output))
        .paced();
    let pipeline = Arc::new(AcquisitionPipeline::new(
        settings.acquisition.clone(),
        Box::new(source),
        output,
    )?);
    pipeline.start()?;

    let hardware = HardwareController::builder()
        .xy(Arc::new(MockXyStage::new(calls.clone())))
        .inlet(Arc::new(MockAxis::new("inlet", calls.clone())))
        .outlet(Arc::new(MockAxis::new("outlet", calls.clone())))
        .objective(Arc::new(MockAxis::new("objective", calls.clone())))
        .pressure(Arc::new(MockPressure::new(calls.clone())))
        .camera(Arc::new(MockCamera::new(calls.clone())))
        .voltage(pipeline.clone())
        .recorder(pipeline.clone())
        .build();

    let engine = Arc::new(RunEngine::new(
        Arc::new(hardware),
        settings.engine.clone(),
    ));
    let mut events = engine.subscribe();

    let method_id = method_path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("method")
        .to_string();
    let handle = engine.start(RunRequest {
        methods: vec![(method, method_id)],
        repetitions: reps,
        insert,
        output_prefix: prefix.unwrap_or_else(|| settings.storage.output_prefix.clone()),
    })?;
    println!("Run folder: {}", handle.run_folder().display());

    let signals = Arc::clone(handle.cancellation());
    signals.set_plot_enabled(live);

    let stopper = Arc::clone(&engine);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Ctrl-C received, stopping run");
            if let Err(e) = stopper.stop() {
                warn!(error = %e, "stop request ignored");
            }
        }
    });

    let reporter = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                RunEvent::StepStarted {
                    method_id,
                    step_id,
                    rep,
                    kind,
                } => println!("rep {rep}: {method_id} step {step_id} ({kind})"),
                RunEvent::DataSaved(path) => println!("  saved {}", path.display()),
                RunEvent::RunFinished(_) => break,
                _ => {}
            }
        }
    });

    let plotter = {
        let pipeline = Arc::clone(&pipeline);
        let signals = Arc::clone(&signals);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(1));
            loop {
                tick.tick().await;
                if signals.plot_enabled() {
                    if let Some(rfu) = pipeline.latest_rfu() {
                        println!(
                            "  rfu {rfu:.2} @ {:.1} Hz, {:.2} kV",
                            pipeline.output_rate_hz(),
                            pipeline.commanded_voltage()
                        );
                    }
                }
            }
        })
    };

    let report = tokio::task::spawn_blocking(move || handle.join()).await??;
    plotter.abort();
    // The reporter ends on RunFinished.
    let _ = reporter.await;
    pipeline.stop();

    println!(
        "Run {}: {} steps, {} files, {} hardware calls",
        report.state,
        report.steps_completed,
        report.files.len(),
        calls.calls().len()
    );
    if let Some(error) = report.error {
        anyhow::bail!("run failed: {error}");
    }
    Ok(())
}

fn check(method_path: &Path, insert_path: Option<&Path>) -> Result<()> {
    let method = Method::from_json_file(method_path)
        .with_context(|| format!("loading method {}", method_path.display()))?;
    println!("{}: {} steps", method_path.display(), method.len());
    for (i, step) in method.steps.iter().enumerate() {
        println!(
            "  {i}: {:<12} inlet {} outlet {} ({:?})",
            step.kind().to_string(),
            step.common.inlet_well,
            step.common.outlet_well,
            step.action
        );
    }

    if let Some(insert_path) = insert_path {
        let insert = Insert::from_json_file(insert_path)
            .with_context(|| format!("loading insert {}", insert_path.display()))?;
        let wells = WellMap::new(&insert)?;
        let missing: Vec<_> = method
            .steps
            .iter()
            .map(|s| s.common.inlet_well.as_str())
            .filter(|label| wells.well(label).is_none())
            .collect();
        if !missing.is_empty() {
            anyhow::bail!("wells not on insert '{}': {}", insert.label, missing.join(", "));
        }
        println!("{}: {} wells, all referenced", insert.label, wells.len());
    }
    Ok(())
}
