//! End-to-end run with the acquisition pipeline as voltage source and data recorder.

use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use capillary_daq::acquisition::{AcquisitionPipeline, RecordingOutput, SyntheticSource};
use capillary_daq::config::{AcquisitionConfig, EngineConfig};
use capillary_daq::engine::{EngineState, RunEngine};
use capillary_daq::hardware::mock::{CallRecorder, MockAxis, MockPressure, MockXyStage};
use capillary_daq::hardware::HardwareController;
use capillary_daq::insert::Insert;
use capillary_daq::method::{Method, Step};
use capillary_daq::storage;
use capillary_daq::RunRequest;

const RATE_HZ: f64 = 1000.0;
/// One decimated point per chunk at 10 Hz.
const CHUNK: usize = 100;
const PRE_RUN_POINTS: usize = 12;

fn acquisition_config(dir: &tempfile::TempDir) -> AcquisitionConfig {
    AcquisitionConfig {
        base_rate_hz: RATE_HZ,
        chunk_size: CHUNK,
        trail_path: Some(dir.path().join("trail.csv")),
        ..AcquisitionConfig::default()
    }
}

fn wait_for(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(5));
    }
}

fn data_rows(csv: &Path) -> usize {
    let text = std::fs::read_to_string(csv).unwrap();
    let mut lines = text.lines();
    assert_eq!(lines.next(), Some("time,rfu,kV,uA,avg,raw"));
    lines.count()
}

/// Rows in the raw sidecar; a step that emitted nothing leaves no sidecar.
fn trail_rows(csv: &Path) -> usize {
    match std::fs::read_to_string(storage::raw_trail_path(csv)) {
        Ok(text) => {
            assert!(text.starts_with("raw,avg"));
            text.lines().count() - 1
        }
        Err(_) => 0,
    }
}

#[test]
fn each_separation_saves_only_its_own_data() {
    let dir = tempfile::tempdir().unwrap();
    let output = Arc::new(RecordingOutput::default());
    let source = SyntheticSource::new(RATE_HZ, 42)
        .with_voltage_feedback(Arc::clone(&output))
        .paced();
    let pipeline = Arc::new(
        AcquisitionPipeline::new(acquisition_config(&dir), Box::new(source), output.clone())
            .unwrap(),
    );
    pipeline.start().unwrap();

    // Data acquired before the run must not reach the step files.
    wait_for("pre-run data", || pipeline.snapshot().len() >= PRE_RUN_POINTS);
    assert_eq!(pipeline.output_rate_hz(), 10.0);

    let calls = CallRecorder::new();
    let hardware = HardwareController::builder()
        .xy(Arc::new(MockXyStage::new(calls.clone())))
        .inlet(Arc::new(MockAxis::new("inlet", calls.clone())))
        .outlet(Arc::new(MockAxis::new("outlet", calls.clone())))
        .pressure(Arc::new(MockPressure::new(calls.clone())))
        .voltage(pipeline.clone())
        .recorder(pipeline.clone())
        .build();
    let engine = RunEngine::new(Arc::new(hardware), EngineConfig::default());

    let handle = engine
        .start(RunRequest {
            methods: vec![(
                Method::new(vec![Step::separate_voltage("A1", 5.0, 0.5)]),
                "ce".to_string(),
            )],
            repetitions: 2,
            insert: Insert::grid("plate", 2, 2, 9000.0),
            output_prefix: format!("{}/exp_", dir.path().display()),
        })
        .unwrap();
    let report = handle.join().unwrap();
    pipeline.stop();
    assert_eq!(report.state, EngineState::Completed);
    assert_eq!(report.files.len(), 2);

    for (rep, csv) in report.files.iter().enumerate() {
        assert_eq!(
            csv.file_name().unwrap().to_string_lossy(),
            format!("exp_ce_step_0_rep_{rep}.csv")
        );
        let rows = data_rows(csv);
        assert_eq!(rows, trail_rows(csv), "rep {rep}");
        assert!(rows < PRE_RUN_POINTS, "rep {rep} kept {rows} rows");
    }

    // Each repetition ramps up at 1 kV/s on a 100 Hz clock, then back down.
    let bursts = output.bursts();
    assert_eq!(bursts.len(), 4);
    for pair in bursts.chunks(2) {
        assert_eq!(pair[0].len(), 500);
        assert_eq!(pair[0].last(), Some(&5.0));
        assert_eq!(pair[1].last(), Some(&0.0));
    }
    assert_eq!(pipeline.commanded_voltage(), 0.0);
}
