//! Continuous acquisition of the voltage, current and RFU channels.
//!
//! [`AcquisitionPipeline`] owns one sampler thread that pulls fixed-size chunks from a
//! [`SampleSource`] at the base rate and reduces them to a plotting rate:
//!
//! - **RFU**: each chunk is filtered together with the two chunks before it, cascading
//!   decimation stages until the rate drops to `max_output_rate_hz`; only the middle
//!   third of the result is kept, so the emitted series lags the input by one chunk and
//!   the first chunk only primes the history.
//! - **Voltage / current**: the same middle chunk is block-averaged to as many points as
//!   the RFU stage produced.
//! - **Raw / avg**: a plain subsample and a block average of that RFU chunk, kept for
//!   comparison and appended to an on-disk trail file after every chunk.
//!
//! All buffers sit behind a single lock. The sampler appends under it and readers copy
//! under it; filtering and file I/O happen outside it.
//!
//! The pipeline also drives the high-voltage analog output: a new level is reached by a
//! linear ramp written to the [`AnalogOutput`] as one burst on the output clock.

pub mod decimate;
pub mod synthetic;

use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::AcquisitionConfig;
use crate::error::{AppResult, DaqError};
use crate::hardware::capabilities::{DataRecorder, VoltageSource};
use crate::storage;

pub use decimate::{Decimator, Underflow};
pub use synthetic::SyntheticSource;

/// One base-rate chunk, one vector per channel.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChannelChunk {
    /// Fluorescence.
    pub rfu: Vec<f64>,
    /// Separation voltage (kV).
    pub voltage: Vec<f64>,
    /// Separation current (µA).
    pub current: Vec<f64>,
}

impl ChannelChunk {
    /// Empty chunk with room for `n` samples per channel.
    pub fn with_capacity(n: usize) -> Self {
        Self {
            rfu: Vec::with_capacity(n),
            voltage: Vec::with_capacity(n),
            current: Vec::with_capacity(n),
        }
    }

    /// Samples per channel (RFU length).
    pub fn len(&self) -> usize {
        self.rfu.len()
    }

    /// True when no samples are present.
    pub fn is_empty(&self) -> bool {
        self.rfu.is_empty()
    }

    fn is_well_formed(&self, expected: usize) -> bool {
        self.rfu.len() == expected
            && self.voltage.len() == expected
            && self.current.len() == expected
    }
}

/// Base-rate analog input (the DAQ task).
pub trait SampleSource: Send {
    /// Read the next `n` samples per channel. `Ok(None)` ends the stream.
    fn read_chunk(&mut self, n: usize) -> anyhow::Result<Option<ChannelChunk>>;
}

/// Analog output that receives voltage ramp bursts.
pub trait AnalogOutput: Send + Sync {
    /// Queue `samples` on the output clock.
    fn write(&self, samples: &[f64]) -> anyhow::Result<()>;
}

/// Output that keeps every burst in memory.
#[derive(Debug, Default)]
pub struct RecordingOutput {
    bursts: Mutex<Vec<Vec<f64>>>,
}

impl RecordingOutput {
    /// All bursts written so far.
    pub fn bursts(&self) -> Vec<Vec<f64>> {
        self.bursts.lock().clone()
    }

    /// Last sample written, 0 before any write.
    pub fn level(&self) -> f64 {
        self.bursts
            .lock()
            .iter()
            .rev()
            .find_map(|b| b.last().copied())
            .unwrap_or(0.0)
    }
}

impl AnalogOutput for RecordingOutput {
    fn write(&self, samples: &[f64]) -> anyhow::Result<()> {
        self.bursts.lock().push(samples.to_vec());
        Ok(())
    }
}

/// Copy of the output buffers at one instant.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AcquisitionSnapshot {
    #[allow(missing_docs)]
    pub rfu: Vec<f64>,
    #[allow(missing_docs)]
    pub voltage: Vec<f64>,
    #[allow(missing_docs)]
    pub current: Vec<f64>,
    #[allow(missing_docs)]
    pub raw: Vec<f64>,
    #[allow(missing_docs)]
    pub avg: Vec<f64>,
    /// Realized output rate; 0 before the first emission.
    pub sample_rate_hz: f64,
}

impl AcquisitionSnapshot {
    /// Length of the longest column.
    pub fn len(&self) -> usize {
        [
            self.rfu.len(),
            self.voltage.len(),
            self.current.len(),
            self.raw.len(),
            self.avg.len(),
        ]
        .into_iter()
        .max()
        .unwrap_or(0)
    }

    /// True when every column is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Default)]
struct Buffers {
    rfu: Vec<f64>,
    voltage: Vec<f64>,
    current: Vec<f64>,
    raw: Vec<f64>,
    avg: Vec<f64>,
    rate_hz: f64,
}

/// Append-only `raw,avg` file.
#[derive(Debug)]
struct Trail {
    path: PathBuf,
    file: Option<File>,
}

impl Trail {
    fn append(&mut self, raw: &[f64], avg: &[f64]) -> io::Result<()> {
        if self.file.is_none() {
            let fresh = !self.path.exists();
            let mut file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)?;
            if fresh {
                writeln!(file, "raw,avg")?;
            }
            self.file = Some(file);
        }
        if let Some(file) = self.file.as_mut() {
            let mut rows = String::with_capacity(raw.len() * 24);
            for (r, a) in raw.iter().zip(avg) {
                rows.push_str(&format!("{r},{a}\n"));
            }
            file.write_all(rows.as_bytes())?;
            file.flush()?;
        }
        Ok(())
    }

    fn relocate(&mut self, to: &Path) -> io::Result<bool> {
        self.file = None;
        if !self.path.exists() {
            return Ok(false);
        }
        storage::relocate(&self.path, to)?;
        Ok(true)
    }

    fn remove(&mut self) -> io::Result<()> {
        self.file = None;
        match std::fs::remove_file(&self.path) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }
}

struct Shared {
    config: AcquisitionConfig,
    decimator: Decimator,
    buffers: Mutex<Buffers>,
    history: Mutex<VecDeque<ChannelChunk>>,
    trail: Mutex<Trail>,
    running: AtomicBool,
}

impl Shared {
    fn ingest(&self, chunk: ChannelChunk) -> Result<usize, Underflow> {
        let expected = self.config.chunk_size;
        if !chunk.is_well_formed(expected) {
            warn!(
                expected,
                rfu = chunk.rfu.len(),
                voltage = chunk.voltage.len(),
                current = chunk.current.len(),
                "dropping malformed chunk"
            );
            return Ok(0);
        }

        // Held for the whole ingest so a concurrent `clear` cannot interleave.
        // Lock order: history, trail, buffers.
        let mut history = self.history.lock();

        // Window = [h2, h1, current]; h2 repeats h1 until two chunks are buffered.
        let Some(middle) = history.back().cloned() else {
            history.push_back(chunk);
            return Ok(0);
        };
        let mut window = Vec::with_capacity(3 * expected);
        if let Some(h2) = history.front() {
            window.extend_from_slice(&h2.rfu);
        }
        window.extend_from_slice(&middle.rfu);
        window.extend_from_slice(&chunk.rfu);
        history.push_back(chunk);
        while history.len() > 2 {
            history.pop_front();
        }

        let decimated = decimate::cascade(
            &self.decimator,
            &window,
            self.config.base_rate_hz,
            self.config.max_output_rate_hz,
            self.config.min_stage_len,
        )?;
        let kept = decimate::middle_third(&decimated.values);
        let n_out = kept.len();
        let voltage = decimate::block_average(&middle.voltage, n_out);
        let current = decimate::block_average(&middle.current, n_out);
        let avg = decimate::block_average(&middle.rfu, n_out);
        let raw = decimate::subsample(&middle.rfu, n_out);

        // The trail and the buffers advance together, so a save sees both or neither.
        let mut trail = self.trail.lock();
        if let Err(e) = trail.append(&raw, &avg) {
            warn!(error = %e, "failed to append raw trail");
        }
        let rate_changed = {
            let mut buffers = self.buffers.lock();
            buffers.rfu.extend_from_slice(kept);
            buffers.voltage.extend_from_slice(&voltage);
            buffers.current.extend_from_slice(&current);
            buffers.raw.extend_from_slice(&raw);
            buffers.avg.extend_from_slice(&avg);
            let changed = buffers.rate_hz != decimated.rate_hz;
            buffers.rate_hz = decimated.rate_hz;
            changed
        };
        drop(trail);
        drop(history);
        if rate_changed {
            info!(
                rate_hz = decimated.rate_hz,
                stages = decimated.stages,
                "acquisition output rate changed"
            );
        }
        Ok(n_out)
    }

    fn run_sampler(&self, source: &Mutex<Box<dyn SampleSource>>) {
        info!("acquisition sampler started");
        while self.running.load(Ordering::Acquire) {
            let read = source.lock().read_chunk(self.config.chunk_size);
            match read {
                Ok(Some(chunk)) => {
                    if let Err(underflow) = self.ingest(chunk) {
                        error!(%underflow, "stopping acquisition");
                        self.running.store(false, Ordering::Release);
                    }
                }
                Ok(None) => {
                    info!("sample source exhausted");
                    self.running.store(false, Ordering::Release);
                }
                Err(e) => {
                    error!(error = %e, "sample source failed, stopping acquisition");
                    self.running.store(false, Ordering::Release);
                }
            }
        }
        info!("acquisition sampler stopped");
    }
}

/// Sampler thread, decimation and buffers for one instrument session.
pub struct AcquisitionPipeline {
    shared: Arc<Shared>,
    source: Arc<Mutex<Box<dyn SampleSource>>>,
    output: Arc<dyn AnalogOutput>,
    commanded_kv: Mutex<f64>,
    sampler: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for AcquisitionPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AcquisitionPipeline")
            .field("config", &self.shared.config)
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

impl AcquisitionPipeline {
    /// Pipeline reading from `source` and ramping voltage on `output`. Not started.
    pub fn new(
        config: AcquisitionConfig,
        source: Box<dyn SampleSource>,
        output: Arc<dyn AnalogOutput>,
    ) -> AppResult<Self> {
        let decimator = Decimator::new(config.decimation_factor)
            .map_err(|e| DaqError::Configuration(format!("{e:#}")))?;
        let trail_path = config.trail_path.clone().unwrap_or_else(|| {
            std::env::temp_dir().join(format!("capillary_daq_trail_{}.csv", Uuid::new_v4()))
        });
        debug!(trail = %trail_path.display(), "acquisition pipeline created");
        Ok(Self {
            shared: Arc::new(Shared {
                config,
                decimator,
                buffers: Mutex::new(Buffers::default()),
                history: Mutex::new(VecDeque::with_capacity(2)),
                trail: Mutex::new(Trail {
                    path: trail_path,
                    file: None,
                }),
                running: AtomicBool::new(false),
            }),
            source: Arc::new(Mutex::new(source)),
            output,
            commanded_kv: Mutex::new(0.0),
            sampler: Mutex::new(None),
        })
    }

    /// Spawn the sampler thread. No-op while it is already running.
    pub fn start(&self) -> AppResult<()> {
        let mut sampler = self.sampler.lock();
        if self.shared.running.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        if let Some(finished) = sampler.take() {
            if finished.join().is_err() {
                warn!("previous sampler thread panicked");
            }
        }
        let shared = Arc::clone(&self.shared);
        let source = Arc::clone(&self.source);
        let handle = thread::Builder::new()
            .name("acquisition-sampler".to_string())
            .spawn(move || shared.run_sampler(&source))
            .map_err(|e| {
                self.shared.running.store(false, Ordering::Release);
                DaqError::Io(e)
            })?;
        *sampler = Some(handle);
        Ok(())
    }

    /// Stop the sampler thread and wait for it to exit.
    pub fn stop(&self) {
        self.shared.running.store(false, Ordering::Release);
        if let Some(handle) = self.sampler.lock().take() {
            if handle.join().is_err() {
                warn!("sampler thread panicked");
            }
        }
    }

    /// True while the sampler is running.
    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    /// Feed one chunk as if the sampler had read it. Returns the points appended.
    ///
    /// A decimation underflow stops the sampler.
    pub fn ingest(&self, chunk: ChannelChunk) -> Result<usize, Underflow> {
        let result = self.shared.ingest(chunk);
        if let Err(underflow) = &result {
            error!(%underflow, "stopping acquisition");
            self.shared.running.store(false, Ordering::Release);
        }
        result
    }

    /// Empty every buffer and delete the raw trail.
    pub fn clear(&self) {
        let mut history = self.shared.history.lock();
        let mut trail = self.shared.trail.lock();
        history.clear();
        *self.shared.buffers.lock() = Buffers::default();
        if let Err(e) = trail.remove() {
            warn!(error = %e, "failed to delete raw trail");
        }
        debug!("acquisition buffers cleared");
    }

    /// Copy the current buffers.
    pub fn snapshot(&self) -> AcquisitionSnapshot {
        let buffers = self.shared.buffers.lock();
        AcquisitionSnapshot {
            rfu: buffers.rfu.clone(),
            voltage: buffers.voltage.clone(),
            current: buffers.current.clone(),
            raw: buffers.raw.clone(),
            avg: buffers.avg.clone(),
            sample_rate_hz: buffers.rate_hz,
        }
    }

    /// Most recent RFU point.
    pub fn latest_rfu(&self) -> Option<f64> {
        self.shared.buffers.lock().rfu.last().copied()
    }

    /// Realized output rate; 0 until the first emission.
    pub fn output_rate_hz(&self) -> f64 {
        self.shared.buffers.lock().rate_hz
    }

    /// Current location of the raw trail file.
    pub fn trail_path(&self) -> PathBuf {
        self.shared.trail.lock().path.clone()
    }

    /// Write the snapshot to `path` and move the raw trail to `<path>_raw_data.csv`.
    pub fn save_csv(&self, path: &Path) -> AppResult<()> {
        storage::ensure_parent(path)?;
        let sidecar = storage::raw_trail_path(path);
        // Snapshot and trail are taken together so the sidecar holds exactly the rows of
        // the CSV.
        let (snapshot, moved) = {
            let mut trail = self.shared.trail.lock();
            let snapshot = self.snapshot();
            (snapshot, trail.relocate(&sidecar)?)
        };
        if moved {
            debug!(path = %sidecar.display(), "moved raw trail");
        }
        storage::write_snapshot_csv(path, &snapshot)?;
        info!(path = %path.display(), rows = snapshot.len(), "saved acquisition data");
        Ok(())
    }

    /// Ramp to `kv` at the configured kV/s rate, or faster when that would exceed
    /// `max_ramp`.
    pub fn set_voltage(&self, kv: f64) -> AppResult<()> {
        let rate = self.shared.config.ramp_kv_per_s;
        let delta = (kv - *self.commanded_kv.lock()).abs();
        let ramp = Duration::try_from_secs_f64(delta / rate)
            .unwrap_or(Duration::ZERO)
            .min(self.shared.config.max_ramp);
        self.ramp_voltage(kv, ramp)
    }

    /// Ramp linearly to `kv` over `ramp`, written as one burst on the output clock.
    ///
    /// Ramps longer than `max_ramp` are rejected without touching the output.
    pub fn ramp_voltage(&self, kv: f64, ramp: Duration) -> AppResult<()> {
        let max_ramp = self.shared.config.max_ramp;
        if ramp > max_ramp {
            return Err(DaqError::Configuration(format!(
                "voltage ramp of {ramp:?} exceeds the {max_ramp:?} limit"
            )));
        }
        let mut commanded = self.commanded_kv.lock();
        let from = *commanded;
        let steps = (ramp.as_secs_f64() * self.shared.config.output_clock_hz)
            .ceil()
            .max(1.0) as usize;
        let burst: Vec<f64> = (1..=steps)
            .map(|i| from + (kv - from) * i as f64 / steps as f64)
            .collect();
        self.output.write(&burst).map_err(DaqError::Hardware)?;
        *commanded = kv;
        debug!(from, kv, samples = steps, "voltage ramp written");
        Ok(())
    }

    /// Last commanded voltage.
    pub fn commanded_voltage(&self) -> f64 {
        *self.commanded_kv.lock()
    }
}

impl Drop for AcquisitionPipeline {
    fn drop(&mut self) {
        self.stop();
    }
}

impl VoltageSource for AcquisitionPipeline {
    fn set_voltage(&self, kv: f64) -> anyhow::Result<()> {
        Ok(AcquisitionPipeline::set_voltage(self, kv)?)
    }

    fn ramp_voltage(&self, kv: f64, ramp: Duration) -> anyhow::Result<()> {
        Ok(AcquisitionPipeline::ramp_voltage(self, kv, ramp)?)
    }

    fn voltage(&self) -> anyhow::Result<f64> {
        Ok(self.commanded_voltage())
    }
}

impl DataRecorder for AcquisitionPipeline {
    fn save_data(&self, path: &Path) -> anyhow::Result<()> {
        Ok(self.save_csv(path)?)
    }

    fn clear_data(&self) -> anyhow::Result<()> {
        self.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;
    use tempfile::TempDir;
    use tracing_test::traced_test;

    fn config(dir: &TempDir, base_rate_hz: f64, chunk_size: usize) -> AcquisitionConfig {
        AcquisitionConfig {
            base_rate_hz,
            chunk_size,
            trail_path: Some(dir.path().join("trail.csv")),
            ..AcquisitionConfig::default()
        }
    }

    fn pipeline(cfg: AcquisitionConfig) -> (AcquisitionPipeline, Arc<RecordingOutput>) {
        let output = Arc::new(RecordingOutput::default());
        let source = SyntheticSource::new(cfg.base_rate_hz, 3);
        let pipeline = AcquisitionPipeline::new(cfg, Box::new(source), output.clone()).unwrap();
        (pipeline, output)
    }

    fn wait_stopped(pipeline: &AcquisitionPipeline) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while pipeline.is_running() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
    }

    #[test]
    fn one_second_at_50khz_yields_five_points() {
        let dir = tempfile::tempdir().unwrap();
        let (pipeline, _) = pipeline(config(&dir, 50_000.0, 50_000));
        let mut feed = SyntheticSource::new(50_000.0, 11);

        assert_eq!(pipeline.ingest(feed.read_chunk(50_000).unwrap().unwrap()), Ok(0));
        assert_eq!(pipeline.ingest(feed.read_chunk(50_000).unwrap().unwrap()), Ok(5));

        let snapshot = pipeline.snapshot();
        assert_eq!(snapshot.sample_rate_hz, 5.0);
        assert_eq!(snapshot.rfu.len(), 5);
        assert_eq!(snapshot.voltage.len(), 5);
        assert_eq!(snapshot.current.len(), 5);
        assert_eq!(snapshot.raw.len(), 5);
        assert_eq!(snapshot.avg.len(), 5);
        assert_eq!(pipeline.output_rate_hz(), 5.0);
    }

    #[test]
    #[traced_test]
    fn malformed_chunk_is_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let (pipeline, _) = pipeline(config(&dir, 10_000.0, 1000));
        let mut chunk = SyntheticSource::new(10_000.0, 0)
            .read_chunk(1000)
            .unwrap()
            .unwrap();
        chunk.voltage.truncate(10);
        assert_eq!(pipeline.ingest(chunk), Ok(0));

        let short = SyntheticSource::new(10_000.0, 0)
            .read_chunk(999)
            .unwrap()
            .unwrap();
        assert_eq!(pipeline.ingest(short), Ok(0));
        assert!(pipeline.snapshot().is_empty());
        assert!(logs_contain("dropping malformed chunk"));
    }

    #[test]
    fn snapshots_only_grow() {
        let dir = tempfile::tempdir().unwrap();
        let (pipeline, _) = pipeline(config(&dir, 10_000.0, 1000));
        let mut feed = SyntheticSource::new(10_000.0, 5);

        let mut previous = pipeline.snapshot();
        for _ in 0..6 {
            pipeline
                .ingest(feed.read_chunk(1000).unwrap().unwrap())
                .unwrap();
            let next = pipeline.snapshot();
            assert!(next.rfu.len() >= previous.rfu.len());
            assert_eq!(&next.rfu[..previous.rfu.len()], &previous.rfu[..]);
            previous = next;
        }
        assert_eq!(previous.rfu.len(), 5);
    }

    #[cfg(feature = "storage_csv")]
    #[test]
    fn save_csv_relocates_trail() {
        let dir = tempfile::tempdir().unwrap();
        let (pipeline, _) = pipeline(config(&dir, 10_000.0, 1000));
        let mut feed = SyntheticSource::new(10_000.0, 5);
        for _ in 0..3 {
            pipeline
                .ingest(feed.read_chunk(1000).unwrap().unwrap())
                .unwrap();
        }
        let trail = pipeline.trail_path();
        assert!(trail.exists());

        let csv = dir.path().join("step.csv");
        pipeline.save_csv(&csv).unwrap();
        let text = std::fs::read_to_string(&csv).unwrap();
        assert!(text.starts_with("time,rfu,kV,uA,avg,raw\n"));
        assert_eq!(text.lines().count(), 3);

        assert!(!trail.exists());
        let sidecar = std::fs::read_to_string(storage::raw_trail_path(&csv)).unwrap();
        assert_eq!(sidecar.lines().next(), Some("raw,avg"));
        assert_eq!(sidecar.lines().count(), 3);

        // The next chunk starts a fresh trail.
        pipeline
            .ingest(feed.read_chunk(1000).unwrap().unwrap())
            .unwrap();
        assert!(trail.exists());
    }

    #[test]
    fn clear_empties_buffers_and_trail() {
        let dir = tempfile::tempdir().unwrap();
        let (pipeline, _) = pipeline(config(&dir, 10_000.0, 1000));
        let mut feed = SyntheticSource::new(10_000.0, 5);
        for _ in 0..2 {
            pipeline
                .ingest(feed.read_chunk(1000).unwrap().unwrap())
                .unwrap();
        }
        pipeline.clear();
        assert!(pipeline.snapshot().is_empty());
        assert!(!pipeline.trail_path().exists());
        // History is gone too: the next chunk only primes.
        assert_eq!(
            pipeline.ingest(feed.read_chunk(1000).unwrap().unwrap()),
            Ok(0)
        );
    }

    #[cfg(feature = "storage_csv")]
    #[test]
    fn clear_between_saves_keeps_csv_and_trail_aligned() {
        let dir = tempfile::tempdir().unwrap();
        let (pipeline, _) = pipeline(config(&dir, 10_000.0, 1000));
        let mut feed = SyntheticSource::new(10_000.0, 5);

        let mut saved = Vec::new();
        for (name, chunks) in [("first.csv", 4), ("second.csv", 3)] {
            DataRecorder::clear_data(&pipeline).unwrap();
            for _ in 0..chunks {
                pipeline
                    .ingest(feed.read_chunk(1000).unwrap().unwrap())
                    .unwrap();
            }
            let csv = dir.path().join(name);
            DataRecorder::save_data(&pipeline, &csv).unwrap();
            saved.push(csv);
        }

        for (csv, points) in saved.iter().zip([3, 2]) {
            let rows = std::fs::read_to_string(csv).unwrap().lines().count() - 1;
            let sidecar = std::fs::read_to_string(storage::raw_trail_path(csv)).unwrap();
            assert_eq!(rows, points);
            assert_eq!(sidecar.lines().count() - 1, points);
        }
    }

    #[cfg(feature = "storage_csv")]
    #[test]
    fn clear_racing_ingest_leaves_matching_csv_and_trail() {
        let dir = tempfile::tempdir().unwrap();
        let (pipeline, _) = pipeline(config(&dir, 1000.0, 100));
        let pipeline = Arc::new(pipeline);

        let feeder = {
            let pipeline = Arc::clone(&pipeline);
            thread::spawn(move || {
                let mut feed = SyntheticSource::new(1000.0, 8);
                for _ in 0..400 {
                    let _ = pipeline.ingest(feed.read_chunk(100).unwrap().unwrap());
                }
            })
        };
        for _ in 0..50 {
            pipeline.clear();
            thread::sleep(Duration::from_micros(200));
        }
        feeder.join().unwrap();

        let csv = dir.path().join("after_race.csv");
        pipeline.save_csv(&csv).unwrap();
        let rows = std::fs::read_to_string(&csv).unwrap().lines().count() - 1;
        let sidecar = storage::raw_trail_path(&csv);
        let trail_rows = std::fs::read_to_string(&sidecar)
            .map(|text| text.lines().count().saturating_sub(1))
            .unwrap_or(0);
        assert_eq!(rows, trail_rows);
    }

    #[test]
    fn voltage_changes_are_ramped() {
        let dir = tempfile::tempdir().unwrap();
        let (pipeline, output) = pipeline(config(&dir, 10_000.0, 1000));

        pipeline.set_voltage(2.0).unwrap();
        let bursts = output.bursts();
        assert_eq!(bursts.len(), 1);
        // 2 kV at 1 kV/s on a 100 Hz clock.
        assert_eq!(bursts[0].len(), 200);
        assert!((bursts[0][0] - 0.01).abs() < 1e-12);
        assert_eq!(bursts[0][199], 2.0);
        assert!(bursts[0].windows(2).all(|w| w[1] > w[0]));

        pipeline.ramp_voltage(-1.0, Duration::from_millis(50)).unwrap();
        assert_eq!(output.bursts()[1].len(), 5);
        assert_eq!(pipeline.commanded_voltage(), -1.0);
    }

    #[test]
    fn overlong_ramps_are_bounded() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = AcquisitionConfig {
            max_ramp: Duration::from_secs(2),
            ..config(&dir, 10_000.0, 1000)
        };
        let (pipeline, output) = pipeline(cfg);

        let err = pipeline
            .ramp_voltage(1.0, Duration::from_secs(3))
            .unwrap_err();
        assert!(matches!(err, DaqError::Configuration(_)));
        assert!(output.bursts().is_empty());
        assert_eq!(pipeline.commanded_voltage(), 0.0);

        // 3 kV at 1 kV/s would take 3 s; the fixed-rate path ramps faster instead.
        pipeline.set_voltage(3.0).unwrap();
        assert_eq!(output.bursts()[0].len(), 200);
        assert_eq!(pipeline.commanded_voltage(), 3.0);
        VoltageSource::stop_voltage(&pipeline).unwrap();
        assert_eq!(output.bursts()[1].len(), 200);
        assert_eq!(pipeline.commanded_voltage(), 0.0);
    }

    #[test]
    fn stopping_at_zero_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let (pipeline, output) = pipeline(config(&dir, 10_000.0, 1000));
        VoltageSource::stop_voltage(&pipeline).unwrap();
        VoltageSource::stop_voltage(&pipeline).unwrap();
        assert_eq!(output.bursts(), vec![vec![0.0], vec![0.0]]);
        assert_eq!(VoltageSource::voltage(&pipeline).unwrap(), 0.0);
    }

    #[test]
    fn sampler_runs_until_source_ends() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(&dir, 10_000.0, 1000);
        let output = Arc::new(RecordingOutput::default());
        let source = SyntheticSource::new(10_000.0, 9).with_limit(10_000);
        let pipeline = AcquisitionPipeline::new(cfg, Box::new(source), output).unwrap();

        pipeline.start().unwrap();
        wait_stopped(&pipeline);
        pipeline.stop();

        // Ten chunks: the first primes, each later one emits one point at 10 Hz.
        let snapshot = pipeline.snapshot();
        assert_eq!(snapshot.rfu.len(), 9);
        assert_eq!(snapshot.sample_rate_hz, 10.0);
    }

    #[test]
    fn underflow_stops_the_sampler() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = AcquisitionConfig {
            min_stage_len: 30,
            ..config(&dir, 50_000.0, 10)
        };
        let output = Arc::new(RecordingOutput::default());
        let source = SyntheticSource::new(50_000.0, 1);
        let pipeline = AcquisitionPipeline::new(cfg, Box::new(source), output).unwrap();

        pipeline.start().unwrap();
        wait_stopped(&pipeline);
        assert!(!pipeline.is_running());
        pipeline.stop();
        assert!(pipeline.snapshot().is_empty());
    }
}
