//! Synthetic base-rate signal for simulation.
//!
//! Produces a Gaussian peak train on the RFU channel over a flat baseline with uniform
//! noise, and mirrors the commanded high voltage onto the kV and µA channels when wired
//! to a [`RecordingOutput`](super::RecordingOutput).

use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::{ChannelChunk, RecordingOutput, SampleSource};

/// Simulated µA drawn per kV applied.
const MICROAMPS_PER_KV: f64 = 2.0;

/// Deterministic peak-train generator.
pub struct SyntheticSource {
    rate_hz: f64,
    baseline: f64,
    peak_height: f64,
    peak_period_s: f64,
    peak_width_s: f64,
    noise: f64,
    rng: StdRng,
    feedback: Option<Arc<RecordingOutput>>,
    sample: u64,
    limit: Option<u64>,
    paced_from: Option<Instant>,
}

impl SyntheticSource {
    /// Source at `rate_hz` with a 3 s peak period, seeded for reproducible noise.
    pub fn new(rate_hz: f64, seed: u64) -> Self {
        Self {
            rate_hz,
            baseline: 10.0,
            peak_height: 100.0,
            peak_period_s: 3.0,
            peak_width_s: 0.1,
            noise: 0.5,
            rng: StdRng::seed_from_u64(seed),
            feedback: None,
            sample: 0,
            limit: None,
            paced_from: None,
        }
    }

    /// Mirror the level last written to `output` on the kV and µA channels.
    pub fn with_voltage_feedback(mut self, output: Arc<RecordingOutput>) -> Self {
        self.feedback = Some(output);
        self
    }

    /// Block in `read_chunk` so chunks arrive no faster than real time.
    pub fn paced(mut self) -> Self {
        self.paced_from = Some(Instant::now());
        self
    }

    /// End the stream after `samples` samples per channel.
    pub fn with_limit(mut self, samples: u64) -> Self {
        self.limit = Some(samples);
        self
    }

    /// Peak amplitude and noise half-width.
    pub fn with_shape(mut self, peak_height: f64, noise: f64) -> Self {
        self.peak_height = peak_height;
        self.noise = noise;
        self
    }

    fn rfu_at(&self, t: f64) -> f64 {
        let phase = t % self.peak_period_s - self.peak_period_s / 2.0;
        let z = phase / self.peak_width_s;
        self.baseline + self.peak_height * (-0.5 * z * z).exp()
    }
}

impl SampleSource for SyntheticSource {
    fn read_chunk(&mut self, n: usize) -> anyhow::Result<Option<ChannelChunk>> {
        let n = match self.limit {
            Some(limit) if self.sample >= limit => return Ok(None),
            Some(limit) => n.min((limit - self.sample) as usize),
            None => n,
        };

        let kv = match &self.feedback {
            Some(output) => output.level(),
            None => 0.0,
        };

        let mut chunk = ChannelChunk::with_capacity(n);
        for i in 0..n {
            let t = (self.sample + i as u64) as f64 / self.rate_hz;
            let jitter = if self.noise > 0.0 {
                self.rng.gen_range(-self.noise..=self.noise)
            } else {
                0.0
            };
            chunk.rfu.push(self.rfu_at(t) + jitter);
            chunk.voltage.push(kv);
            chunk.current.push(kv * MICROAMPS_PER_KV);
        }
        self.sample += n as u64;

        if let Some(start) = self.paced_from {
            let due = start + Duration::from_secs_f64(self.sample as f64 / self.rate_hz);
            let now = Instant::now();
            if due > now {
                std::thread::sleep(due - now);
            }
        }
        Ok(Some(chunk))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acquisition::AnalogOutput;

    #[test]
    fn same_seed_same_signal() {
        let mut a = SyntheticSource::new(1000.0, 7);
        let mut b = SyntheticSource::new(1000.0, 7);
        let ca = a.read_chunk(500).unwrap().unwrap();
        let cb = b.read_chunk(500).unwrap().unwrap();
        assert_eq!(ca.rfu, cb.rfu);
    }

    #[test]
    fn peak_sits_mid_period() {
        let mut source = SyntheticSource::new(100.0, 1).with_shape(100.0, 0.0);
        let chunk = source.read_chunk(300).unwrap().unwrap();
        let (argmax, _) = chunk
            .rfu
            .iter()
            .enumerate()
            .fold((0, f64::MIN), |best, (i, &v)| if v > best.1 { (i, v) } else { best });
        assert_eq!(argmax, 150);
        assert!((chunk.rfu[0] - 10.0).abs() < 1e-9);
    }

    #[test]
    fn limit_ends_stream() {
        let mut source = SyntheticSource::new(1000.0, 0).with_limit(150);
        assert_eq!(source.read_chunk(100).unwrap().unwrap().len(), 100);
        assert_eq!(source.read_chunk(100).unwrap().unwrap().len(), 50);
        assert!(source.read_chunk(100).unwrap().is_none());
    }

    #[test]
    fn voltage_is_mirrored() {
        let output = Arc::new(RecordingOutput::default());
        output.write(&[1.0, 2.0, 3.0]).unwrap();
        let mut source = SyntheticSource::new(1000.0, 0).with_voltage_feedback(output);
        let chunk = source.read_chunk(10).unwrap().unwrap();
        assert!(chunk.voltage.iter().all(|&v| v == 3.0));
        assert!(chunk.current.iter().all(|&i| i == 6.0));
    }
}
