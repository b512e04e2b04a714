//! Low-pass + downsample stages for the RFU channel.
//!
//! A stage is a 4th-order Butterworth low-pass (two cascaded `biquad` sections) run
//! forward and then backward over the whole input, so the result has no phase shift,
//! followed by keeping every `factor`-th sample. The filter state starts from rest on
//! every call; callers hide the resulting edge transients by filtering a wider window
//! and keeping only its middle (see [`middle_third`]).

use anyhow::{anyhow, ensure, Result};
use biquad::{Biquad, Coefficients, DirectForm2Transposed, ToHertz, Type};

/// Q of the two sections of a 4th-order Butterworth.
const BUTTERWORTH_Q4: [f64; 2] = [0.541_196_100_146_197, 1.306_562_964_876_376_7];

/// Cutoff as a fraction of the post-decimation Nyquist frequency.
const CUTOFF_FRACTION: f64 = 0.8;

/// One decimate-by-`factor` stage.
#[derive(Debug, Clone)]
pub struct Decimator {
    factor: usize,
    sections: [Coefficients<f64>; 2],
}

impl Decimator {
    /// Stage reducing the rate by `factor` (at least 2).
    pub fn new(factor: usize) -> Result<Self> {
        ensure!(factor >= 2, "decimation factor must be at least 2, got {factor}");
        // Normalised to fs = 1: new Nyquist is 0.5 / factor.
        let cutoff = CUTOFF_FRACTION * 0.5 / factor as f64;
        let design = |q: f64| {
            Coefficients::<f64>::from_params(Type::LowPass, 1.0_f64.hz(), cutoff.hz(), q)
                .map_err(|e| anyhow!("low-pass design failed: {e:?}"))
        };
        Ok(Self {
            factor,
            sections: [design(BUTTERWORTH_Q4[0])?, design(BUTTERWORTH_Q4[1])?],
        })
    }

    /// Rate reduction of this stage.
    pub fn factor(&self) -> usize {
        self.factor
    }

    /// Zero-phase low-pass of `input`.
    pub fn lowpass(&self, input: &[f64]) -> Vec<f64> {
        let mut data = input.to_vec();
        self.run_sections(data.iter_mut());
        self.run_sections(data.iter_mut().rev());
        data
    }

    fn run_sections<'a>(&self, samples: impl Iterator<Item = &'a mut f64>) {
        let mut first = DirectForm2Transposed::<f64>::new(self.sections[0]);
        let mut second = DirectForm2Transposed::<f64>::new(self.sections[1]);
        for x in samples {
            *x = second.run(first.run(*x));
        }
    }

    /// Low-pass then keep every `factor`-th sample; output length is `ceil(n / factor)`.
    pub fn decimate(&self, input: &[f64]) -> Vec<f64> {
        self.lowpass(input)
            .into_iter()
            .step_by(self.factor)
            .collect()
    }
}

/// Result of running the cascade over one window.
#[derive(Debug, Clone, PartialEq)]
pub struct CascadeOutput {
    /// Filtered series for the whole window.
    pub values: Vec<f64>,
    /// Rate of `values`.
    pub rate_hz: f64,
    /// Stages applied.
    pub stages: usize,
}

/// The cascade hit an input shorter than the minimum stage length.
#[derive(Debug, Clone, Copy, PartialEq, thiserror::Error)]
#[error("decimation underflow: {len} samples at {rate_hz} Hz, need at least {min}")]
pub struct Underflow {
    #[allow(missing_docs)]
    pub len: usize,
    #[allow(missing_docs)]
    pub rate_hz: f64,
    #[allow(missing_docs)]
    pub min: usize,
}

/// Apply `stage` repeatedly while the rate is above `max_rate_hz`.
pub fn cascade(
    stage: &Decimator,
    input: &[f64],
    rate_hz: f64,
    max_rate_hz: f64,
    min_stage_len: usize,
) -> std::result::Result<CascadeOutput, Underflow> {
    let mut values = input.to_vec();
    let mut rate = rate_hz;
    let mut stages = 0;
    while rate > max_rate_hz {
        if values.len() < min_stage_len {
            return Err(Underflow {
                len: values.len(),
                rate_hz: rate,
                min: min_stage_len,
            });
        }
        values = stage.decimate(&values);
        rate /= stage.factor() as f64;
        stages += 1;
    }
    Ok(CascadeOutput {
        values,
        rate_hz: rate,
        stages,
    })
}

/// Middle third of `values`.
pub fn middle_third(values: &[f64]) -> &[f64] {
    let n = values.len();
    &values[n / 3..2 * n / 3]
}

/// Mean of `n_out` consecutive blocks of `input`.
///
/// Block boundaries are spread evenly, so every input sample lands in exactly one block.
pub fn block_average(input: &[f64], n_out: usize) -> Vec<f64> {
    if n_out == 0 || input.is_empty() {
        return Vec::new();
    }
    let n = input.len();
    (0..n_out)
        .map(|k| {
            let lo = k * n / n_out;
            let hi = ((k + 1) * n / n_out).max(lo + 1).min(n);
            let block = &input[lo.min(n - 1)..hi];
            block.iter().sum::<f64>() / block.len() as f64
        })
        .collect()
}

/// `n_out` samples picked at evenly spaced positions of `input`, without filtering.
pub fn subsample(input: &[f64], n_out: usize) -> Vec<f64> {
    if n_out == 0 || input.is_empty() {
        return Vec::new();
    }
    let n = input.len();
    (0..n_out).map(|k| input[(k * n / n_out).min(n - 1)]).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f64::consts::PI;

    #[test]
    fn factor_below_two_is_rejected() {
        assert!(Decimator::new(1).is_err());
        assert!(Decimator::new(10).is_ok());
    }

    #[test]
    fn decimate_length_is_ceiling() {
        let stage = Decimator::new(10).unwrap();
        assert_eq!(stage.decimate(&vec![0.0; 100]).len(), 10);
        assert_eq!(stage.decimate(&vec![0.0; 101]).len(), 11);
    }

    #[test]
    fn lowpass_passes_dc() {
        let stage = Decimator::new(10).unwrap();
        let out = stage.lowpass(&vec![3.0; 2000]);
        // Edges settle from rest; the middle is flat.
        for v in &out[800..1200] {
            assert!((v - 3.0).abs() < 1e-6, "got {v}");
        }
    }

    #[test]
    fn lowpass_removes_high_frequency() {
        let stage = Decimator::new(10).unwrap();
        // 0.4 cycles/sample is far above the 0.04 cutoff.
        let tone: Vec<f64> = (0..4000).map(|i| (2.0 * PI * 0.4 * i as f64).sin()).collect();
        let out = stage.lowpass(&tone);
        let peak = out[1000..3000].iter().fold(0.0_f64, |m, v| m.max(v.abs()));
        assert!(peak < 1e-3, "residual amplitude {peak}");
    }

    #[test]
    fn cascade_reaches_target_band() {
        let stage = Decimator::new(10).unwrap();
        let out = cascade(&stage, &vec![1.0; 150_000], 50_000.0, 10.0, 30).unwrap();
        assert_eq!(out.stages, 4);
        assert_eq!(out.rate_hz, 5.0);
        assert_eq!(out.values.len(), 15);
        assert_eq!(middle_third(&out.values).len(), 5);
    }

    #[test]
    fn cascade_underflow_is_reported() {
        let stage = Decimator::new(10).unwrap();
        let err = cascade(&stage, &vec![1.0; 300], 50_000.0, 10.0, 30).unwrap_err();
        assert_eq!(err.min, 30);
        assert_eq!(err.len, 3);
    }

    #[test]
    fn block_average_covers_all_samples() {
        let input: Vec<f64> = (0..10).map(f64::from).collect();
        assert_eq!(block_average(&input, 2), vec![2.0, 7.0]);
        assert_eq!(block_average(&input, 1), vec![4.5]);
        assert!(block_average(&input, 0).is_empty());
    }

    #[test]
    fn subsample_picks_block_starts() {
        let input: Vec<f64> = (0..10).map(f64::from).collect();
        assert_eq!(subsample(&input, 5), vec![0.0, 2.0, 4.0, 6.0, 8.0]);
    }
}
