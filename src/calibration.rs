//! Per-template amplitude bands for the greedy engine.
//!
//! A template's acceptance band `(a, b)` is fit offline against the
//! amplitudes its own training waveforms project to (`good`) and those that
//! other units' waveforms and raw noise project to (`bad`), by minimizing an
//! MCC-based misclassification cost that also rewards wide bands.

use crate::optimize::{differential_evolution, DeConfig};
use crate::templates::TemplateMatrix;
use ndarray::{Array1, Array2, Array3, Axis};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum CalibrationError {
    #[error("expected training waveforms for {expected} units, got {got}")]
    WrongNumberOfUnits { expected: usize, got: usize },
    #[error("unit {index} has no training waveforms")]
    EmptyUnitWaveforms { index: usize },
    #[error("waveforms for unit {index} have shape ({got_samples}, {got_channels}), expected ({num_samples}, {num_channels})")]
    WaveformShapeMismatch {
        index: usize,
        got_samples: usize,
        got_channels: usize,
        num_samples: usize,
        num_channels: usize,
    },
    #[error("noise snippets have shape ({got_samples}, {got_channels}), expected ({num_samples}, {num_channels})")]
    NoiseShapeMismatch {
        got_samples: usize,
        got_channels: usize,
        num_samples: usize,
        num_channels: usize,
    },
}

/// Training material supplied by the waveform extractor: raw (unmasked)
/// per-unit waveforms and random noise snippets, each `L × C`.
#[derive(Debug, Clone)]
pub struct CalibrationData {
    /// One `(num_waveforms, L, C)` array per unit.
    pub unit_waveforms: Vec<Array3<f32>>,
    /// `(num_snippets, L, C)`.
    pub noise_snippets: Array3<f32>,
}

impl CalibrationData {
    fn validate(
        &self,
        num_templates: usize,
        num_samples: usize,
        num_channels: usize,
    ) -> Result<(), CalibrationError> {
        if self.unit_waveforms.len() != num_templates {
            return Err(CalibrationError::WrongNumberOfUnits {
                expected: num_templates,
                got: self.unit_waveforms.len(),
            });
        }
        for (index, waveforms) in self.unit_waveforms.iter().enumerate() {
            let (count, samples, channels) = waveforms.dim();
            if count == 0 {
                return Err(CalibrationError::EmptyUnitWaveforms { index });
            }
            if samples != num_samples || channels != num_channels {
                return Err(CalibrationError::WaveformShapeMismatch {
                    index,
                    got_samples: samples,
                    got_channels: channels,
                    num_samples,
                    num_channels,
                });
            }
        }
        let (_, samples, channels) = self.noise_snippets.dim();
        if samples != num_samples || channels != num_channels {
            return Err(CalibrationError::NoiseShapeMismatch {
                got_samples: samples,
                got_channels: channels,
                num_samples,
                num_channels,
            });
        }
        Ok(())
    }
}

/// `1 − MCC` of classifying amplitudes by membership of `[a, b]`; 1 when the
/// contingency table degenerates.
fn mcc_error(a: f64, b: f64, good: &[f32], bad: &[f32]) -> f64 {
    let inside = |x: f32| -> bool {
        let x = x as f64;
        a <= x && x <= b
    };
    let tp = good.iter().filter(|&&x| inside(x)).count() as f64;
    let fn_ = good.len() as f64 - tp;
    let fp = bad.iter().filter(|&&x| inside(x)).count() as f64;
    let tn = bad.len() as f64 - fp;

    let denominator = (tp + fp) * (tp + fn_) * (tn + fp) * (tn + fn_);
    if denominator > 0.0 {
        1.0 - (tp * tn - fp * fn_) / denominator.sqrt()
    } else {
        1.0
    }
}

/// Weighted sum of the MCC error and the band-width penalty; minimal error
/// with the widest band that supports it.
fn band_cost(bounds: &[f64], good: &[f32], bad: &[f32], delta_amplitude: f64, alpha: f64) -> f64 {
    alpha * mcc_error(bounds[0], bounds[1], good, bad)
        + (1.0 - alpha) * (1.0 - (bounds[1] - bounds[0]) / delta_amplitude).abs()
}

/// Flatten `(K, L, C)` snippets to `(L·C, K)` columns matching the row-major
/// template flattening.
fn flatten_snippets(snippets: &Array3<f32>) -> Array2<f32> {
    let (count, num_samples, num_channels) = snippets.dim();
    let mut flat = Array2::zeros((num_samples * num_channels, count));
    for (k, snippet) in snippets.outer_iter().enumerate() {
        for (j, &value) in snippet.iter().enumerate() {
            flat[[j, k]] = value;
        }
    }
    flat
}

/// Project snippet columns onto every template; row `n` holds amplitudes in
/// units of template `n`'s own scale (its exact waveform projects to 1).
fn project_amplitudes(
    templates: &TemplateMatrix,
    norms: &Array1<f32>,
    flat: &Array2<f32>,
) -> Array2<f32> {
    let mut amplitudes = templates.dot(&flat.view());
    for (n, mut row) in amplitudes.outer_iter_mut().enumerate() {
        row /= norms[n];
    }
    amplitudes
}

/// Fit one `(a, b)` acceptance band per template.
///
/// `templates` is the normalized flat matrix of the greedy engine;
/// `min_amplitude`/`max_amplitude` bracket the search
/// (`a ∈ [min_amplitude, 1]`, `b ∈ [1, max_amplitude]`).
pub(crate) fn calibrate_amplitude_bands(
    templates: &TemplateMatrix,
    norms: &Array1<f32>,
    data: &CalibrationData,
    min_amplitude: f32,
    max_amplitude: f32,
    num_samples: usize,
    num_channels: usize,
    seed: u64,
) -> Result<Vec<(f32, f32)>, CalibrationError> {
    let num_templates = norms.len();
    data.validate(num_templates, num_samples, num_channels)?;

    let noise_amplitudes = project_amplitudes(templates, norms, &flatten_snippets(&data.noise_snippets));
    let unit_amplitudes: Vec<Array2<f32>> = data
        .unit_waveforms
        .iter()
        .map(|waveforms| project_amplitudes(templates, norms, &flatten_snippets(waveforms)))
        .collect();

    let alpha = 0.5;
    let delta = (max_amplitude - min_amplitude) as f64;
    let bounds = [(min_amplitude as f64, 1.0), (1.0, max_amplitude as f64)];

    let bands: Vec<(f32, f32)> = (0..num_templates)
        .into_par_iter()
        .map(|n| {
            let good: Vec<f32> = unit_amplitudes[n].row(n).to_vec();
            let floor = good.iter().fold(f32::INFINITY, |acc, &v| acc.min(v));

            // Other units' waveforms seen through template n, kept only where
            // they reach into the unit's own amplitude range.
            let mut bad: Vec<f32> = Vec::new();
            for (u, amplitudes) in unit_amplitudes.iter().enumerate() {
                if u == n {
                    continue;
                }
                bad.extend(amplitudes.row(n).iter().filter(|&&v| v >= floor));
            }
            bad.extend(noise_amplitudes.index_axis(Axis(0), n).iter());

            let objective = |x: &[f64]| band_cost(x, &good, &bad, delta, alpha);
            let mut rng = ChaCha8Rng::seed_from_u64(seed.wrapping_add(n as u64));
            let (x, cost) =
                differential_evolution(objective, &bounds, &DeConfig::default(), &mut rng);
            debug!(
                template = n,
                a = x[0],
                b = x[1],
                cost,
                num_good = good.len(),
                num_bad = bad.len(),
                "calibrated amplitude band"
            );
            (x[0] as f32, x[1] as f32)
        })
        .collect();

    Ok(bands)
}

#[cfg(test)]
mod tests {
    use super::*;
    use float_cmp::approx_eq;

    #[test]
    fn mcc_error_is_zero_for_a_separating_band() {
        let good = [0.9_f32, 1.0, 1.1];
        let bad = [0.1_f32, 0.2, 2.5];
        assert!(approx_eq!(f64, mcc_error(0.5, 1.5, &good, &bad), 0.0, epsilon = 1e-12));
    }

    #[test]
    fn mcc_error_is_one_when_degenerate() {
        // Band covering everything: no true negatives, no false negatives.
        let good = [1.0_f32];
        let bad = [1.0_f32];
        assert!(approx_eq!(f64, mcc_error(0.0, 2.0, &good, &bad), 1.0, epsilon = 1e-12));
    }

    #[test]
    fn inverted_band_penalized() {
        let good = [1.0_f32, 1.05];
        let bad = [0.2_f32];
        let err_good = mcc_error(0.8, 1.2, &good, &bad);
        let err_bad = mcc_error(0.0, 0.5, &good, &bad);
        assert!(err_good < err_bad);
    }

    #[test]
    fn cost_prefers_wider_band_at_equal_error() {
        let good = [1.0_f32];
        let bad: [f32; 0] = [];
        let narrow = band_cost(&[0.95, 1.05], &good, &bad, 1.0, 0.5);
        let wide = band_cost(&[0.6, 1.4], &good, &bad, 1.0, 0.5);
        assert!(wide < narrow);
    }
}
