//! Utilities for unit tests: synthetic template banks, traces and
//! calibration material.

use crate::calibration::CalibrationData;
use crate::engines::PeelerContext;
use crate::templates::TemplateBank;
use ndarray::{s, Array1, Array2, Array3, Axis};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Normal};

/// Gaussian-modulated cosine templates with one frequency per template and
/// channel weights drifting across the probe, so distinct templates stay
/// weakly correlated. Each template has unit norm and its (negative) peak at
/// sample `L / 2`.
pub fn gabor_templates(
    num_templates: usize,
    num_samples: usize,
    num_channels: usize,
    cycles: &[f32],
) -> Array3<f32> {
    assert_eq!(cycles.len(), num_templates);
    let mut templates = Array3::zeros((num_templates, num_samples, num_channels));
    let center = (num_samples / 2) as f32;
    let sigma = num_samples as f32 / 6.0;

    for n in 0..num_templates {
        let channel_center = if num_templates > 1 {
            n as f32 * (num_channels - 1) as f32 / (num_templates - 1) as f32
        } else {
            0.0
        };
        for t in 0..num_samples {
            let dt = t as f32 - center;
            let envelope = (-dt * dt / (2.0 * sigma * sigma)).exp();
            let wave = -(std::f32::consts::TAU * cycles[n] * dt / num_samples as f32).cos();
            for c in 0..num_channels {
                let dc = c as f32 - channel_center;
                templates[[n, t, c]] = envelope * wave * (-dc * dc / 2.0).exp();
            }
        }
        let mut template = templates.index_axis_mut(Axis(0), n);
        let norm = template.iter().map(|v| v * v).sum::<f32>().sqrt();
        template /= norm;
    }
    templates
}

/// A bank of [`gabor_templates`] at 10 kHz, peak-aligned to `L / 2`, with
/// frequencies `3 + 2n` cycles.
pub fn gabor_bank(num_templates: usize, num_samples: usize, num_channels: usize) -> TemplateBank {
    let cycles: Vec<f32> = (0..num_templates).map(|n| 3.0 + 2.0 * n as f32).collect();
    let templates = gabor_templates(num_templates, num_samples, num_channels, &cycles);
    let nbefore = num_samples / 2;
    TemplateBank::new(templates, nbefore, num_samples - nbefore, 10_000.0).unwrap()
}

/// A context with near-silent noise levels, for clean recovery tests.
pub fn quiet_context(num_channels: usize) -> PeelerContext {
    PeelerContext::new(Array1::from_elem(num_channels, 0.01))
}

/// Seeded white-noise traces.
pub fn white_noise_traces(
    num_timesteps: usize,
    num_channels: usize,
    sigma: f32,
    seed: u64,
) -> Array2<f32> {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let normal = Normal::new(0.0, sigma).unwrap();
    Array2::from_shape_fn((num_timesteps, num_channels), |_| normal.sample(&mut rng))
}

/// Add `amplitude` times template `cluster` to the traces starting at sample
/// `at`.
pub fn inject_template(
    traces: &mut Array2<f32>,
    bank: &TemplateBank,
    cluster: usize,
    at: usize,
    amplitude: f32,
) {
    let template = bank.templates().index_axis(Axis(0), cluster);
    let mut window = traces.slice_mut(s![at..at + bank.num_samples(), ..]);
    window.scaled_add(amplitude, &template);
}

/// Per-channel noise levels as the scaled median absolute deviation.
pub fn mad_noise_levels(traces: &Array2<f32>) -> Array1<f32> {
    let median = |values: &mut Vec<f32>| -> f32 {
        values.sort_by(|a, b| a.partial_cmp(b).expect("noise levels must not be NaN"));
        values[values.len() / 2]
    };
    Array1::from_iter((0..traces.ncols()).map(|channel| {
        let mut values: Vec<f32> = traces.column(channel).to_vec();
        let center = median(&mut values);
        let mut deviations: Vec<f32> = values.iter().map(|v| (v - center).abs()).collect();
        median(&mut deviations) / 0.674_489_7
    }))
}

/// Training material around a bank: per-unit waveforms with amplitudes close
/// to 1 plus additive noise, and raw noise snippets.
pub fn calibration_data(
    bank: &TemplateBank,
    num_waveforms: usize,
    num_noise_snippets: usize,
    sigma: f32,
    seed: u64,
) -> CalibrationData {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let noise = Normal::new(0.0_f32, sigma).unwrap();
    let amplitude_spread = Normal::new(1.0_f32, 0.05).unwrap();
    let (num_samples, num_channels) = (bank.num_samples(), bank.num_channels());

    let unit_waveforms = (0..bank.num_templates())
        .map(|cluster| {
            let template = bank.templates().index_axis(Axis(0), cluster);
            let mut waveforms = Array3::zeros((num_waveforms, num_samples, num_channels));
            for mut waveform in waveforms.outer_iter_mut() {
                let amplitude = amplitude_spread.sample(&mut rng);
                waveform.assign(&template);
                waveform *= amplitude;
                waveform.mapv_inplace(|v| v + noise.sample(&mut rng));
            }
            waveforms
        })
        .collect();

    let mut noise_snippets = Array3::zeros((num_noise_snippets, num_samples, num_channels));
    noise_snippets.mapv_inplace(|_| noise.sample(&mut rng));

    CalibrationData {
        unit_waveforms,
        noise_snippets,
    }
}
