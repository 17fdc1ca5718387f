//! Greedy matched-filter peeler.
//!
//! Scores the template bank at detected peaks only, then repeatedly accepts
//! the best in-band (template, peak) pair, subtracting its contribution from
//! the neighbouring peak scores through the overlap tensor and locking that
//! cluster out of the touched region.

mod settings;

use crate::calibration::calibrate_amplitude_bands;
use crate::engines::{best_valid_entry, Detection, Peeler, PeelerContext, PeelerSetupError, PeelerSolveError};
use crate::overlaps::{compute_overlaps, OverlapCache};
use crate::peaks::{ByChannelDetector, Peak, PeakDetector, PeakSign};
use crate::templates::{prepare_templates, TemplateBank, TemplateMatrix};
use ndarray::{s, Array1, Array2, ArrayView2};
pub use settings::{GreedySettings, GreedySettingsBuilder};
use sprs::CsMat;
use tracing::debug;

pub struct GreedyPeeler {
    num_templates: usize,
    num_samples: usize,
    num_channels: usize,
    nbefore: usize,
    nafter: usize,
    margin: usize,
    norms: Array1<f32>,
    templates: TemplateMatrix,
    overlaps: Vec<CsMat<f32>>,
    /// Acceptance bands in score units, `band · ‖W‖`.
    min_scores: Array1<f32>,
    max_scores: Array1<f32>,
    /// Calibrated bands in normalized units, for inspection.
    bands: Vec<(f32, f32)>,
    thresholds: Array1<f32>,
    exclude_sweep_size: usize,
    jitter: usize,
    peak_sign: PeakSign,
    detector: Box<dyn PeakDetector>,
}

/// Expand each peak to `±jitter` samples inside the open interior interval,
/// then deduplicate by sample keeping the first-occurring channel.
fn expand_and_dedup(peaks: Vec<Peak>, jitter: usize, interior_len: usize) -> Vec<Peak> {
    let mut expanded = if jitter == 0 {
        peaks
    } else {
        let mut out = Vec::with_capacity(peaks.len() * 2 * jitter);
        for peak in &peaks {
            for offset in -(jitter as isize)..jitter as isize {
                let sample = peak.sample_index as isize + offset;
                if sample > 0 && (sample as usize) < interior_len {
                    out.push(Peak {
                        sample_index: sample as usize,
                        channel_index: peak.channel_index,
                    });
                }
            }
        }
        out
    };
    // Stable sort so ties keep their original (first-detected) channel.
    expanded.sort_by_key(|peak| peak.sample_index);
    expanded.dedup_by_key(|peak| peak.sample_index);
    expanded
}

/// Subtract an accepted atom from the scores of the peaks in
/// `neighbours` and lock its cluster out of that range. `lag_of` maps a
/// neighbour column to its lag column in the overlap rows.
fn subtract_atom(
    scores: &mut Array2<f32>,
    overlap_rows: &Array2<f32>,
    cluster: usize,
    amplitude: f32,
    neighbours: std::ops::Range<usize>,
    lag_of: impl Fn(usize) -> usize,
) {
    for column in neighbours.clone() {
        let lag = lag_of(column);
        scores
            .column_mut(column)
            .scaled_add(-amplitude, &overlap_rows.column(lag));
    }
    for column in neighbours {
        scores[[cluster, column]] = f32::NEG_INFINITY;
    }
}

impl GreedyPeeler {
    /// Replace the bundled [`ByChannelDetector`].
    pub fn with_detector(mut self: Box<Self>, detector: Box<dyn PeakDetector>) -> Box<Self> {
        self.detector = detector;
        self
    }

    /// Calibrated `(a, b)` acceptance band of each template, in normalized
    /// amplitude units.
    pub fn amplitude_bands(&self) -> &[(f32, f32)] {
        &self.bands
    }
}

impl Peeler for GreedyPeeler {
    type Settings = GreedySettings;

    fn name() -> &'static str {
        "greedy"
    }

    fn setup(
        bank: &TemplateBank,
        context: &PeelerContext,
        settings: &Self::Settings,
    ) -> Result<Box<Self>, PeelerSetupError> {
        let num_templates = bank.num_templates();
        let num_samples = bank.num_samples();
        let num_channels = bank.num_channels();

        if !(0.0..=1.0).contains(&settings.use_sparse_matrix_threshold()) {
            return Err(PeelerSetupError::FractionOutOfRange {
                name: "use_sparse_matrix_threshold",
                value: settings.use_sparse_matrix_threshold(),
            });
        }
        if !(settings.min_amplitude() <= 1.0 && 1.0 <= settings.max_amplitude()) {
            return Err(PeelerSetupError::AmplitudeBracketExcludesOne {
                min: settings.min_amplitude(),
                max: settings.max_amplitude(),
            });
        }
        if !(settings.min_amplitude() < settings.max_amplitude()) {
            return Err(PeelerSetupError::EmptyAmplitudeBand {
                min: settings.min_amplitude(),
                max: settings.max_amplitude(),
            });
        }
        if context.noise_levels.len() != num_channels {
            return Err(PeelerSetupError::NoiseLevelsMismatch {
                got: context.noise_levels.len(),
                expected: num_channels,
            });
        }
        let calibration = context
            .calibration
            .as_ref()
            .ok_or(PeelerSetupError::MissingCalibrationData)?;

        let masks = bank.resolve_masks(&settings.sparse_method(), &context.noise_levels);
        let prepared = prepare_templates(bank, masks)?;

        let templates = TemplateMatrix::from_templates(
            &prepared.normalized,
            settings.use_sparse_matrix_threshold(),
        );
        debug!(
            density = templates.density(),
            sparse = !templates.is_dense(),
            "flattened template matrix"
        );
        let overlaps = compute_overlaps(&prepared.normalized);

        let bands = calibrate_amplitude_bands(
            &templates,
            &prepared.norms,
            calibration,
            settings.min_amplitude(),
            settings.max_amplitude(),
            num_samples,
            num_channels,
            settings.calibration_seed(),
        )?;

        let min_scores =
            Array1::from_iter(bands.iter().zip(prepared.norms.iter()).map(|(b, n)| b.0 * n));
        let max_scores =
            Array1::from_iter(bands.iter().zip(prepared.norms.iter()).map(|(b, n)| b.1 * n));

        let samples_per_ms = bank.sampling_frequency() / 1000.0;
        let exclude_sweep_size = (settings.exclude_sweep_ms() * samples_per_ms) as usize;
        let jitter = (settings.jitter_ms() * samples_per_ms) as usize;
        let thresholds = context.noise_levels.mapv(|level| level * settings.detect_threshold());

        debug!(
            num_templates,
            num_samples,
            num_channels,
            exclude_sweep_size,
            jitter,
            "greedy peeler ready"
        );

        Ok(Box::new(Self {
            num_templates,
            num_samples,
            num_channels,
            nbefore: bank.nbefore(),
            nafter: bank.nafter(),
            margin: 2 * bank.nbefore().max(bank.nafter()),
            norms: prepared.norms,
            templates,
            overlaps,
            min_scores,
            max_scores,
            bands,
            thresholds,
            exclude_sweep_size,
            jitter,
            peak_sign: settings.peak_sign(),
            detector: Box::new(ByChannelDetector),
        }))
    }

    fn peel(
        &self,
        traces: ArrayView2<'_, f32>,
        segment_index: usize,
    ) -> Result<Vec<Detection>, PeelerSolveError> {
        if traces.ncols() != self.num_channels {
            return Err(PeelerSolveError::ChannelMismatch {
                got: traces.ncols(),
                expected: self.num_channels,
            });
        }
        let required = self.margin + self.num_samples;
        if traces.nrows() < required {
            return Err(PeelerSolveError::ChunkTooShort {
                num_timesteps: traces.nrows(),
                required,
            });
        }

        let half_margin = self.margin / 2;
        let interior = traces.slice(s![half_margin..traces.nrows() - half_margin, ..]);
        let raw_peaks = self.detector.detect(
            interior,
            &self.thresholds,
            self.exclude_sweep_size,
            self.peak_sign,
        );
        let peaks = expand_and_dedup(raw_peaks, self.jitter, interior.nrows());
        if peaks.is_empty() {
            return Ok(Vec::new());
        }

        let samples: Vec<usize> = peaks
            .iter()
            .map(|peak| peak.sample_index + half_margin)
            .collect();
        let channels: Vec<usize> = peaks.iter().map(|peak| peak.channel_index).collect();
        let num_peaks = samples.len();

        let mut snippets = Array2::zeros((self.num_samples * self.num_channels, num_peaks));
        for (index, &sample) in samples.iter().enumerate() {
            let window = traces.slice(s![sample - self.nbefore..sample + self.nafter, ..]);
            for (j, &value) in window.iter().enumerate() {
                snippets[[j, index]] = value;
            }
        }
        let mut scores = self.templates.dot(&snippets.view());

        let window = self.num_samples - 1;
        let mut cache = OverlapCache::new(self.num_templates);
        let mut detections = Vec::new();

        while let Some((best_cluster, best_peak)) = best_valid_entry(&scores, |n, value| {
            value > self.min_scores[n] && value < self.max_scores[n]
        }) {
            let amplitude = scores[[best_cluster, best_peak]];
            let sample = samples[best_peak];

            // Peaks within one template length, by binary search on the
            // sorted sample array.
            let lo = samples.partition_point(|&s| s + window < sample);
            let hi = samples.partition_point(|&s| s <= sample + window);
            let dense = cache.get(best_cluster, &self.overlaps);
            subtract_atom(&mut scores, dense, best_cluster, amplitude, lo..hi, |column| {
                samples[column] + window - sample
            });

            detections.push(Detection {
                sample_index: sample,
                channel_index: channels[best_peak],
                cluster_index: best_cluster,
                amplitude: amplitude / self.norms[best_cluster],
                segment_index,
            });
        }

        detections.sort_by_key(|detection| detection.sample_index);
        debug!(
            num_peaks,
            num_detections = detections.len(),
            "greedy peel complete"
        );
        Ok(detections)
    }

    fn margin(&self) -> usize {
        self.margin
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{calibration_data, gabor_bank, inject_template, quiet_context};
    use float_cmp::approx_eq;

    fn greedy_fixture(bank: &TemplateBank) -> Box<GreedyPeeler> {
        let context = quiet_context(bank.num_channels())
            .with_calibration(calibration_data(bank, 40, 60, 0.01, 9));
        let settings = GreedySettingsBuilder::default().build();
        GreedyPeeler::setup(bank, &context, &settings).unwrap()
    }

    #[test]
    fn peaks_expand_then_deduplicate() {
        let peaks = vec![
            Peak {
                sample_index: 10,
                channel_index: 2,
            },
            Peak {
                sample_index: 12,
                channel_index: 0,
            },
        ];
        let expanded = expand_and_dedup(peaks, 2, 100);
        let samples: Vec<usize> = expanded.iter().map(|p| p.sample_index).collect();
        assert_eq!(samples, vec![8, 9, 10, 11, 12, 13]);
        // Overlapping expansions keep the first peak's channel.
        assert!(expanded.iter().take(4).all(|p| p.channel_index == 2));
        assert!(expanded.iter().skip(4).all(|p| p.channel_index == 0));
    }

    #[test]
    fn jitter_respects_the_interior_bounds() {
        let peaks = vec![Peak {
            sample_index: 1,
            channel_index: 0,
        }];
        let expanded = expand_and_dedup(peaks, 3, 3);
        let samples: Vec<usize> = expanded.iter().map(|p| p.sample_index).collect();
        assert_eq!(samples, vec![1, 2]);
    }

    #[test]
    fn residual_update_subtracts_the_overlap_projection() {
        // Two clusters, three peaks; accept cluster 0 at the middle peak.
        let mut scores = ndarray::array![[1.0_f32, 2.0, 0.5], [0.4, 0.3, 0.2]];
        let before = scores.clone();
        // Overlap rows of cluster 0 against both clusters over 5 lags.
        let overlap_rows = ndarray::array![
            [0.1_f32, 0.4, 1.0, 0.4, 0.1],
            [0.05, 0.2, 0.6, 0.2, 0.05]
        ];
        let amplitude = 2.0;
        // Peaks at samples 7, 9, 10 with L = 3 -> window = 2; all neighbours.
        let samples = [7_usize, 9, 10];
        subtract_atom(&mut scores, &overlap_rows, 0, amplitude, 0..3, |column| {
            samples[column] + 2 - 9
        });

        for (column, &sample) in samples.iter().enumerate() {
            let lag = sample + 2 - 9;
            assert_eq!(scores[[0, column]], f32::NEG_INFINITY);
            assert!(approx_eq!(
                f32,
                scores[[1, column]],
                before[[1, column]] - amplitude * overlap_rows[[1, lag]],
                epsilon = 1e-6
            ));
        }
    }

    #[test]
    fn recovers_an_injected_spike_at_its_peak_channel() {
        let bank = gabor_bank(2, 32, 4);
        let peeler = greedy_fixture(&bank);

        let mut traces = Array2::zeros((240, 4));
        inject_template(&mut traces, &bank, 0, 100, 1.0);

        let detections = peeler.peel(traces.view(), 1).unwrap();
        assert_eq!(detections.len(), 1);
        let detection = &detections[0];
        assert_eq!(detection.cluster_index, 0);
        assert_eq!(detection.sample_index, 100 + bank.nbefore());
        // The first template peaks on the first channel.
        assert_eq!(detection.channel_index, 0);
        assert_eq!(detection.segment_index, 1);
        assert!((detection.amplitude - 1.0).abs() < 0.05);
    }

    #[test]
    fn silent_chunk_yields_no_peaks_and_no_detections() {
        let bank = gabor_bank(2, 32, 4);
        let peeler = greedy_fixture(&bank);
        let traces = Array2::zeros((240, 4));
        assert!(peeler.peel(traces.view(), 0).unwrap().is_empty());
    }

    #[test]
    fn calibration_data_is_required() {
        let bank = gabor_bank(2, 32, 4);
        let context = quiet_context(4);
        let settings = GreedySettingsBuilder::default().build();
        assert!(matches!(
            GreedyPeeler::setup(&bank, &context, &settings),
            Err(PeelerSetupError::MissingCalibrationData)
        ));
    }
}
