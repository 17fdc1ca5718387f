//! Orthogonal Matching Pursuit peeler.
//!
//! Scores every template at every offset through the low-rank convolutional
//! path, then repeatedly selects the best (template, time) atom, extends the
//! Cholesky factor of the selected-atom Gram matrix, re-solves all committed
//! amplitudes jointly and subtracts the changed contributions from the score
//! matrix through the overlap tensor.

mod settings;

use crate::cholesky::GrowingCholesky;
use crate::compression::{compress_templates, LowRankTemplates};
use crate::convolution::OaConvolver;
use crate::engines::{best_valid_entry, Detection, Peeler, PeelerContext, PeelerSetupError, PeelerSolveError};
use crate::overlaps::{compute_overlaps, OverlapCache};
use crate::templates::{prepare_templates, zero_masked_channels, TemplateBank, TemplateBankError};
use ahash::AHashMap;
use ndarray::{s, Array1, Array2, ArrayView2};
pub use settings::{OmpSettings, OmpSettingsBuilder};
use sprs::CsMat;
use std::ops::Range;
use tracing::{debug, trace};

/// Atoms before the first Cholesky reallocation.
const INITIAL_SELECTION_CAPACITY: usize = 100;

pub struct OmpPeeler {
    num_templates: usize,
    num_samples: usize,
    num_channels: usize,
    nbefore: usize,
    margin: usize,
    norms: Array1<f32>,
    overlaps: Vec<CsMat<f32>>,
    lowrank: LowRankTemplates,
    convolver: OaConvolver,
    stop_criteria: Array1<f32>,
    amplitudes: (f32, f32),
    ignored: Vec<bool>,
    #[cfg_attr(not(feature = "vicinity"), allow(dead_code))]
    vicinity: usize,
}

/// Score columns touched by an atom at `peak`, and the matching columns of
/// the overlap rows.
#[derive(Clone)]
struct NeighborWindow {
    columns: Range<usize>,
    lags: Range<usize>,
}

impl NeighborWindow {
    fn around(peak: usize, num_samples: usize, num_positions: usize) -> Self {
        let start = peak.saturating_sub(num_samples - 1);
        let end = (peak + num_samples).min(num_positions);
        let lag_start = start + num_samples - 1 - peak;
        Self {
            columns: start..end,
            lags: lag_start..lag_start + (end - start),
        }
    }
}

impl OmpPeeler {
    /// Low-rank convolutional scoring: spatial projection, singular scaling,
    /// temporal convolution, summed over ranks.
    fn compute_scores(&self, traces: &ArrayView2<'_, f32>) -> Array2<f32> {
        let num_positions = traces.nrows() - self.num_samples + 1;
        let mut scores = Array2::zeros((self.num_templates, num_positions));
        for r in 0..self.lowrank.rank {
            for n in 0..self.num_templates {
                let component = self.lowrank.spatial.slice(s![r, n, ..]);
                let mut projected: Array1<f32> = traces.dot(&component);
                projected *= self.lowrank.singular[[r, n]];
                self.convolver.accumulate_valid(
                    r * self.num_templates + n,
                    projected.as_slice().expect("projection is contiguous"),
                    scores
                        .row_mut(n)
                        .into_slice()
                        .expect("score rows are contiguous"),
                );
            }
        }
        scores
    }
}

impl Peeler for OmpPeeler {
    type Settings = OmpSettings;

    fn name() -> &'static str {
        "omp"
    }

    fn setup(
        bank: &TemplateBank,
        context: &PeelerContext,
        settings: &Self::Settings,
    ) -> Result<Box<Self>, PeelerSetupError> {
        let num_templates = bank.num_templates();
        let num_samples = bank.num_samples();
        let num_channels = bank.num_channels();

        if !(0.0..=1.0).contains(&settings.omp_min_sps()) {
            return Err(PeelerSetupError::FractionOutOfRange {
                name: "omp_min_sps",
                value: settings.omp_min_sps(),
            });
        }
        let (min_amplitude, max_amplitude) = settings.amplitudes();
        if !(min_amplitude < max_amplitude) {
            return Err(PeelerSetupError::EmptyAmplitudeBand {
                min: min_amplitude,
                max: max_amplitude,
            });
        }
        if settings.rank() == 0 {
            return Err(PeelerSetupError::RankIsZero);
        }
        let max_rank = num_samples.min(num_channels);
        if settings.rank() > max_rank {
            return Err(PeelerSetupError::RankTooLarge {
                rank: settings.rank(),
                max_rank,
            });
        }
        if context.noise_levels.len() != num_channels {
            return Err(PeelerSetupError::NoiseLevelsMismatch {
                got: context.noise_levels.len(),
                expected: num_channels,
            });
        }
        if let Some(&index) = settings.ignored_ids().iter().find(|&&id| id >= num_templates) {
            return Err(PeelerSetupError::IgnoredIdOutOfRange {
                index,
                num_templates,
            });
        }
        if settings.vicinity() > 0 && !cfg!(feature = "vicinity") {
            return Err(PeelerSetupError::VicinityNotEnabled(settings.vicinity()));
        }

        let masks = bank.resolve_masks(&settings.sparse_method(), &context.noise_levels);
        let prepared = prepare_templates(bank, masks)?;

        // The norms, normalized templates and overlaps are all derived from
        // the rank-R reconstruction, so scores and residual updates agree to
        // truncation error. Truncation need not keep the masked channels at
        // exactly zero; that energy is discarded so norms and overlaps
        // describe the masked waveforms.
        let (mut lowrank, mut approximated) = compress_templates(&prepared.dense, settings.rank());
        zero_masked_channels(&mut approximated, &prepared.masks);
        let norms = Array1::from_iter(
            approximated
                .outer_iter()
                .map(|template| template.iter().map(|v| v * v).sum::<f32>().sqrt()),
        );
        if let Some(index) = norms.iter().position(|&n| !(n > 0.0)) {
            return Err(TemplateBankError::DegenerateTemplate { index }.into());
        }

        let mut normalized = approximated;
        for (n, mut template) in normalized.outer_iter_mut().enumerate() {
            template /= norms[n];
        }
        let overlaps = compute_overlaps(&normalized);
        lowrank.scale_by_norms(&norms);

        let kernels: Vec<&[f32]> = (0..settings.rank())
            .flat_map(|r| (0..num_templates).map(move |n| (r, n)))
            .map(|(r, n)| {
                lowrank
                    .temporal
                    .slice(s![r, n, ..])
                    .to_slice()
                    .expect("temporal atoms are contiguous")
            })
            .collect();
        let convolver = OaConvolver::new(kernels, num_samples);

        let noise_energy: f32 = context.noise_levels.iter().map(|v| v * v).sum();
        let floor = (noise_energy * num_samples as f32).sqrt();
        let stop_criteria = norms.mapv(|norm| settings.omp_min_sps() * norm.max(floor));

        let mut ignored = vec![false; num_templates];
        for &id in settings.ignored_ids() {
            ignored[id] = true;
        }

        debug!(
            num_templates,
            num_samples,
            num_channels,
            rank = settings.rank(),
            "omp peeler ready"
        );

        Ok(Box::new(Self {
            num_templates,
            num_samples,
            num_channels,
            nbefore: bank.nbefore(),
            margin: 2 * bank.nbefore().max(bank.nafter()),
            norms,
            overlaps,
            lowrank,
            convolver,
            stop_criteria,
            amplitudes: settings.amplitudes(),
            ignored,
            vicinity: settings.vicinity(),
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

        let mut scores = self.compute_scores(&traces);
        for (n, &skip) in self.ignored.iter().enumerate() {
            if skip {
                scores.row_mut(n).fill(f32::NEG_INFINITY);
            }
        }
        let num_positions = scores.ncols();
        let full_scores = scores.clone();

        let mut cache = OverlapCache::new(self.num_templates);
        let mut neighbors: AHashMap<usize, NeighborWindow> = AHashMap::new();
        let mut cholesky = GrowingCholesky::with_capacity(INITIAL_SELECTION_CAPACITY);
        let mut selection: Vec<(usize, usize)> = Vec::new();
        let mut final_amplitudes = Array2::<f32>::zeros(scores.raw_dim());
        let mut solved: Vec<f32> = Vec::new();

        while let Some((best_cluster, best_peak)) =
            best_valid_entry(&scores, |n, value| value > self.stop_criteria[n])
        {
            let appended = if selection.is_empty() {
                cholesky.push_row(&[])
            } else {
                let mut gram = vec![0.0_f32; selection.len()];
                let dense = cache.get(best_cluster, &self.overlaps);
                for (i, &(cluster, peak)) in selection.iter().enumerate() {
                    let delta = peak as isize - best_peak as isize;
                    if delta.unsigned_abs() >= self.num_samples {
                        // Atoms further apart than one template never couple.
                        continue;
                    }
                    let column = (self.num_samples as isize - 1 + delta) as usize;
                    gram[i] = dense[[cluster, column]];
                }

                #[cfg(feature = "vicinity")]
                let appended = if self.vicinity > 0 {
                    let active: Vec<usize> = selection
                        .iter()
                        .enumerate()
                        .filter(|&(_, &(_, peak))| {
                            (peak as isize - best_peak as isize).unsigned_abs() < self.vicinity
                        })
                        .map(|(i, _)| i)
                        .collect();
                    cholesky.push_row_restricted(&gram, &active)
                } else {
                    cholesky.push_row(&gram)
                };
                #[cfg(not(feature = "vicinity"))]
                let appended = cholesky.push_row(&gram);
                appended
            };
            if !appended {
                trace!(
                    num_selected = selection.len(),
                    "selected atoms became linearly dependent"
                );
                break;
            }
            selection.push((best_cluster, best_peak));

            // Joint re-fit of every committed amplitude against the original
            // scores.
            solved.clear();
            solved.extend(selection.iter().map(|&(n, p)| full_scores[[n, p]]));
            cholesky.solve(&mut solved);

            for (i, &(cluster, peak)) in selection.iter().enumerate() {
                let amplitude = solved[i] / self.norms[cluster];
                let diff = amplitude - final_amplitudes[[cluster, peak]];
                if diff.abs() <= f32::EPSILON {
                    continue;
                }
                final_amplitudes[[cluster, peak]] = amplitude;

                let window = neighbors
                    .entry(peak)
                    .or_insert_with(|| {
                        NeighborWindow::around(peak, self.num_samples, num_positions)
                    })
                    .clone();
                let dense = cache.get(cluster, &self.overlaps);
                let mut block = scores.slice_mut(s![.., window.columns.clone()]);
                block.scaled_add(-diff * self.norms[cluster], &dense.slice(s![.., window.lags]));
            }
        }

        let (min_amplitude, max_amplitude) = self.amplitudes;
        let mut detections: Vec<Detection> = final_amplitudes
            .indexed_iter()
            .filter(|&(_, &amplitude)| amplitude > min_amplitude && amplitude < max_amplitude)
            .map(|((cluster, peak), &amplitude)| Detection {
                sample_index: peak + self.nbefore,
                channel_index: 0,
                cluster_index: cluster,
                amplitude,
                segment_index,
            })
            .collect();
        detections.sort_by_key(|detection| detection.sample_index);

        debug!(
            num_selected = selection.len(),
            num_detections = detections.len(),
            "omp peel complete"
        );
        Ok(detections)
    }

    fn margin(&self) -> usize {
        self.margin
    }
}
