//! The two sibling template-matching engines and their shared contract.
//!
//! The engines share the template bank, the overlap tensor and the detection
//! record, but have no runtime polymorphism between them; each is set up from
//! its own settings record and driven chunk by chunk through [`Peeler`].

use crate::calibration::{CalibrationData, CalibrationError};
use crate::templates::{TemplateBank, TemplateBankError};
use ndarray::{Array1, ArrayView2};
use serde::{Deserialize, Serialize};
use thiserror::Error;

mod greedy;
mod omp;

pub use greedy::{GreedyPeeler, GreedySettings, GreedySettingsBuilder};
pub use omp::{OmpPeeler, OmpSettings, OmpSettingsBuilder};

#[derive(Error, Debug)]
pub enum PeelerSetupError {
    #[error("`{name}` should be in [0, 1], got {value}")]
    FractionOutOfRange { name: &'static str, value: f32 },
    #[error("amplitude band ({min}, {max}) is empty")]
    EmptyAmplitudeBand { min: f32, max: f32 },
    #[error("amplitude bracket ({min}, {max}) must straddle 1")]
    AmplitudeBracketExcludesOne { min: f32, max: f32 },
    #[error("rank {rank} exceeds the template dimension {max_rank}")]
    RankTooLarge { rank: usize, max_rank: usize },
    #[error("rank must be at least 1")]
    RankIsZero,
    #[error("ignored template index {index} out of range for {num_templates} templates")]
    IgnoredIdOutOfRange { index: usize, num_templates: usize },
    #[error("noise levels have {got} channels, expected {expected}")]
    NoiseLevelsMismatch { got: usize, expected: usize },
    #[error("vicinity {0} > 0 requires the `vicinity` feature")]
    VicinityNotEnabled(usize),
    #[error("greedy engine requires calibration data")]
    MissingCalibrationData,
    #[error("template bank error: {0}")]
    TemplateBank(#[from] TemplateBankError),
    #[error("calibration error: {0}")]
    Calibration(#[from] CalibrationError),
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum PeelerSolveError {
    #[error("traces have {got} channels, expected {expected}")]
    ChannelMismatch { got: usize, expected: usize },
    #[error("chunk of {num_timesteps} samples is shorter than {required} (margin plus one template)")]
    ChunkTooShort {
        num_timesteps: usize,
        required: usize,
    },
}

/// One fitted spike.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub sample_index: usize,
    pub channel_index: usize,
    pub cluster_index: usize,
    pub amplitude: f32,
    pub segment_index: usize,
}

/// Recording-level inputs supplied by the surrounding pipeline.
#[derive(Debug, Clone)]
pub struct PeelerContext {
    /// Per-channel noise levels of the filtered recording.
    pub noise_levels: Array1<f32>,
    /// Training waveforms and noise snippets; required by the greedy engine,
    /// ignored by OMP.
    pub calibration: Option<CalibrationData>,
}

impl PeelerContext {
    pub fn new(noise_levels: Array1<f32>) -> Self {
        Self {
            noise_levels,
            calibration: None,
        }
    }

    pub fn with_calibration(mut self, calibration: CalibrationData) -> Self {
        self.calibration = Some(calibration);
        self
    }
}

/// Common contract of the two engines: initialize once from the template
/// bank, then decompose chunks. Engines hold no per-chunk state, so one
/// instance may serve chunks from several threads.
pub trait Peeler: Send + Sync {
    type Settings;

    fn name() -> &'static str;

    fn setup(
        bank: &TemplateBank,
        context: &PeelerContext,
        settings: &Self::Settings,
    ) -> Result<Box<Self>, PeelerSetupError>;

    /// Decompose one chunk of `T × C` traces. The chunk must carry
    /// `margin()` samples of context on each side; detections within half a
    /// margin of an edge are the caller's deduplication problem.
    fn peel(
        &self,
        traces: ArrayView2<'_, f32>,
        segment_index: usize,
    ) -> Result<Vec<Detection>, PeelerSolveError>;

    /// Context samples required around each chunk.
    fn margin(&self) -> usize;
}

/// Largest score over entries accepted by `valid`; both solver loops run on
/// this.
pub(crate) fn best_valid_entry<F>(
    scores: &ndarray::Array2<f32>,
    valid: F,
) -> Option<(usize, usize)>
where
    F: Fn(usize, f32) -> bool,
{
    let mut best: Option<(usize, usize, f32)> = None;
    for (n, row) in scores.outer_iter().enumerate() {
        for (p, &value) in row.iter().enumerate() {
            if valid(n, value) && best.map_or(true, |(_, _, b)| value > b) {
                best = Some((n, p, value));
            }
        }
    }
    best.map(|(n, p, _)| (n, p))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn best_valid_entry_respects_the_mask() {
        let scores = array![[1.0_f32, 5.0, 2.0], [4.0, f32::NEG_INFINITY, 3.0]];
        // Unrestricted: the global maximum.
        assert_eq!(best_valid_entry(&scores, |_, v| v > 0.0), Some((0, 1)));
        // Row 0 excluded by the predicate.
        assert_eq!(best_valid_entry(&scores, |n, v| n == 1 && v > 0.0), Some((1, 0)));
        // Nothing valid.
        assert_eq!(best_valid_entry(&scores, |_, v| v > 10.0), None);
    }
}
