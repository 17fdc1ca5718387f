//! Peak detection seam for the greedy engine.
//!
//! Peak detection proper belongs to the surrounding pipeline; the engine
//! consumes it through [`PeakDetector`]. [`ByChannelDetector`] is the bundled
//! reference implementation: a sample is a peak on a channel when it crosses
//! the per-channel threshold and is the extremum of its lockout window.

use ndarray::{Array1, ArrayView2};
use serde::{Deserialize, Serialize};

/// Polarity of the peaks to detect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeakSign {
    Neg,
    Pos,
    Both,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Peak {
    pub sample_index: usize,
    pub channel_index: usize,
}

pub trait PeakDetector: Send + Sync {
    /// Detect peaks in `traces` (`T × C`). `thresholds` holds one absolute
    /// threshold per channel; `exclude_sweep_size` is the one-sided lockout
    /// in samples. Results are sorted by sample index, then channel.
    fn detect(
        &self,
        traces: ArrayView2<'_, f32>,
        thresholds: &Array1<f32>,
        exclude_sweep_size: usize,
        sign: PeakSign,
    ) -> Vec<Peak>;
}

/// Independent per-channel threshold crossing with a local-extremum lockout.
#[derive(Debug, Default, Clone, Copy)]
pub struct ByChannelDetector;

impl PeakDetector for ByChannelDetector {
    fn detect(
        &self,
        traces: ArrayView2<'_, f32>,
        thresholds: &Array1<f32>,
        exclude_sweep_size: usize,
        sign: PeakSign,
    ) -> Vec<Peak> {
        let num_timesteps = traces.nrows();
        let sweep = exclude_sweep_size.max(1);
        let mut peaks = Vec::new();

        if num_timesteps < 2 * sweep + 1 {
            return peaks;
        }

        let magnitude = |value: f32| -> f32 {
            match sign {
                PeakSign::Neg => -value,
                PeakSign::Pos => value,
                PeakSign::Both => value.abs(),
            }
        };

        for channel in 0..traces.ncols() {
            let threshold = thresholds[channel];
            for sample in sweep..num_timesteps - sweep {
                let value = magnitude(traces[[sample, channel]]);
                if value <= threshold {
                    continue;
                }
                // Ties resolve to the latest sample of a plateau.
                let mut is_extremum = true;
                for offset in 1..=sweep {
                    if value < magnitude(traces[[sample - offset, channel]])
                        || value <= magnitude(traces[[sample + offset, channel]])
                    {
                        is_extremum = false;
                        break;
                    }
                }
                if is_extremum {
                    peaks.push(Peak {
                        sample_index: sample,
                        channel_index: channel,
                    });
                }
            }
        }

        peaks.sort_by_key(|peak| (peak.sample_index, peak.channel_index));
        peaks
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{array, Array2};

    #[test]
    fn detects_negative_extrema_only() {
        let mut traces = Array2::zeros((20, 1));
        traces[[5, 0]] = -1.0;
        traces[[6, 0]] = -3.0;
        traces[[7, 0]] = -1.5;
        traces[[12, 0]] = 2.5; // positive, ignored with Neg
        let thresholds = array![1.0_f32];

        let peaks = ByChannelDetector.detect(traces.view(), &thresholds, 2, PeakSign::Neg);
        assert_eq!(
            peaks,
            vec![Peak {
                sample_index: 6,
                channel_index: 0
            }]
        );
    }

    #[test]
    fn both_polarity_catches_either_sign() {
        let mut traces = Array2::zeros((20, 2));
        traces[[4, 0]] = -2.0;
        traces[[10, 1]] = 2.0;
        let thresholds = array![1.0_f32, 1.0];

        let peaks = ByChannelDetector.detect(traces.view(), &thresholds, 1, PeakSign::Both);
        assert_eq!(peaks.len(), 2);
        assert_eq!(peaks[0].sample_index, 4);
        assert_eq!(peaks[1].channel_index, 1);
    }

    #[test]
    fn lockout_suppresses_the_smaller_neighbour() {
        let mut traces = Array2::zeros((20, 1));
        traces[[8, 0]] = -2.0;
        traces[[9, 0]] = -2.5;
        let thresholds = array![1.0_f32];

        let peaks = ByChannelDetector.detect(traces.view(), &thresholds, 3, PeakSign::Neg);
        assert_eq!(peaks.len(), 1);
        assert_eq!(peaks[0].sample_index, 9);
    }
}
