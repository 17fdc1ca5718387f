//! The template bank and its derived per-template quantities.
//!
//! A [`TemplateBank`] owns the dense per-unit waveforms together with the
//! peak alignment (`nbefore`/`nafter`) and the sampling frequency. Channel
//! masks may be supplied by the caller or inferred from the waveforms and the
//! per-channel noise levels at engine setup.

use ndarray::{Array1, Array2, Array3, ArrayView2, Axis};
use serde::{Deserialize, Serialize};
use sprs::CsMat;
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum TemplateBankError {
    #[error("template bank is empty")]
    EmptyBank,
    #[error("template length {num_samples} does not equal nbefore {nbefore} + nafter {nafter}")]
    PeakWindowMismatch {
        num_samples: usize,
        nbefore: usize,
        nafter: usize,
    },
    #[error("sampling frequency must be positive, got {0}")]
    InvalidSamplingFrequency(String),
    #[error("channel mask for template {index} references channel {channel} but the bank has {num_channels} channels")]
    MaskChannelOutOfRange {
        index: usize,
        channel: usize,
        num_channels: usize,
    },
    #[error("expected {expected} channel masks, got {got}")]
    WrongNumberOfMasks { expected: usize, got: usize },
    #[error("template {index} has zero norm on its channel mask")]
    DegenerateTemplate { index: usize },
}

/// Method used to infer a per-template channel mask from the waveforms.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum SparsityMethod {
    /// Keep channels whose peak-to-peak amplitude exceeds `threshold` noise
    /// multiples.
    Ptp { threshold: f32 },
    /// Keep channels whose peak absolute amplitude exceeds `threshold` noise
    /// multiples.
    Snr { threshold: f32 },
}

impl SparsityMethod {
    /// Compute the channel masks for every template in `templates` (shape
    /// `(N, L, C)`) against the per-channel noise levels.
    pub fn infer(&self, templates: &Array3<f32>, noise_levels: &Array1<f32>) -> Vec<Vec<usize>> {
        let num_channels = templates.shape()[2];
        templates
            .outer_iter()
            .map(|template| {
                (0..num_channels)
                    .filter(|&channel| {
                        let column = template.index_axis(Axis(1), channel);
                        let stat = match self {
                            SparsityMethod::Ptp { .. } => {
                                let (mut lo, mut hi) = (f32::INFINITY, f32::NEG_INFINITY);
                                for &v in column.iter() {
                                    lo = lo.min(v);
                                    hi = hi.max(v);
                                }
                                hi - lo
                            }
                            SparsityMethod::Snr { .. } => {
                                column.iter().fold(0.0_f32, |acc, &v| acc.max(v.abs()))
                            }
                        };
                        let threshold = match self {
                            SparsityMethod::Ptp { threshold } | SparsityMethod::Snr { threshold } => *threshold,
                        };
                        stat > threshold * noise_levels[channel]
                    })
                    .collect()
            })
            .collect()
    }
}

/// A bank of `N` per-unit templates of `L = nbefore + nafter` samples on `C`
/// channels, aligned so that the waveform peak sits at sample `nbefore`.
#[derive(Debug, Clone)]
pub struct TemplateBank {
    templates: Array3<f32>,
    masks: Option<Vec<Vec<usize>>>,
    nbefore: usize,
    nafter: usize,
    sampling_frequency: f32,
}

impl TemplateBank {
    /// Create a bank without channel masks; the engines infer them at setup
    /// using their `sparse_method` setting.
    pub fn new(
        templates: Array3<f32>,
        nbefore: usize,
        nafter: usize,
        sampling_frequency: f32,
    ) -> Result<Self, TemplateBankError> {
        let (num_templates, num_samples, num_channels) = templates.dim();
        if num_templates == 0 || num_samples == 0 || num_channels == 0 {
            return Err(TemplateBankError::EmptyBank);
        }
        if num_samples != nbefore + nafter {
            return Err(TemplateBankError::PeakWindowMismatch {
                num_samples,
                nbefore,
                nafter,
            });
        }
        if !(sampling_frequency > 0.0) {
            return Err(TemplateBankError::InvalidSamplingFrequency(
                sampling_frequency.to_string(),
            ));
        }
        Ok(Self {
            templates,
            masks: None,
            nbefore,
            nafter,
            sampling_frequency,
        })
    }

    /// Attach caller-supplied channel masks (one sorted channel list per
    /// template), bypassing sparsity inference.
    pub fn with_masks(mut self, masks: Vec<Vec<usize>>) -> Result<Self, TemplateBankError> {
        if masks.len() != self.num_templates() {
            return Err(TemplateBankError::WrongNumberOfMasks {
                expected: self.num_templates(),
                got: masks.len(),
            });
        }
        for (index, mask) in masks.iter().enumerate() {
            if let Some(&channel) = mask.iter().find(|&&c| c >= self.num_channels()) {
                return Err(TemplateBankError::MaskChannelOutOfRange {
                    index,
                    channel,
                    num_channels: self.num_channels(),
                });
            }
        }
        self.masks = Some(masks);
        Ok(self)
    }

    pub fn num_templates(&self) -> usize {
        self.templates.shape()[0]
    }

    pub fn num_samples(&self) -> usize {
        self.templates.shape()[1]
    }

    pub fn num_channels(&self) -> usize {
        self.templates.shape()[2]
    }

    pub fn nbefore(&self) -> usize {
        self.nbefore
    }

    pub fn nafter(&self) -> usize {
        self.nafter
    }

    pub fn sampling_frequency(&self) -> f32 {
        self.sampling_frequency
    }

    pub fn templates(&self) -> &Array3<f32> {
        &self.templates
    }

    pub fn masks(&self) -> Option<&[Vec<usize>]> {
        self.masks.as_deref()
    }

    /// Resolve the channel masks: the caller-supplied ones if present,
    /// otherwise inferred with `method` against the noise levels.
    pub(crate) fn resolve_masks(
        &self,
        method: &SparsityMethod,
        noise_levels: &Array1<f32>,
    ) -> Vec<Vec<usize>> {
        match &self.masks {
            Some(masks) => masks.clone(),
            None => method.infer(&self.templates, noise_levels),
        }
    }
}

/// Masked, norm-annotated templates shared by both engines.
#[derive(Debug, Clone)]
pub(crate) struct PreparedTemplates {
    /// Raw waveforms with masked channels zeroed, `(N, L, C)`.
    pub dense: Array3<f32>,
    /// `dense` divided per template by its norm.
    pub normalized: Array3<f32>,
    pub norms: Array1<f32>,
    pub masks: Vec<Vec<usize>>,
}

/// Zero every channel outside each template's mask.
pub(crate) fn zero_masked_channels(templates: &mut Array3<f32>, masks: &[Vec<usize>]) {
    for (index, mask) in masks.iter().enumerate() {
        let mut template = templates.index_axis_mut(Axis(0), index);
        for channel in 0..template.shape()[1] {
            if !mask.contains(&channel) {
                template.index_axis_mut(Axis(1), channel).fill(0.0);
            }
        }
    }
}

/// Zero masked channels and compute per-template norms. A template whose
/// masked waveform has zero norm is degenerate and fatal.
pub(crate) fn prepare_templates(
    bank: &TemplateBank,
    masks: Vec<Vec<usize>>,
) -> Result<PreparedTemplates, TemplateBankError> {
    let mut dense = bank.templates().clone();
    zero_masked_channels(&mut dense, &masks);

    let norms = Array1::from_iter(
        dense
            .outer_iter()
            .map(|template| template.iter().map(|v| v * v).sum::<f32>().sqrt()),
    );
    if let Some(index) = norms.iter().position(|&n| !(n > 0.0)) {
        return Err(TemplateBankError::DegenerateTemplate { index });
    }

    let mut normalized = dense.clone();
    for (index, mut template) in normalized.outer_iter_mut().enumerate() {
        template /= norms[index];
    }

    Ok(PreparedTemplates {
        dense,
        normalized,
        norms,
        masks,
    })
}

/// The flattened `N × (L·C)` template matrix, stored sparsely when its
/// density falls at or below the configured threshold.
#[derive(Debug, Clone)]
pub(crate) enum TemplateMatrix {
    Dense(Array2<f32>),
    Sparse(CsMat<f32>),
}

impl TemplateMatrix {
    /// Flatten `(N, L, C)` templates row-major and pick the storage by
    /// density.
    pub fn from_templates(templates: &Array3<f32>, sparse_threshold: f32) -> Self {
        let (num_templates, num_samples, num_channels) = templates.dim();
        let flat_len = num_samples * num_channels;
        let mut flat = Array2::zeros((num_templates, flat_len));
        for (n, template) in templates.outer_iter().enumerate() {
            for (j, &v) in template.iter().enumerate() {
                flat[[n, j]] = v;
            }
        }

        let nnz = flat.iter().filter(|&&v| v != 0.0).count();
        let density = nnz as f32 / (num_templates * flat_len) as f32;
        if density <= sparse_threshold {
            let mut triplets = sprs::TriMat::new((num_templates, flat_len));
            for ((n, j), &v) in flat.indexed_iter() {
                if v != 0.0 {
                    triplets.add_triplet(n, j, v);
                }
            }
            let csr: CsMat<f32> = triplets.to_csr();
            TemplateMatrix::Sparse(csr)
        } else {
            TemplateMatrix::Dense(flat)
        }
    }

    pub fn density(&self) -> f32 {
        match self {
            TemplateMatrix::Dense(m) => {
                m.iter().filter(|&&v| v != 0.0).count() as f32 / m.len() as f32
            }
            TemplateMatrix::Sparse(m) => m.nnz() as f32 / (m.rows() * m.cols()) as f32,
        }
    }

    pub fn is_dense(&self) -> bool {
        matches!(self, TemplateMatrix::Dense(_))
    }

    /// `self · rhs`, with `rhs` of shape `(L·C, K)`.
    pub fn dot(&self, rhs: &ArrayView2<'_, f32>) -> Array2<f32> {
        match self {
            TemplateMatrix::Dense(m) => m.dot(rhs),
            TemplateMatrix::Sparse(m) => {
                let mut out = Array2::zeros((m.rows(), rhs.ncols()));
                for (n, row) in m.outer_iterator().enumerate() {
                    let mut out_row = out.row_mut(n);
                    for (j, &v) in row.iter() {
                        out_row.scaled_add(v, &rhs.row(j));
                    }
                }
                out
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use float_cmp::approx_eq;
    use ndarray::array;

    fn small_bank() -> TemplateBank {
        // Two templates, 4 samples, 3 channels; template 1 lives on channel 2
        // only.
        let mut templates = Array3::zeros((2, 4, 3));
        templates[[0, 1, 0]] = 1.0;
        templates[[0, 2, 0]] = -2.0;
        templates[[0, 1, 1]] = 0.5;
        templates[[1, 1, 2]] = -3.0;
        TemplateBank::new(templates, 2, 2, 10_000.0).unwrap()
    }

    #[test]
    fn bank_shape_validation() {
        let err = TemplateBank::new(Array3::zeros((0, 4, 3)), 2, 2, 10_000.0).unwrap_err();
        assert_eq!(err, TemplateBankError::EmptyBank);

        let err = TemplateBank::new(Array3::zeros((1, 4, 3)), 3, 2, 10_000.0).unwrap_err();
        assert!(matches!(err, TemplateBankError::PeakWindowMismatch { .. }));
    }

    #[test]
    fn ptp_sparsity_masks_quiet_channels() {
        let bank = small_bank();
        let noise = array![0.1_f32, 0.1, 0.1];
        let masks = SparsityMethod::Ptp { threshold: 1.0 }.infer(bank.templates(), &noise);
        assert_eq!(masks[0], vec![0, 1]);
        assert_eq!(masks[1], vec![2]);
    }

    #[test]
    fn prepare_zeroes_masked_channels_and_normalizes() {
        let bank = small_bank();
        let prepared = prepare_templates(&bank, vec![vec![0], vec![2]]).unwrap();
        // Channel 1 of template 0 was masked away.
        assert_eq!(prepared.dense[[0, 1, 1]], 0.0);
        let norm = (1.0_f32 + 4.0).sqrt();
        assert!(approx_eq!(f32, prepared.norms[0], norm, ulps = 2));
        let renorm: f32 = prepared
            .normalized
            .index_axis(Axis(0), 0)
            .iter()
            .map(|v| v * v)
            .sum();
        assert!(approx_eq!(f32, renorm.sqrt(), 1.0, epsilon = 1e-6));
    }

    #[test]
    fn degenerate_template_is_fatal() {
        let bank = small_bank();
        // Masking template 0 to a silent channel leaves it with zero norm.
        let err = prepare_templates(&bank, vec![vec![2], vec![2]]).unwrap_err();
        assert_eq!(err, TemplateBankError::DegenerateTemplate { index: 0 });
    }

    #[test]
    fn sparse_and_dense_template_matrices_agree() {
        let bank = small_bank();
        let prepared = prepare_templates(&bank, vec![vec![0, 1], vec![2]]).unwrap();
        let sparse = TemplateMatrix::from_templates(&prepared.normalized, 1.0);
        let dense = TemplateMatrix::from_templates(&prepared.normalized, 0.0);
        assert!(!sparse.is_dense());
        assert!(dense.is_dense());

        let rhs = Array2::from_shape_fn((12, 5), |(j, k)| (j * 5 + k) as f32 * 0.1 - 2.0);
        let a = sparse.dot(&rhs.view());
        let b = dense.dot(&rhs.view());
        for (x, y) in a.iter().zip(b.iter()) {
            assert!(approx_eq!(f32, *x, *y, epsilon = 1e-5));
        }
    }
}
