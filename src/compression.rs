//! Low-rank factorization of the template bank.
//!
//! Each `L × C` template is truncated to its top `R` singular triplets so the
//! scoring convolution factors into a spatial projection, a per-rank scaling
//! and `R` one-dimensional temporal convolutions, instead of one dense
//! two-dimensional correlation per template.

use nalgebra::DMatrix;
use ndarray::{Array1, Array2, Array3, Axis};

/// The three factor tensors, laid out rank-major so the scorer iterates one
/// contiguous `(n, rank)` slice at a time.
///
/// The temporal atoms are stored time-reversed (convolution with them equals
/// correlation with the template) and, once [`scale_by_norms`] has run,
/// divided by the template norms so the scores come out normalized.
///
/// [`scale_by_norms`]: LowRankTemplates::scale_by_norms
#[derive(Debug, Clone)]
pub(crate) struct LowRankTemplates {
    /// `(R, N, C)` right singular vectors.
    pub spatial: Array3<f32>,
    /// `(R, N)` singular values.
    pub singular: Array2<f32>,
    /// `(R, N, L)` left singular vectors, time-reversed.
    pub temporal: Array3<f32>,
    pub rank: usize,
}

impl LowRankTemplates {
    pub fn scale_by_norms(&mut self, norms: &Array1<f32>) {
        for n in 0..norms.len() {
            let mut atoms = self.temporal.index_axis_mut(Axis(1), n);
            atoms /= norms[n];
        }
    }
}

/// Factor `templates` (`(N, L, C)`, masked channels zeroed) keeping the top
/// `rank` components. Returns the factors together with the rank-`rank`
/// reconstruction the downstream norms and overlaps must be computed from,
/// so that scores and residual updates agree to truncation error.
pub(crate) fn compress_templates(
    templates: &Array3<f32>,
    rank: usize,
) -> (LowRankTemplates, Array3<f32>) {
    let (num_templates, num_samples, num_channels) = templates.dim();
    debug_assert!(rank >= 1 && rank <= num_samples.min(num_channels));

    let mut spatial = Array3::zeros((rank, num_templates, num_channels));
    let mut singular = Array2::zeros((rank, num_templates));
    let mut temporal = Array3::zeros((rank, num_templates, num_samples));
    let mut approximated = Array3::zeros((num_templates, num_samples, num_channels));

    for (n, template) in templates.outer_iter().enumerate() {
        let matrix = DMatrix::from_row_iterator(num_samples, num_channels, template.iter().cloned());
        let svd = matrix.svd(true, true);
        let u = svd.u.expect("svd requested u");
        let v_t = svd.v_t.expect("svd requested v_t");
        let values = svd.singular_values;

        for r in 0..rank {
            singular[[r, n]] = values[r];
            for c in 0..num_channels {
                spatial[[r, n, c]] = v_t[(r, c)];
            }
            for t in 0..num_samples {
                temporal[[r, n, t]] = u[(num_samples - 1 - t, r)];
            }
        }

        for t in 0..num_samples {
            for c in 0..num_channels {
                let mut acc = 0.0;
                for r in 0..rank {
                    acc += u[(t, r)] * values[r] * v_t[(r, c)];
                }
                approximated[[n, t, c]] = acc;
            }
        }
    }

    (
        LowRankTemplates {
            spatial,
            singular,
            temporal,
            rank,
        },
        approximated,
    )
}
