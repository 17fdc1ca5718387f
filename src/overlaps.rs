//! Pairwise template cross-correlations at every integer lag.
//!
//! For template `n` the builder produces a sparse matrix `O_n` of shape
//! `N × (2L−1)` with `O_n[m, L−1+δ] = Σ_u Ŵ_n[u]·Ŵ_m[u−δ]` for
//! `δ ∈ [−(L−1), L−1]`, so the zero-lag column is `L−1` and
//! `O_n[m, j] = O_m[n, 2L−2−j]`. The solvers read `O_n` in their hot loop as
//! "how much does committing an atom of cluster `n` at peak `p` disturb the
//! score of cluster `m` at `p + δ`", so each matrix is row-sliced per
//! coupled cluster and kept sparse until the cluster is first selected.

use ndarray::{s, Array2, Array3};
use sprs::{CsMat, TriMat};

/// Compute the per-template overlap matrices from normalized, masked-zeroed
/// templates of shape `(N, L, C)`.
pub fn compute_overlaps(templates: &Array3<f32>) -> Vec<CsMat<f32>> {
    let (num_templates, num_samples, num_channels) = templates.dim();
    let size = 2 * num_samples - 1;

    let mut triplets: Vec<TriMat<f32>> = (0..num_templates)
        .map(|_| TriMat::new((num_templates, size)))
        .collect();

    // One dense N x N product per non-negative shift; the negative shifts are
    // its transpose mirrored through the zero-lag column.
    for shift in 0..num_samples {
        let tail = templates
            .slice(s![.., shift.., ..])
            .to_owned()
            .into_shape((num_templates, (num_samples - shift) * num_channels))
            .expect("sliced templates are contiguous after to_owned");
        let head = templates
            .slice(s![.., ..num_samples - shift, ..])
            .to_owned()
            .into_shape((num_templates, (num_samples - shift) * num_channels))
            .expect("sliced templates are contiguous after to_owned");
        let lagged: Array2<f32> = tail.dot(&head.t());

        let forward = num_samples - 1 + shift;
        let backward = num_samples - 1 - shift;
        for ((n, m), &value) in lagged.indexed_iter() {
            if value != 0.0 {
                triplets[n].add_triplet(m, forward, value);
                if shift > 0 {
                    triplets[m].add_triplet(n, backward, value);
                }
            }
        }
    }

    triplets.iter().map(|t| t.to_csr()).collect()
}

/// Arena of lazily densified overlap rows, local to one solver invocation.
///
/// Sparse storage is right for the long-lived tensor, but the hot residual
/// update slices contiguous column windows, so the first selection of a
/// cluster converts its matrix to dense for the rest of the chunk.
pub struct OverlapCache {
    dense: Vec<Option<Array2<f32>>>,
}

impl OverlapCache {
    pub fn new(num_templates: usize) -> Self {
        Self {
            dense: (0..num_templates).map(|_| None).collect(),
        }
    }

    pub fn get<'a>(&'a mut self, cluster: usize, overlaps: &[CsMat<f32>]) -> &'a Array2<f32> {
        self.dense[cluster].get_or_insert_with(|| overlaps[cluster].to_dense())
    }
}

/// Direct evaluation of `⟨Ŵ_n(u), Ŵ_m(u−δ)⟩`; the builder's counterpart for
/// tests.
#[cfg(test)]
pub(crate) fn overlap_at_lag(
    templates: &Array3<f32>,
    n: usize,
    m: usize,
    lag: isize,
) -> f32 {
    use ndarray::Axis;

    let num_samples = templates.shape()[1] as isize;
    let a = templates.index_axis(Axis(0), n);
    let b = templates.index_axis(Axis(0), m);
    let mut acc = 0.0;
    for u in 0..num_samples {
        let v = u - lag;
        if v >= 0 && v < num_samples {
            for c in 0..templates.shape()[2] {
                acc += a[[u as usize, c]] * b[[v as usize, c]];
            }
        }
    }
    acc
}
