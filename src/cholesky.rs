//! Incrementally grown Cholesky factor of the selected-atom Gram matrix.
//!
//! The OMP solver appends one atom per iteration. Appending a row costs one
//! forward substitution against the existing factor; re-solving all
//! amplitudes costs the two triangular solves of a `potrs`. The factor is
//! stored as a row-major square with the upper triangle unused, and grows by
//! capacity doubling.

use ndarray::Array2;

pub struct GrowingCholesky {
    data: Vec<f32>,
    capacity: usize,
    len: usize,
}

impl GrowingCholesky {
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            data: vec![0.0; capacity * capacity],
            capacity,
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    fn at(&self, row: usize, col: usize) -> f32 {
        self.data[row * self.capacity + col]
    }

    #[inline]
    fn set(&mut self, row: usize, col: usize, value: f32) {
        self.data[row * self.capacity + col] = value;
    }

    fn grow(&mut self) {
        let new_capacity = self.capacity * 2;
        let mut data = vec![0.0; new_capacity * new_capacity];
        for row in 0..self.len {
            let src = row * self.capacity;
            let dst = row * new_capacity;
            data[dst..dst + self.len].copy_from_slice(&self.data[src..src + self.len]);
        }
        self.data = data;
        self.capacity = new_capacity;
    }

    /// Append the atom whose Gram row against the already selected atoms is
    /// `gram` (length `len()`; the diagonal entry is 1 for normalized atoms).
    ///
    /// Returns `false` when the new atom is linearly dependent on the current
    /// selection (`1 − ‖x‖² ≤ ε`); the factor is left unchanged and the
    /// caller should terminate.
    pub fn push_row(&mut self, gram: &[f32]) -> bool {
        debug_assert_eq!(gram.len(), self.len);
        if self.len == self.capacity {
            self.grow();
        }
        let k = self.len;
        for (i, &value) in gram.iter().enumerate() {
            self.set(k, i, value);
        }

        // Forward substitution: L[0..k, 0..k] x = gram, written into row k.
        for i in 0..k {
            let mut value = self.at(k, i);
            for j in 0..i {
                value -= self.at(i, j) * self.at(k, j);
            }
            self.set(k, i, value / self.at(i, i));
        }

        let norm_sq: f32 = (0..k).map(|j| self.at(k, j).powi(2)).sum();
        let pivot = 1.0 - norm_sq;
        if pivot <= f32::EPSILON {
            return false;
        }
        self.set(k, k, pivot.sqrt());
        self.len += 1;
        true
    }

    /// Append an atom solving only against the atoms listed in `active`
    /// (sorted indices into the current selection); the remaining entries of
    /// the new row are kept as raw Gram values of zero. With an empty
    /// `active` set the new diagonal entry is 1.
    #[cfg(feature = "vicinity")]
    pub fn push_row_restricted(&mut self, gram: &[f32], active: &[usize]) -> bool {
        debug_assert_eq!(gram.len(), self.len);
        if self.len == self.capacity {
            self.grow();
        }
        let k = self.len;
        for (i, &value) in gram.iter().enumerate() {
            self.set(k, i, value);
        }

        if active.is_empty() {
            self.set(k, k, 1.0);
            self.len += 1;
            return true;
        }

        for (position, &i) in active.iter().enumerate() {
            let mut value = self.at(k, i);
            for &j in &active[..position] {
                value -= self.at(i, j) * self.at(k, j);
            }
            self.set(k, i, value / self.at(i, i));
        }

        let norm_sq: f32 = active.iter().map(|&j| self.at(k, j).powi(2)).sum();
        let pivot = 1.0 - norm_sq;
        if pivot <= f32::EPSILON {
            return false;
        }
        self.set(k, k, pivot.sqrt());
        self.len += 1;
        true
    }

    /// Solve `(L Lᵀ) x = b` in place — the `potrs` of the amplitude re-fit.
    pub fn solve(&self, b: &mut [f32]) {
        let k = self.len;
        debug_assert_eq!(b.len(), k);
        for i in 0..k {
            let mut value = b[i];
            for j in 0..i {
                value -= self.at(i, j) * b[j];
            }
            b[i] = value / self.at(i, i);
        }
        for i in (0..k).rev() {
            let mut value = b[i];
            for j in i + 1..k {
                value -= self.at(j, i) * b[j];
            }
            b[i] = value / self.at(i, i);
        }
    }

    /// Reconstruct `L Lᵀ` over the current selection.
    pub fn gram(&self) -> Array2<f32> {
        let k = self.len;
        Array2::from_shape_fn((k, k), |(i, j)| {
            (0..=i.min(j)).map(|m| self.at(i, m) * self.at(j, m)).sum()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use float_cmp::approx_eq;

    // Gram matrix of three unit atoms with known pairwise overlaps.
    const G01: f32 = 0.6;
    const G02: f32 = -0.2;
    const G12: f32 = 0.3;

    fn build() -> GrowingCholesky {
        let mut chol = GrowingCholesky::with_capacity(2);
        assert!(chol.push_row(&[]));
        assert!(chol.push_row(&[G01]));
        assert!(chol.push_row(&[G02, G12]));
        chol
    }

    #[test]
    fn factor_reproduces_gram() {
        let chol = build();
        assert_eq!(chol.len(), 3);
        let gram = chol.gram();
        let expected = [
            [1.0, G01, G02],
            [G01, 1.0, G12],
            [G02, G12, 1.0],
        ];
        for i in 0..3 {
            for j in 0..3 {
                assert!(
                    approx_eq!(f32, gram[[i, j]], expected[i][j], epsilon = 1e-4),
                    "G[{i},{j}] = {} vs {}",
                    gram[[i, j]],
                    expected[i][j],
                );
            }
        }
    }

    #[test]
    fn growth_preserves_the_factor() {
        // Capacity 2 doubles on the third push; the reconstruction above
        // already exercises it, this checks the solve after growth.
        let chol = build();
        let mut b = [0.5_f32, -0.25, 1.0];
        let rhs = b;
        chol.solve(&mut b);

        // Multiply back: G x should equal the original rhs.
        let gram = chol.gram();
        for i in 0..3 {
            let recovered: f32 = (0..3).map(|j| gram[[i, j]] * b[j]).sum();
            assert!(approx_eq!(f32, recovered, rhs[i], epsilon = 1e-4));
        }
    }

    #[test]
    fn duplicate_atom_is_linearly_dependent() {
        let mut chol = GrowingCholesky::with_capacity(4);
        assert!(chol.push_row(&[]));
        assert!(chol.push_row(&[0.4]));
        // A copy of the first atom: unit self-overlap, same cross terms.
        assert!(!chol.push_row(&[1.0, 0.4]));
        assert_eq!(chol.len(), 2);
    }

    #[test]
    fn single_atom_solve_is_identity() {
        let mut chol = GrowingCholesky::with_capacity(1);
        assert!(chol.push_row(&[]));
        let mut b = [0.75_f32];
        chol.solve(&mut b);
        assert!(approx_eq!(f32, b[0], 0.75, ulps = 2));
    }
}
