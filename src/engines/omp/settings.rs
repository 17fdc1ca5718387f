use crate::templates::SparsityMethod;
use serde::{Deserialize, Serialize};

/// Settings for the OMP peeler.
///
/// Create new settings using [`OmpSettingsBuilder`] or use the default
/// implementation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OmpSettings {
    amplitudes: (f32, f32),
    omp_min_sps: f32,
    rank: usize,
    sparse_method: SparsityMethod,
    ignored_ids: Vec<usize>,
    vicinity: usize,
}

// Default implementation is a convenience that defers to the builder.
impl Default for OmpSettings {
    fn default() -> Self {
        OmpSettingsBuilder::default().build()
    }
}

impl OmpSettings {
    /// Create a new builder for the settings
    pub fn builder() -> OmpSettingsBuilder {
        OmpSettingsBuilder::default()
    }

    /// Post-fit acceptance band `(a_min, a_max)` in normalized units.
    pub fn amplitudes(&self) -> (f32, f32) {
        self.amplitudes
    }

    /// Stopping fraction of the per-template norm.
    pub fn omp_min_sps(&self) -> f32 {
        self.omp_min_sps
    }

    /// SVD truncation rank.
    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn sparse_method(&self) -> SparsityMethod {
        self.sparse_method
    }

    /// Template indices excluded from selection.
    pub fn ignored_ids(&self) -> &[usize] {
        &self.ignored_ids
    }

    /// Radius (samples) bounding the atoms jointly updated in a Cholesky
    /// step; 0 keeps the full joint update.
    pub fn vicinity(&self) -> usize {
        self.vicinity
    }
}

/// Builder for [`OmpSettings`].
///
/// # Examples
///
/// ```
/// use peeler::OmpSettingsBuilder;
/// let settings = OmpSettingsBuilder::default()
///     .amplitudes(0.5, 2.0)
///     .omp_min_sps(0.25)
///     .rank(4)
///     .build();
/// ```
pub struct OmpSettingsBuilder {
    amplitudes: (f32, f32),
    omp_min_sps: f32,
    rank: usize,
    sparse_method: SparsityMethod,
    ignored_ids: Vec<usize>,
    vicinity: usize,
}

impl Default for OmpSettingsBuilder {
    fn default() -> Self {
        Self {
            amplitudes: (0.6, 2.0),
            omp_min_sps: 0.1,
            rank: 5,
            sparse_method: SparsityMethod::Ptp { threshold: 1.0 },
            ignored_ids: Vec::new(),
            vicinity: 0,
        }
    }
}

impl OmpSettingsBuilder {
    pub fn amplitudes(mut self, min: f32, max: f32) -> Self {
        self.amplitudes = (min, max);
        self
    }

    pub fn omp_min_sps(mut self, omp_min_sps: f32) -> Self {
        self.omp_min_sps = omp_min_sps;
        self
    }

    pub fn rank(mut self, rank: usize) -> Self {
        self.rank = rank;
        self
    }

    pub fn sparse_method(mut self, sparse_method: SparsityMethod) -> Self {
        self.sparse_method = sparse_method;
        self
    }

    pub fn ignored_ids(mut self, ignored_ids: Vec<usize>) -> Self {
        self.ignored_ids = ignored_ids;
        self
    }

    pub fn vicinity(mut self, vicinity: usize) -> Self {
        self.vicinity = vicinity;
        self
    }

    /// Construct an [`OmpSettings`] from the builder.
    pub fn build(self) -> OmpSettings {
        OmpSettings {
            amplitudes: self.amplitudes,
            omp_min_sps: self.omp_min_sps,
            rank: self.rank,
            sparse_method: self.sparse_method,
            ignored_ids: self.ignored_ids,
            vicinity: self.vicinity,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{OmpSettings, OmpSettingsBuilder};

    #[test]
    fn builder_test() {
        let settings = OmpSettingsBuilder::default().omp_min_sps(0.3).rank(2).build();
        assert_eq!(settings.omp_min_sps(), 0.3);
        assert_eq!(settings.rank(), 2);
        assert_eq!(settings.amplitudes(), OmpSettings::default().amplitudes());
    }
}
