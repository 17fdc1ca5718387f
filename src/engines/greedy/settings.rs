use crate::peaks::PeakSign;
use crate::templates::SparsityMethod;
use serde::{Deserialize, Serialize};

/// Settings for the greedy peeler.
///
/// Create new settings using [`GreedySettingsBuilder`] or use the default
/// implementation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GreedySettings {
    peak_sign: PeakSign,
    exclude_sweep_ms: f32,
    jitter_ms: f32,
    detect_threshold: f32,
    min_amplitude: f32,
    max_amplitude: f32,
    use_sparse_matrix_threshold: f32,
    sparse_method: SparsityMethod,
    calibration_seed: u64,
}

// Default implementation is a convenience that defers to the builder.
impl Default for GreedySettings {
    fn default() -> Self {
        GreedySettingsBuilder::default().build()
    }
}

impl GreedySettings {
    /// Create a new builder for the settings
    pub fn builder() -> GreedySettingsBuilder {
        GreedySettingsBuilder::default()
    }

    pub fn peak_sign(&self) -> PeakSign {
        self.peak_sign
    }

    /// Peak-detector lockout window, in milliseconds.
    pub fn exclude_sweep_ms(&self) -> f32 {
        self.exclude_sweep_ms
    }

    /// Half-width of the jitter expansion around each peak, in milliseconds.
    pub fn jitter_ms(&self) -> f32 {
        self.jitter_ms
    }

    /// Peak-detector threshold, in noise multiples.
    pub fn detect_threshold(&self) -> f32 {
        self.detect_threshold
    }

    /// Global lower bracket of the calibrated acceptance bands.
    pub fn min_amplitude(&self) -> f32 {
        self.min_amplitude
    }

    /// Global upper bracket of the calibrated acceptance bands.
    pub fn max_amplitude(&self) -> f32 {
        self.max_amplitude
    }

    /// Store the flattened template matrix sparsely when its density is at or
    /// below this fraction.
    pub fn use_sparse_matrix_threshold(&self) -> f32 {
        self.use_sparse_matrix_threshold
    }

    pub fn sparse_method(&self) -> SparsityMethod {
        self.sparse_method
    }

    /// Seed of the calibration optimizer.
    pub fn calibration_seed(&self) -> u64 {
        self.calibration_seed
    }
}

/// Builder for [`GreedySettings`].
///
/// # Examples
///
/// ```
/// use peeler::GreedySettingsBuilder;
/// use peeler::peaks::PeakSign;
/// let settings = GreedySettingsBuilder::default()
///     .peak_sign(PeakSign::Both)
///     .detect_threshold(4.0)
///     .build();
/// ```
pub struct GreedySettingsBuilder {
    peak_sign: PeakSign,
    exclude_sweep_ms: f32,
    jitter_ms: f32,
    detect_threshold: f32,
    min_amplitude: f32,
    max_amplitude: f32,
    use_sparse_matrix_threshold: f32,
    sparse_method: SparsityMethod,
    calibration_seed: u64,
}

impl Default for GreedySettingsBuilder {
    fn default() -> Self {
        Self {
            peak_sign: PeakSign::Neg,
            exclude_sweep_ms: 0.1,
            jitter_ms: 0.1,
            detect_threshold: 5.0,
            min_amplitude: 0.5,
            max_amplitude: 1.5,
            use_sparse_matrix_threshold: 0.25,
            sparse_method: SparsityMethod::Ptp { threshold: 1.0 },
            calibration_seed: 42,
        }
    }
}

impl GreedySettingsBuilder {
    pub fn peak_sign(mut self, peak_sign: PeakSign) -> Self {
        self.peak_sign = peak_sign;
        self
    }

    pub fn exclude_sweep_ms(mut self, exclude_sweep_ms: f32) -> Self {
        self.exclude_sweep_ms = exclude_sweep_ms;
        self
    }

    pub fn jitter_ms(mut self, jitter_ms: f32) -> Self {
        self.jitter_ms = jitter_ms;
        self
    }

    pub fn detect_threshold(mut self, detect_threshold: f32) -> Self {
        self.detect_threshold = detect_threshold;
        self
    }

    pub fn amplitude_bracket(mut self, min_amplitude: f32, max_amplitude: f32) -> Self {
        self.min_amplitude = min_amplitude;
        self.max_amplitude = max_amplitude;
        self
    }

    pub fn use_sparse_matrix_threshold(mut self, threshold: f32) -> Self {
        self.use_sparse_matrix_threshold = threshold;
        self
    }

    pub fn sparse_method(mut self, sparse_method: SparsityMethod) -> Self {
        self.sparse_method = sparse_method;
        self
    }

    pub fn calibration_seed(mut self, seed: u64) -> Self {
        self.calibration_seed = seed;
        self
    }

    /// Construct a [`GreedySettings`] from the builder.
    pub fn build(self) -> GreedySettings {
        GreedySettings {
            peak_sign: self.peak_sign,
            exclude_sweep_ms: self.exclude_sweep_ms,
            jitter_ms: self.jitter_ms,
            detect_threshold: self.detect_threshold,
            min_amplitude: self.min_amplitude,
            max_amplitude: self.max_amplitude,
            use_sparse_matrix_threshold: self.use_sparse_matrix_threshold,
            sparse_method: self.sparse_method,
            calibration_seed: self.calibration_seed,
        }
    }
}
