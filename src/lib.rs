//! Template-matching decomposition of multichannel extracellular recordings.
//!
//! Given a bank of per-unit templates and a chunk of filtered traces, the two
//! peeler engines return a sparse, time-ordered list of spike detections,
//! each tagged with a cluster identity and a fitted amplitude:
//!
//! - [`engines::OmpPeeler`] — Orthogonal Matching Pursuit; greedily selects
//!   template/time atoms and re-solves the joint optimal amplitudes through an
//!   incrementally maintained Cholesky factor of the selected-atom Gram
//!   matrix.
//! - [`engines::GreedyPeeler`] — peak-driven matched filter; accepts one atom
//!   at a time inside per-template amplitude bands learned offline from an
//!   MCC-optimal criterion.
//!
//! Both engines share the sparse overlap tensor ([`overlaps`]) used to update
//! residual scores in place, and the [`engines::Peeler`] contract. The
//! engines are deliberately stateless across chunks: everything they hold is
//! recomputable from the template bank and the settings, and a `peel` call
//! only borrows the engine immutably.

pub mod calibration;
pub mod cholesky;
mod compression;
mod convolution;
pub mod engines;
mod optimize;
pub mod overlaps;
pub mod peaks;
pub mod templates;
pub mod test_utils;

pub use engines::{
    Detection, GreedyPeeler, GreedySettings, GreedySettingsBuilder, OmpPeeler, OmpSettings,
    OmpSettingsBuilder, Peeler, PeelerContext, PeelerSetupError, PeelerSolveError,
};
pub use templates::{SparsityMethod, TemplateBank, TemplateBankError};
