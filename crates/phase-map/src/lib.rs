//! Phase map data model for deep phase unwrapping.
//!
//! Typed grids for wrapped input, wrap counts and unwrapped output, the
//! validity mask that travels with them, the exact reconstruction
//! `unwrapped = wrapped + 2pi * k`, and the error taxonomy shared by the
//! network crate.

pub mod dataset;
pub mod error;
pub mod types;
pub mod wrap;

pub use dataset::{InMemoryDataset, PhaseDataset, SyntheticConfig, SyntheticPhaseDataset};
pub use error::{Result, UnwrapError};
pub use types::{
    AuxiliaryChannel, ConfidenceMap, Grid, GridShape, GroundTruth, PhaseInput, TrainingSample,
    UnwrappedPhaseMap, ValidityMask, WrapCountMap, WrappedPhaseMap,
};
pub use wrap::{
    congruence_residual, derive_wrap_counts, is_congruent, reconstruct, snap_to_congruence,
    wrap_phase, CONGRUENCE_TOLERANCE, MAX_WRAP_COUNT, PHASE_TOLERANCE,
};
