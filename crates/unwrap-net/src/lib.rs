//! Deep phase unwrapping with a U-shaped encoder/decoder network.
//!
//! Two modes share one backbone: a one-step regression head that predicts
//! the unwrapped phase directly, and a two-step head that classifies the
//! integer wrap count per pixel before the exact reconstruction
//! `unwrapped = wrapped + 2pi * k`. Training uses masked losses and a
//! guarded AdamW loop; trained parameters persist as versioned blobs keyed
//! by architecture.

pub mod config;
pub mod inference;
pub mod model;
pub mod persist;
pub mod reconstruct;
pub mod training;

pub use config::{load_config, ArchitectureKey, RegressionLoss, SkipFusion, UnwrapConfig, UnwrapMode};
pub use inference::{PhaseUnwrapper, UnwrapOutput};
pub use model::head::{HeadKind, HeadOutput};
pub use model::network::{PhaseUNet, PhaseUNetConfig};
pub use persist::{load_parameters, restore_parameters, save_parameters, serialize_parameters};
pub use training::trainer::{train, TrainingConfig};
