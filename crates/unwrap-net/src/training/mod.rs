//! Training pipeline: batch collation, masked losses, metrics with health
//! checks, and the guarded AdamW training loop.

pub mod data;
pub mod loss;
pub mod metrics;
pub mod trainer;
