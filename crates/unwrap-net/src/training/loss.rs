//! Masked losses for both heads and the combined training objective.
//!
//! Every loss is a mean over valid pixels only. Masked positions are filled
//! with zero before reduction, so NaN or infinite placeholders at masked
//! pixels never reach the loss or its gradient, and a fully masked batch
//! yields exactly 0.

use burn::prelude::*;
use burn::tensor::activation::log_softmax;
use phase_map::{Result, UnwrapError};

use crate::config::{RegressionLoss, UnwrapConfig, UnwrapMode};
use crate::model::head::HeadOutput;
use crate::reconstruct::soft_reconstruct;
use crate::training::data::PhaseBatch;

/// Mean of `per_pixel` over valid pixels; 0 when nothing is valid.
fn masked_mean<B: Backend>(
    per_pixel: Tensor<B, 3>,
    invalid: Tensor<B, 3, Bool>,
    valid_count: Tensor<B, 1>,
) -> Tensor<B, 1> {
    per_pixel.mask_fill(invalid, 0.0).sum() / valid_count.clamp_min(1.0)
}

/// L1 or MSE between predicted and true unwrapped phase over valid pixels.
///
/// All tensors are `(batch, H, W)`; `valid` holds 1.0/0.0 weights.
pub fn masked_regression_loss<B: Backend>(
    prediction: Tensor<B, 3>,
    target: Tensor<B, 3>,
    valid: Tensor<B, 3>,
    kind: RegressionLoss,
) -> Tensor<B, 1> {
    let invalid = valid.clone().lower_elem(0.5);
    let diff = (prediction - target).mask_fill(invalid.clone(), 0.0);
    let per_pixel = match kind {
        RegressionLoss::L1 => diff.abs(),
        RegressionLoss::Mse => diff.powf_scalar(2.0),
    };
    masked_mean(per_pixel, invalid, valid.sum())
}

/// Per-pixel negative log-likelihood of the true wrap-count class.
///
/// `logits`: `(batch, 2K + 1, H, W)`; `counts`: `(batch, H, W)` in `[-K, K]`.
pub fn wrap_count_loss<B: Backend>(
    logits: Tensor<B, 4>,
    counts: Tensor<B, 3, Int>,
    valid: Tensor<B, 3>,
    max_wrap_count: u32,
) -> Tensor<B, 1> {
    let invalid = valid.clone().lower_elem(0.5);
    let classes = counts
        .add_scalar(max_wrap_count as i64)
        .mask_fill(invalid.clone(), 0)
        .unsqueeze_dim::<4>(1);
    let log_probs = log_softmax(logits, 1);
    let nll = log_probs.gather(1, classes).squeeze::<3>(1).neg();
    masked_mean(nll, invalid, valid.sum())
}

/// Masked L1 between the soft reconstruction and the true unwrapped phase.
pub fn consistency_loss<B: Backend>(
    logits: Tensor<B, 4>,
    wrapped: Tensor<B, 3>,
    target: Tensor<B, 3>,
    valid: Tensor<B, 3>,
    max_wrap_count: u32,
) -> Tensor<B, 1> {
    let soft = soft_reconstruct(logits, wrapped, max_wrap_count);
    masked_regression_loss(soft, target, valid, RegressionLoss::L1)
}

/// Scalar loss plus its individual terms.
#[derive(Debug, Clone)]
pub struct LossTerms<B: Backend> {
    pub total: Tensor<B, 1>,
    pub regression: Option<Tensor<B, 1>>,
    pub classification: Option<Tensor<B, 1>>,
    pub consistency: Option<Tensor<B, 1>>,
}

/// Mode-specific training objective.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Objective {
    pub mode: UnwrapMode,
    pub max_wrap_count: u32,
    pub regression_loss: RegressionLoss,
    pub consistency_weight: f64,
}

impl Objective {
    pub fn from_config(config: &UnwrapConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            mode: config.mode,
            max_wrap_count: config.max_wrap_count.unwrap_or(0),
            regression_loss: config.regression_loss,
            consistency_weight: config.consistency_weight,
        })
    }

    /// Loss of a head output against a collated batch.
    pub fn compute<B: Backend>(&self, output: HeadOutput<B>, batch: &PhaseBatch<B>) -> Result<LossTerms<B>> {
        match (self.mode, output) {
            (UnwrapMode::OneStep, HeadOutput::Regression(prediction)) => {
                let loss = masked_regression_loss(
                    prediction,
                    batch.unwrapped.clone(),
                    batch.valid.clone(),
                    self.regression_loss,
                );
                Ok(LossTerms {
                    total: loss.clone(),
                    regression: Some(loss),
                    classification: None,
                    consistency: None,
                })
            }
            (UnwrapMode::TwoStep, HeadOutput::WrapCount { logits, max_wrap_count }) => {
                if max_wrap_count != self.max_wrap_count {
                    return Err(UnwrapError::shape(
                        "objective",
                        "wrap-count logits",
                        format!("{} classes", 2 * self.max_wrap_count + 1),
                        format!("{} classes", 2 * max_wrap_count + 1),
                    ));
                }
                let counts = batch.wrap_counts.clone().ok_or_else(|| {
                    UnwrapError::config("ground_truth", "two_step batch carries no wrap counts")
                })?;
                let classification =
                    wrap_count_loss(logits.clone(), counts, batch.valid.clone(), max_wrap_count);

                let (total, consistency) = if self.consistency_weight > 0.0 {
                    let consistency = consistency_loss(
                        logits,
                        batch.wrapped.clone(),
                        batch.unwrapped.clone(),
                        batch.valid.clone(),
                        max_wrap_count,
                    );
                    (
                        classification.clone() + consistency.clone().mul_scalar(self.consistency_weight),
                        Some(consistency),
                    )
                } else {
                    (classification.clone(), None)
                };
                Ok(LossTerms {
                    total,
                    regression: None,
                    classification: Some(classification),
                    consistency,
                })
            }
            (mode, other) => Err(UnwrapError::config(
                "mode",
                format!(
                    "{mode} objective cannot score a {} head",
                    match other {
                        HeadOutput::Regression(_) => "regression",
                        HeadOutput::WrapCount { .. } => "wrap-count",
                    }
                ),
            )),
        }
    }
}
