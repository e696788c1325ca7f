//! Unwrapping metrics, health checks and a step-indexed history.

use std::f64::consts::PI;

use burn::prelude::*;

use crate::model::head::HeadOutput;
use crate::reconstruct::{decode_wrap_counts, reconstruct_tensor};
use crate::training::data::PhaseBatch;
use crate::training::loss::LossTerms;

/// Metrics of one training or validation step.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UnwrapMetrics {
    /// Total objective.
    pub loss: f64,
    pub regression_loss: Option<f64>,
    pub classification_loss: Option<f64>,
    pub consistency_loss: Option<f64>,
    /// Mean |predicted - true| unwrapped phase over valid pixels, in radians.
    pub mean_abs_error: f64,
    /// Fraction of valid pixels whose wrap count is exactly right (two-step).
    pub wrap_count_accuracy: Option<f64>,
    /// Fraction of pixels that are valid.
    pub valid_fraction: f64,
    /// Global L2 norm of the parameter gradient, when measured.
    pub grad_norm: Option<f64>,
}

fn scalar<B: Backend>(t: Tensor<B, 1>) -> f64 {
    let v: f32 = t.into_scalar().elem();
    v as f64
}

impl UnwrapMetrics {
    /// Compute metrics from a head output, its batch and the loss terms.
    ///
    /// Two-step outputs are reconstructed exactly from the argmax counts
    /// before the phase error is measured.
    pub fn compute<B: Backend>(output: &HeadOutput<B>, batch: &PhaseBatch<B>, terms: &LossTerms<B>) -> Self {
        let valid_count = scalar(batch.valid_count());
        let total_pixels = batch.valid.dims().iter().product::<usize>().max(1) as f64;
        let denom = valid_count.max(1.0);
        let invalid = batch.invalid();

        let (prediction, wrap_count_accuracy) = match output {
            HeadOutput::Regression(pred) => (pred.clone(), None),
            HeadOutput::WrapCount { logits, max_wrap_count } => {
                let (counts, _) = decode_wrap_counts(logits.clone(), *max_wrap_count);
                let unwrapped = reconstruct_tensor(
                    batch.wrapped.clone(),
                    counts.clone(),
                    invalid.clone().bool_not(),
                );
                let accuracy = batch.wrap_counts.clone().map(|truth| {
                    let hits = counts.equal(truth).float() * batch.valid.clone();
                    scalar(hits.sum()) / denom
                });
                (unwrapped, accuracy)
            }
        };

        let abs_err = (prediction - batch.unwrapped.clone()).abs().mask_fill(invalid, 0.0);
        Self {
            loss: scalar(terms.total.clone()),
            regression_loss: terms.regression.clone().map(scalar),
            classification_loss: terms.classification.clone().map(scalar),
            consistency_loss: terms.consistency.clone().map(scalar),
            mean_abs_error: scalar(abs_err.sum()) / denom,
            wrap_count_accuracy,
            valid_fraction: valid_count / total_pixels,
            grad_norm: None,
        }
    }

    pub fn with_grad_norm(mut self, grad_norm: f64) -> Self {
        self.grad_norm = Some(grad_norm);
        self
    }

    /// Warnings for suspicious metric values.
    pub fn health_check(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        if !self.loss.is_finite() {
            warnings.push(format!("loss is not finite ({})", self.loss));
        }
        if self.valid_fraction == 0.0 {
            warnings.push("batch has no valid pixels".to_string());
        }
        if self.mean_abs_error > PI {
            warnings.push(format!(
                "mean abs error {:.3} rad exceeds pi: wraps are not being resolved",
                self.mean_abs_error
            ));
        }
        if let Some(acc) = self.wrap_count_accuracy {
            if acc < 0.5 {
                warnings.push(format!("wrap-count accuracy {acc:.3} below 0.5"));
            }
        }
        if let Some(norm) = self.grad_norm {
            if norm == 0.0 {
                warnings.push("gradient norm is zero: no learning signal".to_string());
            } else if norm > 1e3 {
                warnings.push(format!("gradient norm {norm:.1} is very large"));
            }
        }
        warnings
    }

    /// Element-wise mean of a set of metrics; `None` for an empty set.
    pub fn mean(metrics: &[UnwrapMetrics]) -> Option<UnwrapMetrics> {
        if metrics.is_empty() {
            return None;
        }
        let n = metrics.len() as f64;
        let avg = |f: &dyn Fn(&UnwrapMetrics) -> f64| metrics.iter().map(f).sum::<f64>() / n;
        let avg_opt = |f: &dyn Fn(&UnwrapMetrics) -> Option<f64>| {
            let vals: Vec<f64> = metrics.iter().filter_map(f).collect();
            (!vals.is_empty()).then(|| vals.iter().sum::<f64>() / vals.len() as f64)
        };
        Some(UnwrapMetrics {
            loss: avg(&|m| m.loss),
            regression_loss: avg_opt(&|m| m.regression_loss),
            classification_loss: avg_opt(&|m| m.classification_loss),
            consistency_loss: avg_opt(&|m| m.consistency_loss),
            mean_abs_error: avg(&|m| m.mean_abs_error),
            wrap_count_accuracy: avg_opt(&|m| m.wrap_count_accuracy),
            valid_fraction: avg(&|m| m.valid_fraction),
            grad_norm: avg_opt(&|m| m.grad_norm),
        })
    }

    /// One-line summary for logs.
    pub fn display(&self) -> String {
        let mut s = format!("loss={:.4} mae={:.4}", self.loss, self.mean_abs_error);
        if let Some(acc) = self.wrap_count_accuracy {
            s.push_str(&format!(" acc={acc:.3}"));
        }
        if let Some(c) = self.consistency_loss {
            s.push_str(&format!(" cons={c:.4}"));
        }
        if let Some(g) = self.grad_norm {
            s.push_str(&format!(" |g|={g:.3}"));
        }
        s
    }
}

/// Metrics recorded at logging steps.
#[derive(Debug, Clone, Default)]
pub struct MetricsHistory {
    entries: Vec<(usize, UnwrapMetrics)>,
}

impl MetricsHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, step: usize, metrics: UnwrapMetrics) {
        self.entries.push((step, metrics));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn last(&self) -> Option<&(usize, UnwrapMetrics)> {
        self.entries.last()
    }

    /// Lowest recorded loss and its step.
    pub fn best_loss(&self) -> Option<(usize, f64)> {
        self.entries
            .iter()
            .filter(|(_, m)| m.loss.is_finite())
            .map(|(s, m)| (*s, m.loss))
            .min_by(|a, b| a.1.total_cmp(&b.1))
    }

    /// Whether the mean loss of the last `window` entries is below the mean
    /// of the `window` entries before them. `false` with too little history.
    pub fn is_improving(&self, window: usize) -> bool {
        if window == 0 || self.entries.len() < 2 * window {
            return false;
        }
        let n = self.entries.len();
        let mean = |range: &[(usize, UnwrapMetrics)]| {
            range.iter().map(|(_, m)| m.loss).sum::<f64>() / window as f64
        };
        mean(&self.entries[n - window..]) < mean(&self.entries[n - 2 * window..n - window])
    }
}
