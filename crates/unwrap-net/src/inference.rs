//! Unwrapping of new phase maps with a frozen network.
//!
//! [`PhaseUnwrapper`] holds a read-only model snapshot and turns
//! [`PhaseInput`]s into [`UnwrapOutput`]s. Two-step models go through
//! argmax decoding and the exact reconstruction, so their output is always
//! congruent with the input; one-step output is snapped onto the input's
//! congruence class unless `project_to_congruence` is off.

use std::path::Path;

use burn::prelude::*;
use phase_map::{
    reconstruct, snap_to_congruence, ConfidenceMap, PhaseInput, Result, UnwrapError, UnwrappedPhaseMap,
    ValidityMask, WrapCountMap,
};

use crate::config::UnwrapConfig;
use crate::model::bridge::{inputs_to_tensor, int_tensor_to_vec, split_batch, tensor_to_vec};
use crate::model::head::HeadOutput;
use crate::model::network::PhaseUNet;
use crate::persist::{load_parameters, restore_parameters};
use crate::reconstruct::decode_wrap_counts;

/// Result of unwrapping one phase map.
#[derive(Debug, Clone, PartialEq)]
pub struct UnwrapOutput {
    pub unwrapped: UnwrappedPhaseMap,
    /// Wrap counts, predicted (two-step) or implied by congruence projection
    /// (one-step). Masked pixels hold [`WrapCountMap::MASKED`].
    pub wrap_counts: Option<WrapCountMap>,
    /// Max class probability per pixel (two-step only), 0 at masked pixels.
    pub confidence: Option<ConfidenceMap>,
    pub mask: ValidityMask,
}

/// Inference front end over a frozen [`PhaseUNet`].
pub struct PhaseUnwrapper<B: Backend> {
    model: PhaseUNet<B>,
    config: UnwrapConfig,
    device: B::Device,
}

impl<B: Backend> PhaseUnwrapper<B> {
    /// Wrap an existing model, checking it was built for `config`.
    pub fn new(model: PhaseUNet<B>, config: UnwrapConfig, device: B::Device) -> Result<Self> {
        config.validate()?;
        if model.head_kind() != config.head_kind() {
            return Err(UnwrapError::model_load(
                "head",
                format!("{:?}", config.head_kind()),
                format!("{:?}", model.head_kind()),
            ));
        }
        if model.in_channels() != config.in_channels {
            return Err(UnwrapError::model_load("in_channels", config.in_channels, model.in_channels()));
        }
        Ok(Self { model, config, device })
    }

    /// Restore from an in-memory parameter blob.
    pub fn from_blob(blob: &[u8], config: UnwrapConfig, device: B::Device) -> Result<Self> {
        let model = restore_parameters::<B>(blob, &config, &device)?;
        Self::new(model, config, device)
    }

    /// Restore from a parameter blob on disk.
    pub fn load(path: &Path, config: UnwrapConfig, device: B::Device) -> Result<Self> {
        let model = load_parameters::<B>(path, &config, &device)?;
        tracing::info!(path = %path.display(), mode = %config.mode, "Loaded unwrapper");
        Self::new(model, config, device)
    }

    pub fn config(&self) -> &UnwrapConfig {
        &self.config
    }

    pub fn model(&self) -> &PhaseUNet<B> {
        &self.model
    }

    /// Unwrap a single phase map.
    pub fn unwrap(&self, input: &PhaseInput) -> Result<UnwrapOutput> {
        self.unwrap_batch(&[input])?
            .into_iter()
            .next()
            .ok_or_else(|| UnwrapError::shape("inference", "output", "1 map", "0 maps"))
    }

    /// Unwrap a batch of phase maps that share one grid shape.
    pub fn unwrap_batch(&self, inputs: &[&PhaseInput]) -> Result<Vec<UnwrapOutput>> {
        if inputs.is_empty() {
            return Ok(Vec::new());
        }
        if let Some(bad) = inputs.iter().find(|i| i.num_channels() != self.config.in_channels) {
            return Err(UnwrapError::shape(
                "inference",
                "input channels",
                self.config.in_channels,
                bad.num_channels(),
            ));
        }

        let shape = inputs[0].shape();
        let tensor = inputs_to_tensor::<B>(inputs, &self.device)?;
        let outputs = match self.model.forward_checked(tensor)? {
            HeadOutput::Regression(pred) => {
                let per_sample = split_batch(&tensor_to_vec(pred), shape);
                inputs
                    .iter()
                    .zip(per_sample)
                    .map(|(input, pred)| self.finish_regression(input, pred))
                    .collect::<Result<Vec<_>>>()?
            }
            HeadOutput::WrapCount {
                logits,
                max_wrap_count,
            } => {
                let (counts, confidence) = decode_wrap_counts(logits, max_wrap_count);
                let counts = split_batch(&int_tensor_to_vec(counts), shape);
                let confidence = split_batch(&tensor_to_vec(confidence), shape);
                inputs
                    .iter()
                    .zip(counts.into_iter().zip(confidence))
                    .map(|(input, (counts, confidence))| {
                        finish_wrap_counts(input, counts, confidence, max_wrap_count)
                    })
                    .collect::<Result<Vec<_>>>()?
            }
        };

        tracing::debug!(batch = inputs.len(), height = shape.height, width = shape.width, "Unwrapped batch");
        Ok(outputs)
    }

    fn finish_regression(&self, input: &PhaseInput, mut pred: Vec<f32>) -> Result<UnwrapOutput> {
        let valid = input.mask.as_slice();
        if let Some(i) = (0..pred.len()).find(|&i| valid[i] && !pred[i].is_finite()) {
            let (row, col) = input.shape().position(i);
            return Err(UnwrapError::NumericInstability {
                stage: "inference",
                step: 0,
                detail: format!("regression output {} at pixel ({row}, {col})", pred[i]),
            });
        }

        if self.config.project_to_congruence {
            let (unwrapped, counts) = snap_to_congruence(&pred, &input.wrapped, &input.mask)?;
            return Ok(UnwrapOutput {
                unwrapped,
                wrap_counts: Some(counts),
                confidence: None,
                mask: input.mask.clone(),
            });
        }

        for ((p, &w), &v) in pred.iter_mut().zip(input.wrapped.values()).zip(valid) {
            if !v {
                *p = w;
            }
        }
        Ok(UnwrapOutput {
            unwrapped: UnwrappedPhaseMap::new(input.shape(), pred)?,
            wrap_counts: None,
            confidence: None,
            mask: input.mask.clone(),
        })
    }
}

fn finish_wrap_counts(
    input: &PhaseInput,
    counts: Vec<i64>,
    mut confidence: Vec<f32>,
    max_wrap_count: u32,
) -> Result<UnwrapOutput> {
    let valid = input.mask.as_slice();
    let counts: Vec<i32> = counts
        .iter()
        .zip(valid)
        .map(|(&k, &v)| if v { k as i32 } else { WrapCountMap::MASKED })
        .collect();
    for (c, &v) in confidence.iter_mut().zip(valid) {
        if !v {
            *c = 0.0;
        }
    }

    let counts = WrapCountMap::new(input.shape(), counts, max_wrap_count)?;
    Ok(UnwrapOutput {
        unwrapped: reconstruct(&input.wrapped, &counts)?,
        wrap_counts: Some(counts),
        confidence: Some(ConfidenceMap::new(input.shape(), confidence)?),
        mask: input.mask.clone(),
    })
}
