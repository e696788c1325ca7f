//! Output heads: a single regression channel, or `2K + 1` wrap-count logits.
//!
//! The head is a 1x1 convolution over the decoder output. Its kind is part
//! of the architecture key, so a blob trained for one head never loads into
//! the other.

use burn::nn::conv::Conv2d;
use burn::prelude::*;
use serde::{Deserialize, Serialize};

use crate::model::block::conv;

/// Which output the network produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum HeadKind {
    /// One channel of unwrapped phase.
    Regression,
    /// `2K + 1` logits over wrap counts `-K..=K`.
    WrapCount { max_wrap_count: u32 },
}

impl HeadKind {
    pub fn out_channels(&self) -> usize {
        match self {
            Self::Regression => 1,
            Self::WrapCount { max_wrap_count } => 2 * *max_wrap_count as usize + 1,
        }
    }
}

#[derive(Config, Debug)]
pub struct OutputHeadConfig {
    /// Width of the decoder output.
    pub in_channels: usize,
    pub kind: HeadKind,
}

impl OutputHeadConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> OutputHead<B> {
        let max_wrap_count = match self.kind {
            HeadKind::Regression => 0,
            HeadKind::WrapCount { max_wrap_count } => max_wrap_count as usize,
        };
        OutputHead {
            proj: conv([self.in_channels, self.kind.out_channels()], [1, 1]).init(device),
            max_wrap_count,
        }
    }
}

/// 1x1 projection from decoder features to the mode's output.
#[derive(Module, Debug)]
pub struct OutputHead<B: Backend> {
    proj: Conv2d<B>,
    /// `K` of the classification head; 0 marks the regression head.
    max_wrap_count: usize,
}

/// Raw network output, before any reconstruction.
#[derive(Debug, Clone)]
pub enum HeadOutput<B: Backend> {
    /// `(batch, H, W)` unwrapped phase.
    Regression(Tensor<B, 3>),
    /// `(batch, 2K + 1, H, W)` logits; channel `c` stands for count `c - K`.
    WrapCount { logits: Tensor<B, 4>, max_wrap_count: u32 },
}

impl<B: Backend> HeadOutput<B> {
    /// Spatial dims `[batch, H, W]` of the output.
    pub fn grid_dims(&self) -> [usize; 3] {
        match self {
            Self::Regression(t) => t.dims(),
            Self::WrapCount { logits, .. } => {
                let [b, _, h, w] = logits.dims();
                [b, h, w]
            }
        }
    }
}

impl<B: Backend> OutputHead<B> {
    pub fn kind(&self) -> HeadKind {
        match self.max_wrap_count {
            0 => HeadKind::Regression,
            k => HeadKind::WrapCount {
                max_wrap_count: k as u32,
            },
        }
    }

    /// `(batch, C, H, W)` decoder features -> mode-specific output.
    pub fn forward(&self, features: Tensor<B, 4>) -> HeadOutput<B> {
        let out = self.proj.forward(features);
        match self.kind() {
            HeadKind::Regression => HeadOutput::Regression(out.squeeze::<3>(1)),
            HeadKind::WrapCount { max_wrap_count } => HeadOutput::WrapCount {
                logits: out,
                max_wrap_count,
            },
        }
    }
}
