//! Contracting path: overlapping patch embeddings and mixing blocks.
//!
//! Stage 0 embeds the input with kernel `2p - 1`, stride `p`, padding `p - 1`
//! (`p` = patch size); every later stage halves the resolution with a
//! 3x3 stride-2 convolution. Every stage keeps its output as the skip
//! connection for the decoder level at the same resolution.
//!
//! Early stages mix with gated depthwise convolutions. The coarsest stage
//! uses global self-attention blocks instead, where the token count is
//! smallest.

use burn::nn::conv::Conv2d;
use burn::nn::PaddingConfig2d;
use burn::prelude::*;
use phase_map::UnwrapError;

use crate::model::block::{
    conv, forward_blocks, AttentionBlock, AttentionBlockConfig, LayerNorm2d, MixingBlock,
    MixingBlockConfig,
};

#[derive(Config, Debug)]
pub struct EncoderConfig {
    /// Input channels (wrapped phase + auxiliary).
    pub in_channels: usize,
    /// Output width of each stage, finest first.
    pub channel_widths: Vec<usize>,
    /// Mixing blocks per stage.
    pub stage_depths: Vec<usize>,
    /// Stride of the first patch embedding.
    pub patch_size: usize,
    #[config(default = 4.0)]
    pub mlp_ratio: f64,
    /// Heads of the self-attention blocks in the coarsest stage.
    #[config(default = 4)]
    pub attention_heads: usize,
}

impl EncoderConfig {
    /// Total downsampling: `patch_size * 2^(stages - 1)`, `None` on overflow.
    pub fn downsample_factor(&self) -> Option<usize> {
        let halvings = self.channel_widths.len().saturating_sub(1);
        1usize
            .checked_shl(u32::try_from(halvings).ok()?)
            .and_then(|h| h.checked_mul(self.patch_size))
    }

    pub fn init<B: Backend>(&self, device: &B::Device) -> Encoder<B> {
        let p = self.patch_size.max(1);
        let mut stages = Vec::with_capacity(self.channel_widths.len());
        let mut in_dim = self.in_channels;
        let last = self.channel_widths.len().saturating_sub(1);

        for (i, (&dim, &depth)) in self.channel_widths.iter().zip(&self.stage_depths).enumerate() {
            let proj = if i == 0 {
                conv([in_dim, dim], [2 * p - 1, 2 * p - 1])
                    .with_stride([p, p])
                    .with_padding(PaddingConfig2d::Explicit(p - 1, p - 1))
            } else {
                conv([in_dim, dim], [3, 3])
                    .with_stride([2, 2])
                    .with_padding(PaddingConfig2d::Explicit(1, 1))
            };
            let (blocks, attention) = if i == last {
                let block = AttentionBlockConfig::new(dim)
                    .with_num_heads(self.attention_heads)
                    .with_mlp_ratio(self.mlp_ratio);
                (Vec::new(), (0..depth).map(|_| block.init(device)).collect())
            } else {
                let block = MixingBlockConfig::new(dim).with_mlp_ratio(self.mlp_ratio);
                ((0..depth).map(|_| block.init(device)).collect(), Vec::new())
            };
            stages.push(EncoderStage {
                embed: PatchEmbed {
                    proj: proj.init(device),
                    norm: LayerNorm2d::new(dim, device),
                },
                blocks,
                attention,
                norm: LayerNorm2d::new(dim, device),
            });
            in_dim = dim;
        }

        Encoder {
            stages,
            in_channels: self.in_channels,
            downsample_factor: self.downsample_factor().unwrap_or(usize::MAX),
        }
    }
}

/// Strided convolution followed by channel LayerNorm.
#[derive(Module, Debug)]
pub struct PatchEmbed<B: Backend> {
    proj: Conv2d<B>,
    norm: LayerNorm2d<B>,
}

impl<B: Backend> PatchEmbed<B> {
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        self.norm.forward(self.proj.forward(x))
    }
}

/// One resolution level. Only the coarsest stage has attention blocks,
/// every other stage only mixing blocks.
#[derive(Module, Debug)]
pub struct EncoderStage<B: Backend> {
    embed: PatchEmbed<B>,
    blocks: Vec<MixingBlock<B>>,
    attention: Vec<AttentionBlock<B>>,
    norm: LayerNorm2d<B>,
}

impl<B: Backend> EncoderStage<B> {
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = forward_blocks(&self.blocks, self.embed.forward(x));
        let x = self.attention.iter().fold(x, |x, block| block.forward(x));
        self.norm.forward(x)
    }
}

/// Multi-resolution features produced by the encoder.
#[derive(Debug, Clone)]
pub struct EncoderFeatures<B: Backend> {
    /// Outputs of every stage but the last, finest first.
    pub skips: Vec<Tensor<B, 4>>,
    /// Output of the coarsest stage.
    pub bottleneck: Tensor<B, 4>,
}

#[derive(Module, Debug)]
pub struct Encoder<B: Backend> {
    stages: Vec<EncoderStage<B>>,
    in_channels: usize,
    downsample_factor: usize,
}

impl<B: Backend> Encoder<B> {
    pub fn in_channels(&self) -> usize {
        self.in_channels
    }

    pub fn downsample_factor(&self) -> usize {
        self.downsample_factor
    }

    /// Reject inputs whose channel count or spatial size the network cannot take.
    pub fn check_input(&self, dims: [usize; 4]) -> phase_map::Result<()> {
        let [batch, channels, height, width] = dims;
        if batch == 0 {
            return Err(UnwrapError::shape("encoder", "input", "batch of at least 1", "empty batch"));
        }
        if channels != self.in_channels {
            return Err(UnwrapError::shape(
                "encoder",
                "input channels",
                self.in_channels,
                channels,
            ));
        }
        let df = self.downsample_factor;
        if height == 0 || width == 0 || height % df != 0 || width % df != 0 {
            return Err(UnwrapError::shape(
                "encoder",
                "input grid",
                format!("non-empty H and W divisible by {df}"),
                format!("{height}x{width}"),
            ));
        }
        Ok(())
    }

    /// `(batch, in_channels, H, W)` -> features at `H/p, H/2p, ..., H/df`.
    pub fn forward(&self, input: Tensor<B, 4>) -> EncoderFeatures<B> {
        let mut skips = Vec::with_capacity(self.stages.len());
        let mut x = input;
        for (i, stage) in self.stages.iter().enumerate() {
            if i > 0 {
                skips.push(x.clone());
            }
            x = stage.forward(x);
        }
        EncoderFeatures {
            skips,
            bottleneck: x,
        }
    }
}
