//! Expanding path: transposed-conv upsampling fused with encoder skips.

use burn::nn::conv::{Conv2d, ConvTranspose2d, ConvTranspose2dConfig};
use burn::prelude::*;
use burn::tensor::module::interpolate;
use burn::tensor::ops::{InterpolateMode, InterpolateOptions};

use crate::config::SkipFusion;
use crate::model::block::{
    conv, conv_initializer, forward_blocks, LayerNorm2d, MixingBlock, MixingBlockConfig,
};
use crate::model::encoder::EncoderFeatures;

/// Slope of the LeakyReLU after the final upsample.
pub const OUTPUT_NEGATIVE_SLOPE: f64 = 0.01;

#[derive(Config, Debug)]
pub struct DecoderConfig {
    /// Encoder stage widths, finest first. The decoder mirrors them.
    pub channel_widths: Vec<usize>,
    /// Mixing blocks per level, finest first.
    pub stage_depths: Vec<usize>,
    /// Factor of the final bilinear upsample back to input resolution.
    pub patch_size: usize,
    pub skip_fusion: SkipFusion,
    #[config(default = 4.0)]
    pub mlp_ratio: f64,
}

impl DecoderConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> Decoder<B> {
        let levels = self.channel_widths.len();
        // Coarsest level first: each stage lifts level i+1 onto level i.
        let stages = (0..levels.saturating_sub(1))
            .rev()
            .map(|i| {
                let (dim, coarse_dim) = (self.channel_widths[i], self.channel_widths[i + 1]);
                let fuse = match self.skip_fusion {
                    SkipFusion::Concatenate => {
                        Some(conv([2 * dim, dim], [1, 1]).init(device))
                    }
                    SkipFusion::Add => None,
                };
                let block = MixingBlockConfig::new(dim).with_mlp_ratio(self.mlp_ratio);
                DecoderStage {
                    up: ConvTranspose2dConfig::new([coarse_dim, dim], [3, 3])
                        .with_stride([2, 2])
                        .with_padding([1, 1])
                        .with_padding_out([1, 1])
                        .with_initializer(conv_initializer())
                        .init(device),
                    fuse,
                    blocks: (0..self.stage_depths[i]).map(|_| block.init(device)).collect(),
                    norm: LayerNorm2d::new(dim, device),
                }
            })
            .collect();

        Decoder {
            stages,
            patch_size: self.patch_size.max(1),
        }
    }
}

/// One decoder level: upsample x2, merge the skip, mix.
#[derive(Module, Debug)]
pub struct DecoderStage<B: Backend> {
    up: ConvTranspose2d<B>,
    /// 1x1 projection after concatenation; `None` for additive fusion.
    fuse: Option<Conv2d<B>>,
    blocks: Vec<MixingBlock<B>>,
    norm: LayerNorm2d<B>,
}

impl<B: Backend> DecoderStage<B> {
    pub fn forward(&self, x: Tensor<B, 4>, skip: Tensor<B, 4>) -> Tensor<B, 4> {
        let up = self.up.forward(x);
        let merged = match &self.fuse {
            Some(fuse) => fuse.forward(Tensor::cat(vec![up, skip], 1)),
            None => up + skip,
        };
        self.norm.forward(forward_blocks(&self.blocks, merged))
    }
}

#[derive(Module, Debug)]
pub struct Decoder<B: Backend> {
    stages: Vec<DecoderStage<B>>,
    patch_size: usize,
}

impl<B: Backend> Decoder<B> {
    /// Features at input resolution with the finest encoder width.
    ///
    /// `(batch, C_last, H/df, W/df)` + skips -> `(batch, C_0, H, W)`
    pub fn forward(&self, features: EncoderFeatures<B>) -> Tensor<B, 4> {
        let EncoderFeatures { skips, bottleneck } = features;
        let x = self
            .stages
            .iter()
            .zip(skips.into_iter().rev())
            .fold(bottleneck, |x, (stage, skip)| stage.forward(x, skip));

        let x = if self.patch_size > 1 {
            let [_, _, h, w] = x.dims();
            interpolate(
                x,
                [h * self.patch_size, w * self.patch_size],
                InterpolateOptions::new(InterpolateMode::Bilinear),
            )
        } else {
            x
        };
        burn::tensor::activation::leaky_relu(x, OUTPUT_NEGATIVE_SLOPE)
    }
}
