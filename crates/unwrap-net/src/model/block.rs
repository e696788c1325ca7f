use burn::nn::attention::{MhaInput, MultiHeadAttention, MultiHeadAttentionConfig};
use burn::nn::conv::{Conv2d, Conv2dConfig};
use burn::nn::{Initializer, LayerNorm, LayerNormConfig, PaddingConfig2d};
use burn::prelude::*;

/// Fan-out normal init shared by every convolution of the network.
pub(crate) fn conv_initializer() -> Initializer {
    Initializer::KaimingNormal {
        gain: std::f64::consts::SQRT_2,
        fan_out_only: true,
    }
}

/// Small normal init for the attention projections.
pub(crate) fn linear_initializer() -> Initializer {
    Initializer::Normal { mean: 0.0, std: 0.02 }
}

/// Conv2d config with the shared init applied.
pub(crate) fn conv(channels: [usize; 2], kernel: [usize; 2]) -> Conv2dConfig {
    Conv2dConfig::new(channels, kernel).with_initializer(conv_initializer())
}

/// LayerNorm over the channel axis of an NCHW tensor.
#[derive(Module, Debug)]
pub struct LayerNorm2d<B: Backend> {
    norm: LayerNorm<B>,
}

impl<B: Backend> LayerNorm2d<B> {
    pub fn new(channels: usize, device: &B::Device) -> Self {
        Self {
            norm: LayerNormConfig::new(channels).init(device),
        }
    }

    /// `(batch, C, H, W) -> (batch, C, H, W)`
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = x.permute([0, 2, 3, 1]);
        self.norm.forward(x).permute([0, 3, 1, 2])
    }
}

/// Configuration for a convolutional gated mixing block.
///
/// ```text
/// x ─┬─ LayerNorm2d ─┬─ 1x1 value ─ 3x3 depthwise ─ GELU ─┐
///    │               └─ 1x1 gate ─────────────────────────×─ 1x1 proj ─┐
///    └──────────────────────────────────────────────────────────────────+─ out
/// ```
#[derive(Config, Debug)]
pub struct MixingBlockConfig {
    /// Channels in and out.
    pub dim: usize,
    /// Hidden expansion; the gated hidden width is `2 * dim * mlp_ratio / 3`.
    #[config(default = 4.0)]
    pub mlp_ratio: f64,
}

impl MixingBlockConfig {
    /// Hidden width of the gated path, at least 1.
    pub fn hidden_dim(&self) -> usize {
        ((2.0 * self.dim as f64 * self.mlp_ratio / 3.0) as usize).max(1)
    }

    pub fn init<B: Backend>(&self, device: &B::Device) -> MixingBlock<B> {
        let hidden = self.hidden_dim();
        MixingBlock {
            norm: LayerNorm2d::new(self.dim, device),
            value: conv([self.dim, hidden], [1, 1]).init(device),
            gate: conv([self.dim, hidden], [1, 1]).init(device),
            depthwise: conv([hidden, hidden], [3, 3])
                .with_padding(PaddingConfig2d::Explicit(1, 1))
                .with_groups(hidden)
                .init(device),
            proj: conv([hidden, self.dim], [1, 1]).init(device),
        }
    }
}

/// Pre-norm residual block mixing spatial context through a gated depthwise conv.
#[derive(Module, Debug)]
pub struct MixingBlock<B: Backend> {
    norm: LayerNorm2d<B>,
    value: Conv2d<B>,
    gate: Conv2d<B>,
    depthwise: Conv2d<B>,
    proj: Conv2d<B>,
}

impl<B: Backend> MixingBlock<B> {
    /// Shape-preserving: `(batch, dim, H, W) -> (batch, dim, H, W)`.
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let h = self.norm.forward(x.clone());
        let value = self.value.forward(h.clone());
        let value = burn::tensor::activation::gelu(self.depthwise.forward(value));
        let gate = self.gate.forward(h);
        x + self.proj.forward(value * gate)
    }
}

/// Run `blocks` in order.
pub(crate) fn forward_blocks<B: Backend>(blocks: &[MixingBlock<B>], x: Tensor<B, 4>) -> Tensor<B, 4> {
    blocks.iter().fold(x, |x, block| block.forward(x))
}

/// Configuration for a global self-attention block.
///
/// ```text
/// x ─┬─ flatten ─ LayerNorm ─ MHSA ─┐
///    └──────────────────────────────+─ unflatten ─ MixingBlock ─ out
/// ```
///
/// Every position attends to every other, so one block gives the stage a
/// receptive field covering the whole grid.
#[derive(Config, Debug)]
pub struct AttentionBlockConfig {
    /// Channels in and out; must be divisible by `num_heads`.
    pub dim: usize,
    #[config(default = 4)]
    pub num_heads: usize,
    #[config(default = 4.0)]
    pub mlp_ratio: f64,
}

impl AttentionBlockConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> AttentionBlock<B> {
        AttentionBlock {
            norm: LayerNormConfig::new(self.dim).init(device),
            attn: MultiHeadAttentionConfig::new(self.dim, self.num_heads)
                .with_dropout(0.0)
                .with_initializer(linear_initializer())
                .init(device),
            mlp: MixingBlockConfig::new(self.dim)
                .with_mlp_ratio(self.mlp_ratio)
                .init(device),
        }
    }
}

/// Pre-norm multi-head self-attention over all pixels, followed by a
/// gated mixing block as the feed-forward part.
#[derive(Module, Debug)]
pub struct AttentionBlock<B: Backend> {
    norm: LayerNorm<B>,
    attn: MultiHeadAttention<B>,
    mlp: MixingBlock<B>,
}

impl<B: Backend> AttentionBlock<B> {
    /// Shape-preserving: `(batch, dim, H, W) -> (batch, dim, H, W)`.
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let [batch, dim, height, width] = x.dims();
        let tokens = x.reshape([batch, dim, height * width]).swap_dims(1, 2);
        let context = self
            .attn
            .forward(MhaInput::self_attn(self.norm.forward(tokens.clone())))
            .context;
        let x = (tokens + context)
            .swap_dims(1, 2)
            .reshape([batch, dim, height, width]);
        self.mlp.forward(x)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::ndarray::NdArray;
    use burn::tensor::Distribution;

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_hidden_dim() {
        assert_eq!(MixingBlockConfig::new(48).hidden_dim(), 128);
        assert_eq!(MixingBlockConfig::new(1).with_mlp_ratio(0.1).hidden_dim(), 1);
    }

    #[test]
    fn test_block_preserves_shape() {
        let device = Default::default();
        let block = MixingBlockConfig::new(8).init::<TestBackend>(&device);
        let x = Tensor::<TestBackend, 4>::random([2, 8, 6, 5], Distribution::Normal(0.0, 1.0), &device);
        assert_eq!(block.forward(x).dims(), [2, 8, 6, 5]);
    }

    #[test]
    fn test_attention_block_preserves_shape() {
        let device = Default::default();
        let block = AttentionBlockConfig::new(8).with_num_heads(2).init::<TestBackend>(&device);
        let x = Tensor::<TestBackend, 4>::random([2, 8, 3, 5], Distribution::Normal(0.0, 1.0), &device);
        assert_eq!(block.forward(x).dims(), [2, 8, 3, 5]);
    }

    #[test]
    fn test_attention_block_sees_whole_grid() {
        let device = Default::default();
        let attention = AttentionBlockConfig::new(8).with_num_heads(2).init::<TestBackend>(&device);
        let mixing = MixingBlockConfig::new(8).init::<TestBackend>(&device);

        let base = Tensor::<TestBackend, 4>::random([1, 8, 8, 8], Distribution::Normal(0.0, 1.0), &device);
        let bump = Tensor::<TestBackend, 4>::zeros([1, 8, 8, 8], &device)
            .slice_assign([0..1, 0..8, 7..8, 7..8], Tensor::ones([1, 8, 1, 1], &device) * 5.0);
        let moved = base.clone() + bump;

        // Change at the far corner, read at the origin.
        let corner = |y: Tensor<TestBackend, 4>| y.slice([0..1, 0..8, 0..1, 0..1]);
        let delta = |a: Tensor<TestBackend, 4>, b: Tensor<TestBackend, 4>| -> f32 {
            (corner(a) - corner(b)).abs().max().into_scalar().elem()
        };

        let local = delta(mixing.forward(base.clone()), mixing.forward(moved.clone()));
        assert_eq!(local, 0.0, "3x3 mixing should not reach 7 pixels away");
        let global = delta(attention.forward(base), attention.forward(moved));
        assert!(global > 1e-6, "attention output at the origin ignored the far pixel");
    }

    #[test]
    fn test_layer_norm_normalizes_channels() {
        let device = Default::default();
        let norm = LayerNorm2d::<TestBackend>::new(4, &device);
        let x = Tensor::<TestBackend, 4>::random([1, 4, 3, 3], Distribution::Normal(5.0, 2.0), &device);
        let y = norm.forward(x);
        assert_eq!(y.dims(), [1, 4, 3, 3]);

        // Mean over channels is ~0 at every pixel
        let channel_mean = y.mean_dim(1).abs().max();
        let worst: f32 = channel_mean.into_scalar().elem();
        assert!(worst < 1e-4, "channel mean not centred: {worst}");
    }
}
