//! The assembled phase-unwrapping U-Net: encoder, decoder and output head.
//!
//! Inputs are checked against the channel count and downsampling factor
//! before the forward pass.

use burn::prelude::*;
use phase_map::UnwrapError;

use crate::model::decoder::{Decoder, DecoderConfig};
use crate::model::encoder::{Encoder, EncoderConfig};
use crate::model::head::{HeadKind, HeadOutput, OutputHead, OutputHeadConfig};

/// Configuration of the full U-shaped network.
///
/// ```text
/// (batch, C_in, H, W)
///   → Encoder: stage 0 (H/p) → stage 1 (H/2p) → ... → stage n-1 (H/df)
///   → Decoder: ConvTranspose x2 + skip fusion per level → bilinear x p → LeakyReLU
///   → OutputHead: 1x1 conv → (batch, H, W) or (batch, 2K+1, H, W)
/// ```
#[derive(Config, Debug)]
pub struct PhaseUNetConfig {
    pub encoder: EncoderConfig,
    pub decoder: DecoderConfig,
    pub head: OutputHeadConfig,
}

impl PhaseUNetConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> PhaseUNet<B> {
        PhaseUNet {
            encoder: self.encoder.init(device),
            decoder: self.decoder.init(device),
            head: self.head.init(device),
        }
    }
}

/// Encoder, decoder and output head.
///
/// Output spatial size equals input spatial size whenever H and W are
/// multiples of the downsampling factor.
#[derive(Module, Debug)]
pub struct PhaseUNet<B: Backend> {
    encoder: Encoder<B>,
    decoder: Decoder<B>,
    head: OutputHead<B>,
}

impl<B: Backend> PhaseUNet<B> {
    pub fn in_channels(&self) -> usize {
        self.encoder.in_channels()
    }

    pub fn downsample_factor(&self) -> usize {
        self.encoder.downsample_factor()
    }

    pub fn head_kind(&self) -> HeadKind {
        self.head.kind()
    }

    /// Decoder features `(batch, C_0, H, W)` without the output head.
    pub fn features(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        self.decoder.forward(self.encoder.forward(input))
    }

    /// Forward pass without input validation.
    pub fn forward(&self, input: Tensor<B, 4>) -> HeadOutput<B> {
        self.head.forward(self.features(input))
    }

    /// Forward pass that rejects malformed input with a shape error
    /// and verifies the output grid matches the input grid.
    pub fn forward_checked(&self, input: Tensor<B, 4>) -> phase_map::Result<HeadOutput<B>> {
        let dims = input.dims();
        self.encoder.check_input(dims)?;

        let out = self.forward(input);
        let [b, _, h, w] = dims;
        let got = out.grid_dims();
        if got != [b, h, w] {
            return Err(UnwrapError::shape(
                "decoder",
                "output",
                format!("{b}x{h}x{w}"),
                format!("{}x{}x{}", got[0], got[1], got[2]),
            ));
        }
        Ok(out)
    }
}
