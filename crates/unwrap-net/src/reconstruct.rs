//! Tensor form of wrap-count decoding and the exact reconstruction
//! `unwrapped = wrapped + 2pi * k`.

use std::f32::consts::TAU;

use burn::prelude::*;
use burn::tensor::activation::softmax;

/// `wrapped + 2pi * counts`; pixels where `valid` is false keep `wrapped`.
///
/// All tensors are `(batch, H, W)`.
pub fn reconstruct_tensor<B: Backend>(
    wrapped: Tensor<B, 3>,
    counts: Tensor<B, 3, Int>,
    valid: Tensor<B, 3, Bool>,
) -> Tensor<B, 3> {
    let unwrapped = wrapped.clone() + counts.float().mul_scalar(TAU);
    unwrapped.mask_where(valid.bool_not(), wrapped)
}

/// Most likely wrap count per pixel and its probability.
///
/// `logits`: `(batch, 2K + 1, H, W)`; returns `(counts, confidence)`, both
/// `(batch, H, W)`, with counts already shifted into `[-K, K]`.
pub fn decode_wrap_counts<B: Backend>(
    logits: Tensor<B, 4>,
    max_wrap_count: u32,
) -> (Tensor<B, 3, Int>, Tensor<B, 3>) {
    let probs = softmax(logits, 1);
    let confidence = probs.clone().max_dim(1).squeeze::<3>(1);
    let classes = probs.argmax(1).squeeze::<3>(1);
    (classes.sub_scalar(max_wrap_count as i64), confidence)
}

/// Wrap count value of every class, shaped `(1, 2K + 1, 1, 1)` for broadcasting.
pub fn class_values<B: Backend>(max_wrap_count: u32, device: &B::Device) -> Tensor<B, 4> {
    let k = max_wrap_count as i64;
    Tensor::<B, 1, Int>::arange(-k..k + 1, device)
        .float()
        .reshape([1, (2 * k + 1) as usize, 1, 1])
}

/// Differentiable reconstruction from the expected wrap count under the
/// softmax: `wrapped + 2pi * sum_c p_c * (c - K)`.
pub fn soft_reconstruct<B: Backend>(
    logits: Tensor<B, 4>,
    wrapped: Tensor<B, 3>,
    max_wrap_count: u32,
) -> Tensor<B, 3> {
    let device = logits.device();
    let probs = softmax(logits, 1);
    let expected = (probs * class_values::<B>(max_wrap_count, &device))
        .sum_dim(1)
        .squeeze::<3>(1);
    wrapped + expected.mul_scalar(TAU)
}
