//! Tensor bridge: conversions between phase-map grids and burn tensors.
//!
//! Grids are row-major `Vec`s; tensors are `(batch, H, W)` or
//! `(batch, C, H, W)`. Every function here checks that the grids in a batch
//! share one shape before flattening them.

use burn::prelude::*;
use burn::tensor::TensorData;
use phase_map::{GridShape, PhaseInput, Result, UnwrapError, ValidityMask, WrapCountMap};

/// Common shape of a non-empty batch of grids.
pub fn batch_shape(shapes: impl IntoIterator<Item = GridShape>) -> Result<GridShape> {
    let mut shapes = shapes.into_iter();
    let first = shapes
        .next()
        .ok_or_else(|| UnwrapError::shape("batch", "grids", "at least one grid", "empty batch"))?;
    for shape in shapes {
        if shape != first {
            return Err(UnwrapError::shape("batch", "grid", first, shape));
        }
    }
    Ok(first)
}

/// Stack network inputs into `(batch, C, H, W)`: wrapped phase first, then
/// auxiliary channels in insertion order.
pub fn inputs_to_tensor<B: Backend>(
    inputs: &[&PhaseInput],
    device: &B::Device,
) -> Result<Tensor<B, 4>> {
    let shape = batch_shape(inputs.iter().map(|i| i.shape()))?;
    let channels = inputs[0].num_channels();
    let mut flat = Vec::with_capacity(inputs.len() * channels * shape.len());
    for input in inputs {
        if input.num_channels() != channels {
            return Err(UnwrapError::shape(
                "batch",
                "input channels",
                channels,
                input.num_channels(),
            ));
        }
        flat.extend_from_slice(input.wrapped.values());
        for aux in &input.auxiliary {
            flat.extend_from_slice(aux.values.as_slice());
        }
    }
    Ok(Tensor::from_data(
        TensorData::new(flat, [inputs.len(), channels, shape.height, shape.width]),
        device,
    ))
}

/// `(batch, H, W)` float weights: 1.0 on valid pixels, 0.0 on masked ones.
pub fn masks_to_tensor<B: Backend>(
    masks: &[&ValidityMask],
    device: &B::Device,
) -> Result<Tensor<B, 3>> {
    let shape = batch_shape(masks.iter().map(|m| m.shape()))?;
    let flat: Vec<f32> = masks
        .iter()
        .flat_map(|m| m.as_slice().iter().map(|&v| if v { 1.0 } else { 0.0 }))
        .collect();
    Ok(Tensor::from_data(
        TensorData::new(flat, [masks.len(), shape.height, shape.width]),
        device,
    ))
}

/// `(batch, H, W)` float tensor from row-major grids of one shape.
///
/// Values at pixels where `valid` is false are written as 0.0, so NaN
/// placeholders in ground truth never reach the graph.
pub fn grids_to_tensor<B: Backend>(
    grids: &[&[f32]],
    masks: &[&ValidityMask],
    device: &B::Device,
) -> Result<Tensor<B, 3>> {
    let shape = batch_shape(masks.iter().map(|m| m.shape()))?;
    if grids.len() != masks.len() {
        return Err(UnwrapError::shape("batch", "grids", masks.len(), grids.len()));
    }
    let mut flat = Vec::with_capacity(grids.len() * shape.len());
    for (grid, mask) in grids.iter().zip(masks) {
        if grid.len() != shape.len() {
            return Err(UnwrapError::shape(
                "batch",
                "grid values",
                shape.len(),
                grid.len(),
            ));
        }
        flat.extend(
            grid.iter()
                .zip(mask.as_slice())
                .map(|(&v, &valid)| if valid { v } else { 0.0 }),
        );
    }
    Ok(Tensor::from_data(
        TensorData::new(flat, [grids.len(), shape.height, shape.width]),
        device,
    ))
}

/// `(batch, H, W)` int tensor of wrap counts; masked sentinels become 0.
pub fn counts_to_tensor<B: Backend>(
    counts: &[&WrapCountMap],
    device: &B::Device,
) -> Result<Tensor<B, 3, Int>> {
    let shape = batch_shape(counts.iter().map(|c| c.shape()))?;
    let flat: Vec<i64> = counts
        .iter()
        .flat_map(|c| {
            c.counts().iter().map(|&k| match k {
                WrapCountMap::MASKED => 0,
                k => k as i64,
            })
        })
        .collect();
    Ok(Tensor::from_data(
        TensorData::new(flat, [counts.len(), shape.height, shape.width]),
        device,
    ))
}

/// Flatten a float tensor into row-major `f32` values.
pub fn tensor_to_vec<B: Backend, const D: usize>(tensor: Tensor<B, D>) -> Vec<f32> {
    tensor.into_data().iter::<f32>().collect()
}

/// Flatten an int tensor into row-major `i64` values.
pub fn int_tensor_to_vec<B: Backend, const D: usize>(tensor: Tensor<B, D, Int>) -> Vec<i64> {
    tensor.into_data().iter::<i64>().collect()
}

/// Split a flat `(batch, H, W)` buffer into one `Vec` per sample.
pub fn split_batch<T: Copy>(flat: &[T], shape: GridShape) -> Vec<Vec<T>> {
    flat.chunks(shape.len().max(1)).map(|c| c.to_vec()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::ndarray::NdArray;
    use phase_map::{Grid, WrappedPhaseMap};

    type TestBackend = NdArray<f32>;

    fn input(values: Vec<f32>) -> PhaseInput {
        PhaseInput::new(WrappedPhaseMap::new(GridShape::new(2, 2), values).unwrap())
    }

    #[test]
    fn test_inputs_round_trip() {
        let device = Default::default();
        let a = input(vec![0.1, 0.2, 0.3, 0.4]);
        let b = input(vec![-0.1, -0.2, -0.3, -0.4]);
        let t = inputs_to_tensor::<TestBackend>(&[&a, &b], &device).unwrap();
        assert_eq!(t.dims(), [2, 1, 2, 2]);
        let values = tensor_to_vec(t);
        assert_eq!(&values[..4], a.wrapped.values());
        assert_eq!(&values[4..], b.wrapped.values());
    }

    #[test]
    fn test_auxiliary_channels_are_stacked() {
        let device = Default::default();
        let a = input(vec![0.0; 4])
            .with_auxiliary("coherence", Grid::filled(GridShape::new(2, 2), 1.0))
            .unwrap();
        let t = inputs_to_tensor::<TestBackend>(&[&a], &device).unwrap();
        assert_eq!(t.dims(), [1, 2, 2, 2]);
        assert_eq!(tensor_to_vec(t), vec![0.0, 0.0, 0.0, 0.0, 1.0, 1.0, 1.0, 1.0]);
    }

    #[test]
    fn test_mixed_shapes_rejected() {
        let device = Default::default();
        let a = input(vec![0.0; 4]);
        let b = PhaseInput::new(WrappedPhaseMap::new(GridShape::new(1, 4), vec![0.0; 4]).unwrap());
        let err = inputs_to_tensor::<TestBackend>(&[&a, &b], &device).unwrap_err();
        assert!(matches!(err, UnwrapError::Shape { .. }), "{err}");
        assert!(inputs_to_tensor::<TestBackend>(&[], &device).is_err());
    }

    #[test]
    fn test_grids_zero_masked_values() {
        let device = Default::default();
        let mask = ValidityMask::new(GridShape::new(2, 2), vec![true, false, true, false]).unwrap();
        let grid = [1.0_f32, f32::NAN, 3.0, f32::INFINITY];
        let t = grids_to_tensor::<TestBackend>(&[&grid], &[&mask], &device).unwrap();
        assert_eq!(tensor_to_vec(t), vec![1.0, 0.0, 3.0, 0.0]);

        let weights = masks_to_tensor::<TestBackend>(&[&mask], &device).unwrap();
        assert_eq!(tensor_to_vec(weights), vec![1.0, 0.0, 1.0, 0.0]);
    }

    #[test]
    fn test_counts_sentinel_becomes_zero() {
        let device = Default::default();
        let counts = WrapCountMap::new(
            GridShape::new(2, 2),
            vec![1, WrapCountMap::MASKED, -2, 0],
            2,
        )
        .unwrap();
        let t = counts_to_tensor::<TestBackend>(&[&counts], &device).unwrap();
        assert_eq!(int_tensor_to_vec(t), vec![1, 0, -2, 0]);
    }

    #[test]
    fn test_split_batch() {
        let parts = split_batch(&[1, 2, 3, 4, 5, 6, 7, 8], GridShape::new(2, 2));
        assert_eq!(parts, vec![vec![1, 2, 3, 4], vec![5, 6, 7, 8]]);
    }
}
