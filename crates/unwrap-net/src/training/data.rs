//! Batching: seeded index sampling and collation of samples into tensors.

use burn::prelude::*;
use phase_map::{PhaseDataset, Result, TrainingSample, UnwrapError, UnwrappedPhaseMap, WrapCountMap};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use crate::config::{UnwrapConfig, UnwrapMode};
use crate::model::bridge::{counts_to_tensor, grids_to_tensor, inputs_to_tensor, masks_to_tensor};

/// A collated batch. Every grid tensor is `(batch, H, W)`.
#[derive(Debug, Clone)]
pub struct PhaseBatch<B: Backend> {
    /// Network input `(batch, C, H, W)`.
    pub inputs: Tensor<B, 4>,
    /// Wrapped phase channel.
    pub wrapped: Tensor<B, 3>,
    /// 1.0 on valid pixels, 0.0 on masked ones.
    pub valid: Tensor<B, 3>,
    /// Unwrapped ground truth, 0.0 at masked pixels.
    pub unwrapped: Tensor<B, 3>,
    /// Ground-truth wrap counts in `[-K, K]` (two-step only), 0 at masked pixels.
    pub wrap_counts: Option<Tensor<B, 3, Int>>,
}

impl<B: Backend> PhaseBatch<B> {
    pub fn batch_size(&self) -> usize {
        self.inputs.dims()[0]
    }

    /// Masked pixels as a bool tensor (`true` = excluded).
    pub fn invalid(&self) -> Tensor<B, 3, Bool> {
        self.valid.clone().lower_elem(0.5)
    }

    /// Number of valid pixels as a 1-element tensor.
    pub fn valid_count(&self) -> Tensor<B, 1> {
        self.valid.clone().sum()
    }
}

/// Turn samples into tensors for `config`'s mode.
///
/// Ground truth is completed on the fly: the unwrapped map is rebuilt from
/// wrap counts when only those are labelled, and wrap counts are derived
/// from the unwrapped map in two-step mode. Counts outside `[-K, K]` are a
/// configuration error.
pub fn collate<B: Backend>(
    samples: &[TrainingSample],
    config: &UnwrapConfig,
    device: &B::Device,
) -> Result<PhaseBatch<B>> {
    if samples.is_empty() {
        return Err(UnwrapError::shape("collate", "samples", "at least one sample", "empty batch"));
    }
    if samples[0].input.num_channels() != config.in_channels {
        return Err(UnwrapError::shape(
            "collate",
            "input channels",
            config.in_channels,
            samples[0].input.num_channels(),
        ));
    }

    let inputs: Vec<_> = samples.iter().map(|s| &s.input).collect();
    let masks: Vec<_> = samples.iter().map(|s| s.mask()).collect();

    let truths: Vec<UnwrappedPhaseMap> = samples
        .iter()
        .map(|s| {
            s.unwrapped_truth().ok_or_else(|| {
                UnwrapError::config("ground_truth", "sample has neither unwrapped phase nor wrap counts")
            })
        })
        .collect::<Result<_>>()?;

    let wrap_counts = match (config.mode, config.max_wrap_count) {
        (UnwrapMode::TwoStep, Some(k)) => {
            let counts: Vec<WrapCountMap> = samples
                .iter()
                .map(|s| s.wrap_count_truth(k))
                .collect::<Result<_>>()?;
            let refs: Vec<_> = counts.iter().collect();
            Some(counts_to_tensor(&refs, device)?)
        }
        (UnwrapMode::TwoStep, None) => {
            return Err(UnwrapError::config("max_wrap_count", "required in two_step mode"))
        }
        (UnwrapMode::OneStep, _) => None,
    };

    let wrapped: Vec<&[f32]> = samples.iter().map(|s| s.input.wrapped.values()).collect();
    let unwrapped: Vec<&[f32]> = truths.iter().map(|u| u.values()).collect();

    Ok(PhaseBatch {
        inputs: inputs_to_tensor(&inputs, device)?,
        wrapped: grids_to_tensor(&wrapped, &masks, device)?,
        valid: masks_to_tensor(&masks, device)?,
        unwrapped: grids_to_tensor(&unwrapped, &masks, device)?,
        wrap_counts,
    })
}

/// Seeded sampler of batch indices.
///
/// Walks a shuffled permutation of the dataset and reshuffles after every
/// pass, so a given seed always yields the same sequence of batches.
#[derive(Debug, Clone)]
pub struct BatchSampler {
    order: Vec<usize>,
    cursor: usize,
    rng: StdRng,
}

impl BatchSampler {
    pub fn new(len: usize, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut order: Vec<usize> = (0..len).collect();
        order.shuffle(&mut rng);
        Self {
            order,
            cursor: 0,
            rng,
        }
    }

    /// Next `batch_size` indices; empty if the dataset is empty.
    pub fn next_indices(&mut self, batch_size: usize) -> Vec<usize> {
        if self.order.is_empty() {
            return Vec::new();
        }
        let mut batch = Vec::with_capacity(batch_size);
        while batch.len() < batch_size {
            if self.cursor == self.order.len() {
                self.order.shuffle(&mut self.rng);
                self.cursor = 0;
            }
            batch.push(self.order[self.cursor]);
            self.cursor += 1;
        }
        batch
    }

    /// Next batch of samples from `dataset`.
    pub fn sample_batch(&mut self, dataset: &dyn PhaseDataset, batch_size: usize) -> Vec<TrainingSample> {
        self.next_indices(batch_size)
            .into_iter()
            .filter_map(|i| dataset.get(i))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::bridge::{int_tensor_to_vec, tensor_to_vec};
    use burn::backend::ndarray::NdArray;
    use phase_map::{GridShape, PhaseInput, SyntheticConfig, SyntheticPhaseDataset, ValidityMask, WrappedPhaseMap};

    type TestBackend = NdArray<f32>;

    fn dataset() -> SyntheticPhaseDataset {
        SyntheticPhaseDataset::new(SyntheticConfig::new(GridShape::new(8, 8), 6, 2).with_seed(3)).unwrap()
    }

    #[test]
    fn test_sampler_is_deterministic_and_covers_dataset() {
        let mut a = BatchSampler::new(5, 11);
        let mut b = BatchSampler::new(5, 11);
        let first = a.next_indices(5);
        assert_eq!(first, b.next_indices(5));

        let mut sorted = first.clone();
        sorted.sort();
        assert_eq!(sorted, vec![0, 1, 2, 3, 4], "one pass visits every index once");

        assert_eq!(a.next_indices(7).len(), 7);
        assert!(BatchSampler::new(0, 1).next_indices(4).is_empty());
    }

    #[test]
    fn test_collate_one_step() {
        let device = Default::default();
        let ds = dataset();
        let samples = vec![ds.get(0).unwrap(), ds.get(1).unwrap()];
        let batch = collate::<TestBackend>(&samples, &UnwrapConfig::one_step(), &device).unwrap();
        assert_eq!(batch.inputs.dims(), [2, 1, 8, 8]);
        assert_eq!(batch.unwrapped.dims(), [2, 8, 8]);
        assert!(batch.wrap_counts.is_none());
        assert_eq!(batch.batch_size(), 2);
    }

    #[test]
    fn test_collate_two_step_derives_counts() {
        let device = Default::default();
        let ds = dataset();
        let samples = vec![ds.get(2).unwrap()];
        let batch = collate::<TestBackend>(&samples, &UnwrapConfig::two_step(2), &device).unwrap();
        let counts = int_tensor_to_vec(batch.wrap_counts.unwrap());
        let expected = samples[0].wrap_count_truth(2).unwrap();
        let expected: Vec<i64> = expected.counts().iter().map(|&k| k as i64).collect();
        assert_eq!(counts, expected);
    }

    #[test]
    fn test_collate_rejects_counts_beyond_bound() {
        let device = Default::default();
        let shape = GridShape::new(2, 2);
        let truth = vec![0.0_f32, 20.0, 0.0, 0.0];
        let sample = TrainingSample::from_unwrapped(
            PhaseInput::new(WrappedPhaseMap::from_unwrapped(shape, &truth).unwrap()),
            UnwrappedPhaseMap::new(shape, truth).unwrap(),
        )
        .unwrap();
        let err = collate::<TestBackend>(&[sample], &UnwrapConfig::two_step(1), &device).unwrap_err();
        assert!(matches!(err, UnwrapError::Configuration { .. }), "{err}");
    }

    #[test]
    fn test_collate_masks_non_finite_truth() {
        let device = Default::default();
        let shape = GridShape::new(2, 2);
        let wrapped = WrappedPhaseMap::new(shape, vec![0.1, 0.2, 0.3, 0.4]).unwrap();
        let mask = ValidityMask::new(shape, vec![true, true, false, true]).unwrap();
        let input = PhaseInput::new(wrapped).with_mask(mask).unwrap();
        let sample = TrainingSample::from_unwrapped(
            input,
            UnwrappedPhaseMap::new(shape, vec![0.1, 0.2, f32::NAN, 0.4]).unwrap(),
        )
        .unwrap();
        let batch = collate::<TestBackend>(&[sample], &UnwrapConfig::two_step(1), &device).unwrap();
        assert_eq!(tensor_to_vec(batch.unwrapped), vec![0.1, 0.2, 0.0, 0.4]);
        assert_eq!(tensor_to_vec(batch.valid), vec![1.0, 1.0, 0.0, 1.0]);
    }

    #[test]
    fn test_collate_channel_mismatch() {
        let device = Default::default();
        let samples = vec![dataset().get(0).unwrap()];
        let config = UnwrapConfig {
            in_channels: 2,
            ..UnwrapConfig::one_step()
        };
        let err = collate::<TestBackend>(&samples, &config, &device).unwrap_err();
        assert!(matches!(err, UnwrapError::Shape { .. }), "{err}");
    }
}
