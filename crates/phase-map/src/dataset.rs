//! Dataset boundary: where training samples come from.
//!
//! The core never loads files. It reads samples through [`PhaseDataset`];
//! acquisition, labelling and image formats live behind that trait. Two
//! implementations ship here: a plain in-memory list and a deterministic
//! synthetic generator of smooth phase surfaces used for tests and demos.

use std::f64::consts::TAU;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::error::{Result, UnwrapError};
use crate::types::{
    GridShape, PhaseInput, TrainingSample, UnwrappedPhaseMap, ValidityMask, WrappedPhaseMap,
};
use crate::wrap::MAX_WRAP_COUNT;

/// Random-access source of training samples.
pub trait PhaseDataset {
    /// Number of samples.
    fn len(&self) -> usize;

    /// Sample at `index`, `None` when out of range.
    fn get(&self, index: usize) -> Option<TrainingSample>;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Samples held in a `Vec`.
#[derive(Debug, Clone, Default)]
pub struct InMemoryDataset {
    samples: Vec<TrainingSample>,
}

impl InMemoryDataset {
    pub fn new(samples: Vec<TrainingSample>) -> Self {
        Self { samples }
    }

    pub fn push(&mut self, sample: TrainingSample) {
        self.samples.push(sample);
    }
}

impl PhaseDataset for InMemoryDataset {
    fn len(&self) -> usize {
        self.samples.len()
    }

    fn get(&self, index: usize) -> Option<TrainingSample> {
        self.samples.get(index).cloned()
    }
}

/// Parameters of [`SyntheticPhaseDataset`].
#[derive(Debug, Clone)]
pub struct SyntheticConfig {
    /// Grid size of every sample.
    pub shape: GridShape,
    /// Number of samples the dataset reports.
    pub num_samples: usize,
    /// Largest |wrap count| any generated pixel may need.
    pub max_wrap_count: u32,
    /// Upper bound on Gaussian bumps per surface (at least one is drawn).
    pub max_bumps: usize,
    /// Probability that a sample gets a masked rectangle.
    pub mask_probability: f64,
    /// Base seed. Sample `i` is generated from `(seed, i)` alone.
    pub seed: u64,
}

impl SyntheticConfig {
    pub fn new(shape: GridShape, num_samples: usize, max_wrap_count: u32) -> Self {
        Self {
            shape,
            num_samples,
            max_wrap_count,
            max_bumps: 4,
            mask_probability: 0.0,
            seed: 0,
        }
    }

    pub fn with_mask_probability(mut self, p: f64) -> Self {
        self.mask_probability = p;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }
}

/// Smooth random surfaces (Gaussian bumps plus a tilt), wrapped into (-pi, pi].
///
/// Surfaces are scaled so that no pixel needs more than `max_wrap_count`
/// turns. Generation is a pure function of `(seed, index)`.
#[derive(Debug, Clone)]
pub struct SyntheticPhaseDataset {
    config: SyntheticConfig,
}

impl SyntheticPhaseDataset {
    pub fn new(config: SyntheticConfig) -> Result<Self> {
        if config.shape.is_empty() {
            return Err(UnwrapError::shape(
                "synthetic dataset",
                "grid",
                "non-empty grid",
                config.shape,
            ));
        }
        if config.max_wrap_count == 0 {
            return Err(UnwrapError::config(
                "max_wrap_count",
                "synthetic surfaces need a bound of at least 1",
            ));
        }
        if config.max_wrap_count > MAX_WRAP_COUNT {
            return Err(UnwrapError::config(
                "max_wrap_count",
                format!("{} exceeds the limit {MAX_WRAP_COUNT}", config.max_wrap_count),
            ));
        }
        Ok(Self { config })
    }

    pub fn config(&self) -> &SyntheticConfig {
        &self.config
    }

    fn generate(&self, index: usize) -> Result<TrainingSample> {
        let cfg = &self.config;
        let mut rng = StdRng::seed_from_u64(
            cfg.seed
                .wrapping_mul(0x9E37_79B9_7F4A_7C15)
                .wrapping_add(index as u64),
        );
        let (h, w) = (cfg.shape.height, cfg.shape.width);

        let n_bumps = rng.gen_range(1..=cfg.max_bumps.max(1));
        let bumps: Vec<(f64, f64, f64, f64)> = (0..n_bumps)
            .map(|_| {
                let cy = rng.gen_range(0.0..h as f64);
                let cx = rng.gen_range(0.0..w as f64);
                let sigma = rng.gen_range(0.15..0.45) * h.max(w) as f64;
                let amp = rng.gen_range(-1.0..1.0);
                (cy, cx, sigma, amp)
            })
            .collect();
        let tilt_y = rng.gen_range(-0.5..0.5);
        let tilt_x = rng.gen_range(-0.5..0.5);

        let mut surface = Vec::with_capacity(cfg.shape.len());
        for row in 0..h {
            for col in 0..w {
                let (y, x) = (row as f64, col as f64);
                let mut v = tilt_y * y / h as f64 + tilt_x * x / w as f64;
                for &(cy, cx, sigma, amp) in &bumps {
                    let d2 = (y - cy).powi(2) + (x - cx).powi(2);
                    v += amp * (-d2 / (2.0 * sigma * sigma)).exp();
                }
                surface.push(v);
            }
        }

        let peak = surface.iter().fold(0.0_f64, |m, v| m.max(v.abs())).max(1e-9);
        let limit = TAU * cfg.max_wrap_count as f64;
        let scale = rng.gen_range(0.5..1.0) * limit / peak;
        let unwrapped: Vec<f32> = surface.iter().map(|v| (v * scale) as f32).collect();

        let wrapped = WrappedPhaseMap::from_unwrapped(cfg.shape, &unwrapped)?;
        let mut input = PhaseInput::new(wrapped);
        if rng.gen_bool(cfg.mask_probability.clamp(0.0, 1.0)) {
            input = input.with_mask(random_rect_mask(cfg.shape, &mut rng)?)?;
        }
        TrainingSample::from_unwrapped(input, UnwrappedPhaseMap::new(cfg.shape, unwrapped)?)
    }
}

/// Mask with one invalid rectangle covering at most a quarter of each side.
fn random_rect_mask(shape: GridShape, rng: &mut impl Rng) -> Result<ValidityMask> {
    let rh = rng.gen_range(1..=(shape.height / 4).max(1));
    let rw = rng.gen_range(1..=(shape.width / 4).max(1));
    let top = rng.gen_range(0..=shape.height - rh);
    let left = rng.gen_range(0..=shape.width - rw);
    let valid = (0..shape.len())
        .map(|i| {
            let (row, col) = shape.position(i);
            !(row >= top && row < top + rh && col >= left && col < left + rw)
        })
        .collect();
    ValidityMask::new(shape, valid)
}

impl PhaseDataset for SyntheticPhaseDataset {
    fn len(&self) -> usize {
        self.config.num_samples
    }

    fn get(&self, index: usize) -> Option<TrainingSample> {
        if index >= self.config.num_samples {
            return None;
        }
        self.generate(index).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wrap::{congruence_residual, CONGRUENCE_TOLERANCE};

    fn dataset(mask_probability: f64) -> SyntheticPhaseDataset {
        SyntheticPhaseDataset::new(
            SyntheticConfig::new(GridShape::new(16, 16), 8, 3)
                .with_seed(7)
                .with_mask_probability(mask_probability),
        )
        .unwrap()
    }

    #[test]
    fn test_len_and_out_of_range() {
        let ds = dataset(0.0);
        assert_eq!(ds.len(), 8);
        assert!(!ds.is_empty());
        assert!(ds.get(8).is_none());
    }

    #[test]
    fn test_generation_is_deterministic() {
        let ds = dataset(0.5);
        assert_eq!(ds.get(3), ds.get(3));
        assert_ne!(ds.get(3), ds.get(4));
    }

    #[test]
    fn test_samples_are_congruent_and_bounded() {
        let ds = dataset(0.0);
        for i in 0..ds.len() {
            let sample = ds.get(i).unwrap();
            let truth = sample.unwrapped_truth().unwrap();
            let residual = congruence_residual(&truth, &sample.input.wrapped, sample.mask());
            assert!(residual < CONGRUENCE_TOLERANCE, "sample {i}: residual {residual}");
            assert!(sample.wrap_count_truth(3).is_ok(), "sample {i} exceeds K=3");
        }
    }

    #[test]
    fn test_mask_probability_one_masks_pixels() {
        let ds = dataset(1.0);
        let sample = ds.get(0).unwrap();
        let mask = sample.mask();
        assert!(mask.num_valid() < mask.shape().len());
        assert!(mask.num_valid() > 0);
    }

    #[test]
    fn test_rejects_zero_bound() {
        let cfg = SyntheticConfig::new(GridShape::new(8, 8), 1, 0);
        assert!(matches!(
            SyntheticPhaseDataset::new(cfg),
            Err(UnwrapError::Configuration { .. })
        ));
    }

    #[test]
    fn test_rejects_bound_above_limit() {
        let cfg = SyntheticConfig::new(GridShape::new(8, 8), 1, MAX_WRAP_COUNT + 1);
        assert!(matches!(
            SyntheticPhaseDataset::new(cfg),
            Err(UnwrapError::Configuration { .. })
        ));
        let cfg = SyntheticConfig::new(GridShape::new(8, 8), 1, MAX_WRAP_COUNT);
        assert!(SyntheticPhaseDataset::new(cfg).is_ok());
    }

    #[test]
    fn test_in_memory_dataset() {
        let ds = dataset(0.0);
        let mut mem = InMemoryDataset::default();
        assert!(mem.is_empty());
        mem.push(ds.get(0).unwrap());
        assert_eq!(mem.len(), 1);
        assert_eq!(mem.get(0), ds.get(0));
    }
}
