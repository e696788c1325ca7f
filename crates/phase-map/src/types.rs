//! Typed phase grids: wrapped input, wrap counts, unwrapped output, masks.
//!
//! All grids are row-major. A map type is a thin newtype over [`Grid`] so the
//! compiler keeps wrapped and unwrapped phase apart even though both store
//! `f32`.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Result, UnwrapError};
use crate::wrap::{wrap_phase, MAX_WRAP_COUNT, PHASE_TOLERANCE};

/// Height and width of a 2D grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GridShape {
    pub height: usize,
    pub width: usize,
}

impl GridShape {
    pub fn new(height: usize, width: usize) -> Self {
        Self { height, width }
    }

    /// Number of pixels.
    pub fn len(&self) -> usize {
        self.height * self.width
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Row-major index of `(row, col)`.
    pub fn index(&self, row: usize, col: usize) -> usize {
        row * self.width + col
    }

    /// `(row, col)` of a row-major index.
    pub fn position(&self, index: usize) -> (usize, usize) {
        (index / self.width, index % self.width)
    }
}

impl fmt::Display for GridShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.height, self.width)
    }
}

/// Row-major 2D grid with a checked shape.
#[derive(Debug, Clone, PartialEq)]
pub struct Grid<T> {
    shape: GridShape,
    data: Vec<T>,
}

impl<T: Copy> Grid<T> {
    /// Build a grid, failing if `data.len()` does not match the shape.
    pub fn new(shape: GridShape, data: Vec<T>) -> Result<Self> {
        if data.len() != shape.len() {
            return Err(UnwrapError::shape(
                "phase map",
                "data",
                format!("{} values for {shape}", shape.len()),
                format!("{} values", data.len()),
            ));
        }
        Ok(Self { shape, data })
    }

    pub fn filled(shape: GridShape, value: T) -> Self {
        Self {
            shape,
            data: vec![value; shape.len()],
        }
    }

    pub fn shape(&self) -> GridShape {
        self.shape
    }

    pub fn as_slice(&self) -> &[T] {
        &self.data
    }

    pub fn into_vec(self) -> Vec<T> {
        self.data
    }

    pub fn get(&self, row: usize, col: usize) -> T {
        self.data[self.shape.index(row, col)]
    }
}

/// Phase known only modulo 2pi, each value in (-pi, pi]. Immutable input.
#[derive(Debug, Clone, PartialEq)]
pub struct WrappedPhaseMap(Grid<f32>);

impl WrappedPhaseMap {
    /// Validate that every value lies in (-pi, pi] (within [`PHASE_TOLERANCE`]).
    ///
    /// Values on or just below -pi are stored as pi, and values just above pi
    /// are clamped to pi, so the stored map always lies in (-pi, pi].
    pub fn new(shape: GridShape, values: Vec<f32>) -> Result<Self> {
        use std::f32::consts::PI;

        let mut grid = Grid::new(shape, values)?;
        let limit = PI + PHASE_TOLERANCE;
        for (i, v) in grid.data.iter_mut().enumerate() {
            if !v.is_finite() || v.abs() > limit {
                let (row, col) = shape.position(i);
                return Err(UnwrapError::PhaseRange { row, col, value: *v });
            }
            if *v <= -PI || *v > PI {
                *v = PI;
            }
        }
        Ok(Self(grid))
    }

    /// Wrap arbitrary finite values into (-pi, pi].
    pub fn from_unwrapped(shape: GridShape, values: &[f32]) -> Result<Self> {
        let wrapped = values.iter().map(|&v| wrap_phase(v as f64) as f32).collect();
        Self::new(shape, wrapped)
    }

    pub fn shape(&self) -> GridShape {
        self.0.shape()
    }

    pub fn values(&self) -> &[f32] {
        self.0.as_slice()
    }

    pub fn get(&self, row: usize, col: usize) -> f32 {
        self.0.get(row, col)
    }
}

/// Absolute phase with the 2pi ambiguity resolved. Unbounded.
#[derive(Debug, Clone, PartialEq)]
pub struct UnwrappedPhaseMap(Grid<f32>);

impl UnwrappedPhaseMap {
    pub fn new(shape: GridShape, values: Vec<f32>) -> Result<Self> {
        Ok(Self(Grid::new(shape, values)?))
    }

    pub fn shape(&self) -> GridShape {
        self.0.shape()
    }

    pub fn values(&self) -> &[f32] {
        self.0.as_slice()
    }

    pub fn get(&self, row: usize, col: usize) -> f32 {
        self.0.get(row, col)
    }

    pub fn into_vec(self) -> Vec<f32> {
        self.0.into_vec()
    }
}

/// Integer multiple of 2pi per pixel, bounded by `[-max_count, max_count]`.
///
/// Masked pixels hold [`WrapCountMap::MASKED`].
#[derive(Debug, Clone, PartialEq)]
pub struct WrapCountMap {
    grid: Grid<i32>,
    max_count: u32,
}

impl WrapCountMap {
    /// Sentinel stored at pixels excluded by the validity mask.
    pub const MASKED: i32 = i32::MIN;

    /// Build a count map, rejecting counts outside `[-max_count, max_count]`
    /// and bounds above [`MAX_WRAP_COUNT`].
    pub fn new(shape: GridShape, counts: Vec<i32>, max_count: u32) -> Result<Self> {
        if max_count > MAX_WRAP_COUNT {
            return Err(UnwrapError::config(
                "max_wrap_count",
                format!("bound {max_count} exceeds the representable limit {MAX_WRAP_COUNT}"),
            ));
        }
        let grid = Grid::new(shape, counts)?;
        if let Some(&bad) = grid
            .as_slice()
            .iter()
            .find(|&&k| k != Self::MASKED && k.unsigned_abs() > max_count)
        {
            return Err(UnwrapError::config(
                "max_wrap_count",
                format!("wrap count {bad} exceeds configured bound {max_count}"),
            ));
        }
        Ok(Self { grid, max_count })
    }

    pub fn shape(&self) -> GridShape {
        self.grid.shape()
    }

    pub fn max_count(&self) -> u32 {
        self.max_count
    }

    /// Raw counts including [`WrapCountMap::MASKED`] sentinels.
    pub fn counts(&self) -> &[i32] {
        self.grid.as_slice()
    }

    /// Wrap count at `(row, col)`, `None` for masked pixels.
    pub fn get(&self, row: usize, col: usize) -> Option<i32> {
        match self.grid.get(row, col) {
            Self::MASKED => None,
            k => Some(k),
        }
    }

    /// Number of classes of the segmentation view: `2K + 1`.
    pub fn num_classes(&self) -> usize {
        2 * self.max_count as usize + 1
    }
}

/// Pixels that take part in loss, metrics and correctness guarantees.
///
/// `true` = valid. Excluded pixels (background, low coherence) are `false`.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidityMask(Grid<bool>);

impl ValidityMask {
    pub fn new(shape: GridShape, valid: Vec<bool>) -> Result<Self> {
        Ok(Self(Grid::new(shape, valid)?))
    }

    pub fn all_valid(shape: GridShape) -> Self {
        Self(Grid::filled(shape, true))
    }

    pub fn shape(&self) -> GridShape {
        self.0.shape()
    }

    pub fn as_slice(&self) -> &[bool] {
        self.0.as_slice()
    }

    pub fn is_valid(&self, row: usize, col: usize) -> bool {
        self.0.get(row, col)
    }

    pub fn num_valid(&self) -> usize {
        self.0.as_slice().iter().filter(|&&v| v).count()
    }
}

/// Per-pixel confidence in [0, 1] of a two-step prediction.
#[derive(Debug, Clone, PartialEq)]
pub struct ConfidenceMap(Grid<f32>);

impl ConfidenceMap {
    pub fn new(shape: GridShape, values: Vec<f32>) -> Result<Self> {
        Ok(Self(Grid::new(shape, values)?))
    }

    pub fn shape(&self) -> GridShape {
        self.0.shape()
    }

    pub fn values(&self) -> &[f32] {
        self.0.as_slice()
    }

    /// Mean confidence over valid pixels, `None` when nothing is valid.
    pub fn mean_over(&self, mask: &ValidityMask) -> Option<f32> {
        let (sum, n) = self
            .values()
            .iter()
            .zip(mask.as_slice())
            .filter(|(_, &valid)| valid)
            .fold((0.0_f64, 0usize), |(s, n), (&c, _)| (s + c as f64, n + 1));
        (n > 0).then(|| (sum / n as f64) as f32)
    }
}

/// An extra input channel stacked behind the wrapped phase (e.g. coherence).
#[derive(Debug, Clone, PartialEq)]
pub struct AuxiliaryChannel {
    pub name: String,
    pub values: Grid<f32>,
}

/// Network input: wrapped phase, optional auxiliary channels, validity mask.
#[derive(Debug, Clone, PartialEq)]
pub struct PhaseInput {
    pub wrapped: WrappedPhaseMap,
    pub auxiliary: Vec<AuxiliaryChannel>,
    pub mask: ValidityMask,
}

impl PhaseInput {
    /// Single-channel input with every pixel valid.
    pub fn new(wrapped: WrappedPhaseMap) -> Self {
        let mask = ValidityMask::all_valid(wrapped.shape());
        Self {
            wrapped,
            auxiliary: Vec::new(),
            mask,
        }
    }

    pub fn with_mask(mut self, mask: ValidityMask) -> Result<Self> {
        check_same_shape("validity mask", self.shape(), mask.shape())?;
        self.mask = mask;
        Ok(self)
    }

    pub fn with_auxiliary(mut self, name: impl Into<String>, values: Grid<f32>) -> Result<Self> {
        check_same_shape("auxiliary channel", self.shape(), values.shape())?;
        self.auxiliary.push(AuxiliaryChannel {
            name: name.into(),
            values,
        });
        Ok(self)
    }

    pub fn shape(&self) -> GridShape {
        self.wrapped.shape()
    }

    /// Wrapped phase plus auxiliary channels.
    pub fn num_channels(&self) -> usize {
        1 + self.auxiliary.len()
    }
}

/// Ground truth of a training sample: unwrapped phase and/or wrap counts.
#[derive(Debug, Clone, PartialEq)]
pub struct GroundTruth {
    pub unwrapped: Option<UnwrappedPhaseMap>,
    pub wrap_counts: Option<WrapCountMap>,
}

/// `{input, ground truth}` pair owned by a dataset, read-only to the core.
#[derive(Debug, Clone, PartialEq)]
pub struct TrainingSample {
    pub input: PhaseInput,
    pub truth: GroundTruth,
}

impl TrainingSample {
    /// Sample supervised by the unwrapped phase.
    pub fn from_unwrapped(input: PhaseInput, unwrapped: UnwrappedPhaseMap) -> Result<Self> {
        check_same_shape("ground truth", input.shape(), unwrapped.shape())?;
        Ok(Self {
            input,
            truth: GroundTruth {
                unwrapped: Some(unwrapped),
                wrap_counts: None,
            },
        })
    }

    /// Sample supervised by wrap counts only.
    pub fn from_wrap_counts(input: PhaseInput, wrap_counts: WrapCountMap) -> Result<Self> {
        check_same_shape("ground truth", input.shape(), wrap_counts.shape())?;
        Ok(Self {
            input,
            truth: GroundTruth {
                unwrapped: None,
                wrap_counts: Some(wrap_counts),
            },
        })
    }

    pub fn shape(&self) -> GridShape {
        self.input.shape()
    }

    pub fn mask(&self) -> &ValidityMask {
        &self.input.mask
    }

    /// Unwrapped ground truth, reconstructed from wrap counts when only those are given.
    pub fn unwrapped_truth(&self) -> Option<UnwrappedPhaseMap> {
        match (&self.truth.unwrapped, &self.truth.wrap_counts) {
            (Some(u), _) => Some(u.clone()),
            (None, Some(k)) => crate::wrap::reconstruct(&self.input.wrapped, k).ok(),
            (None, None) => None,
        }
    }

    /// Wrap-count ground truth, derived from the unwrapped truth when only that is given.
    pub fn wrap_count_truth(&self, max_count: u32) -> Result<WrapCountMap> {
        match (&self.truth.wrap_counts, &self.truth.unwrapped) {
            (Some(k), _) if k.max_count() <= max_count => {
                WrapCountMap::new(k.shape(), k.counts().to_vec(), max_count)
            }
            (Some(k), _) => Err(UnwrapError::config(
                "max_wrap_count",
                format!(
                    "sample labelled with bound {} but model bound is {max_count}",
                    k.max_count()
                ),
            )),
            (None, Some(u)) => {
                crate::wrap::derive_wrap_counts(&self.input.wrapped, u, &self.input.mask, max_count)
            }
            (None, None) => Err(UnwrapError::config(
                "ground_truth",
                "sample has neither unwrapped phase nor wrap counts",
            )),
        }
    }
}

fn check_same_shape(tensor: &'static str, expected: GridShape, actual: GridShape) -> Result<()> {
    if expected != actual {
        return Err(UnwrapError::shape("phase input", tensor, expected, actual));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f32::consts::PI;

    fn shape() -> GridShape {
        GridShape::new(2, 3)
    }

    #[test]
    fn test_grid_rejects_wrong_length() {
        let err = Grid::new(shape(), vec![0.0_f32; 5]).unwrap_err();
        assert!(matches!(err, UnwrapError::Shape { .. }), "{err}");
    }

    #[test]
    fn test_grid_index_and_position() {
        let s = shape();
        assert_eq!(s.index(1, 2), 5);
        assert_eq!(s.position(4), (1, 1));
        assert_eq!(s.to_string(), "2x3");
    }

    #[test]
    fn test_wrapped_rejects_out_of_range() {
        let err = WrappedPhaseMap::new(shape(), vec![0.0, 0.1, 4.0, 0.0, 0.0, 0.0]).unwrap_err();
        match err {
            UnwrapError::PhaseRange { row, col, value } => {
                assert_eq!((row, col), (0, 2));
                assert_eq!(value, 4.0);
            }
            other => panic!("unexpected error {other}"),
        }
    }

    #[test]
    fn test_wrapped_rejects_nan() {
        let err = WrappedPhaseMap::new(shape(), vec![f32::NAN; 6]).unwrap_err();
        assert!(matches!(err, UnwrapError::PhaseRange { .. }));
    }

    #[test]
    fn test_wrapped_accepts_pi_boundary() {
        let map = WrappedPhaseMap::new(shape(), vec![PI, -PI + 1e-3, 0.0, 1.0, -1.0, 3.0]);
        assert!(map.is_ok());
    }

    #[test]
    fn test_wrapped_stores_minus_pi_as_pi() {
        let map = WrappedPhaseMap::new(
            shape(),
            vec![-PI, -PI - 0.5 * PHASE_TOLERANCE, PI + 0.5 * PHASE_TOLERANCE, 0.0, 1.0, -1.0],
        )
        .unwrap();
        assert_eq!(&map.values()[..3], &[PI, PI, PI]);
        assert!(map.values().iter().all(|&v| v > -PI && v <= PI));
    }

    #[test]
    fn test_from_unwrapped_wraps_values() {
        let map = WrappedPhaseMap::from_unwrapped(shape(), &[0.0, 7.0, -7.0, 20.0, PI, -3.0])
            .unwrap();
        for &v in map.values() {
            assert!(v > -PI - PHASE_TOLERANCE && v <= PI + PHASE_TOLERANCE, "{v}");
        }
    }

    #[test]
    fn test_wrap_count_bound() {
        assert!(WrapCountMap::new(shape(), vec![0, 1, -2, 2, 0, 0], 2).is_ok());
        let err = WrapCountMap::new(shape(), vec![0, 3, 0, 0, 0, 0], 2).unwrap_err();
        assert!(matches!(err, UnwrapError::Configuration { .. }));
    }

    #[test]
    fn test_wrap_count_masked_sentinel() {
        let map = WrapCountMap::new(shape(), vec![0, WrapCountMap::MASKED, 1, 0, 0, 0], 1)
            .unwrap();
        assert_eq!(map.get(0, 1), None);
        assert_eq!(map.get(0, 2), Some(1));
        assert_eq!(map.num_classes(), 3);
    }

    #[test]
    fn test_phase_input_shape_checks() {
        let wrapped = WrappedPhaseMap::new(shape(), vec![0.0; 6]).unwrap();
        let input = PhaseInput::new(wrapped);
        let bad_mask = ValidityMask::all_valid(GridShape::new(3, 2));
        assert!(input.clone().with_mask(bad_mask).is_err());

        let aux = Grid::filled(shape(), 1.0_f32);
        let input = input.with_auxiliary("coherence", aux).unwrap();
        assert_eq!(input.num_channels(), 2);
    }

    #[test]
    fn test_confidence_mean_over_mask() {
        let conf = ConfidenceMap::new(shape(), vec![1.0, 0.0, 0.5, 0.5, 0.5, 0.5]).unwrap();
        let mask =
            ValidityMask::new(shape(), vec![true, false, true, false, false, false]).unwrap();
        let mean = conf.mean_over(&mask).unwrap();
        assert!((mean - 0.75).abs() < 1e-6);

        let none = ValidityMask::new(shape(), vec![false; 6]).unwrap();
        assert!(conf.mean_over(&none).is_none());
    }

    #[test]
    fn test_sample_derives_counts_from_unwrapped() {
        let truth = [0.0_f32, 7.0, -7.0, 13.0, 1.0, -1.0];
        let wrapped = WrappedPhaseMap::from_unwrapped(shape(), &truth).unwrap();
        let sample = TrainingSample::from_unwrapped(
            PhaseInput::new(wrapped),
            UnwrappedPhaseMap::new(shape(), truth.to_vec()).unwrap(),
        )
        .unwrap();

        let counts = sample.wrap_count_truth(3).unwrap();
        assert_eq!(counts.counts(), &[0, 1, -1, 2, 0, 0]);

        assert!(sample.wrap_count_truth(1).is_err(), "count 2 exceeds bound 1");
    }

    #[test]
    fn test_sample_without_truth_fails() {
        let wrapped = WrappedPhaseMap::new(shape(), vec![0.0; 6]).unwrap();
        let sample = TrainingSample {
            input: PhaseInput::new(wrapped),
            truth: GroundTruth {
                unwrapped: None,
                wrap_counts: None,
            },
        };
        assert!(sample.unwrapped_truth().is_none());
        assert!(sample.wrap_count_truth(2).is_err());
    }
}
