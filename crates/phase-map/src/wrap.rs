//! Modulo-2pi arithmetic: wrapping, exact reconstruction, congruence checks.

use std::f64::consts::{PI, TAU};

use crate::error::{Result, UnwrapError};
use crate::types::{UnwrappedPhaseMap, ValidityMask, WrapCountMap, WrappedPhaseMap};

/// Slack allowed on the (-pi, pi] bound after f32 rounding.
pub const PHASE_TOLERANCE: f32 = 1e-5;

/// Tolerance of the modulo-2pi invariant on unmasked pixels.
pub const CONGRUENCE_TOLERANCE: f64 = 1e-4;

/// Largest representable wrap count.
///
/// `|w + 2pi * k|` stays below 2048 up to this bound, where half an f32 ulp
/// (6.1e-5) is still inside [`CONGRUENCE_TOLERANCE`].
pub const MAX_WRAP_COUNT: u32 = 256;

/// Wrap `x` into (-pi, pi].
pub fn wrap_phase(x: f64) -> f64 {
    let r = (x + PI).rem_euclid(TAU) - PI;
    if r <= -PI {
        r + TAU
    } else {
        r
    }
}

/// `wrapped + 2pi * k` for every pixel; masked pixels keep the wrapped value.
///
/// Pure arithmetic with no learned component. The sum is formed in f64 and
/// rounded once, so the result stays congruent to the input for every count
/// up to [`MAX_WRAP_COUNT`].
pub fn reconstruct(wrapped: &WrappedPhaseMap, counts: &WrapCountMap) -> Result<UnwrappedPhaseMap> {
    if wrapped.shape() != counts.shape() {
        return Err(UnwrapError::shape(
            "reconstruction",
            "wrap counts",
            wrapped.shape(),
            counts.shape(),
        ));
    }
    let values = wrapped
        .values()
        .iter()
        .zip(counts.counts())
        .map(|(&w, &k)| match k {
            WrapCountMap::MASKED => w,
            k => (w as f64 + TAU * k as f64) as f32,
        })
        .collect();
    UnwrappedPhaseMap::new(wrapped.shape(), values)
}

/// Wrap counts `round((u - w) / 2pi)` for valid pixels.
///
/// Fails with a configuration error if any count exceeds `max_count`.
pub fn derive_wrap_counts(
    wrapped: &WrappedPhaseMap,
    unwrapped: &UnwrappedPhaseMap,
    mask: &ValidityMask,
    max_count: u32,
) -> Result<WrapCountMap> {
    let shape = wrapped.shape();
    for (tensor, other) in [("unwrapped", unwrapped.shape()), ("validity mask", mask.shape())] {
        if other != shape {
            return Err(UnwrapError::shape("wrap count derivation", tensor, shape, other));
        }
    }

    let mut counts = Vec::with_capacity(shape.len());
    for (i, ((&w, &u), &valid)) in wrapped
        .values()
        .iter()
        .zip(unwrapped.values())
        .zip(mask.as_slice())
        .enumerate()
    {
        if !valid {
            counts.push(WrapCountMap::MASKED);
            continue;
        }
        if !u.is_finite() {
            let (row, col) = shape.position(i);
            return Err(UnwrapError::config(
                "ground_truth",
                format!("non-finite unwrapped phase {u} at valid pixel ({row}, {col})"),
            ));
        }
        let k = ((u as f64 - w as f64) / TAU).round();
        if k.abs() > max_count as f64 {
            let (row, col) = shape.position(i);
            return Err(UnwrapError::config(
                "max_wrap_count",
                format!("wrap count {k} at pixel ({row}, {col}) exceeds configured bound {max_count}"),
            ));
        }
        counts.push(k as i32);
    }
    WrapCountMap::new(shape, counts, max_count)
}

/// Largest `|wrap(u - w)|` over valid pixels, 0 when nothing is valid.
pub fn congruence_residual(
    unwrapped: &UnwrappedPhaseMap,
    wrapped: &WrappedPhaseMap,
    mask: &ValidityMask,
) -> f64 {
    unwrapped
        .values()
        .iter()
        .zip(wrapped.values())
        .zip(mask.as_slice())
        .filter(|(_, &valid)| valid)
        .map(|((&u, &w), _)| wrap_phase(u as f64 - w as f64).abs())
        .fold(0.0, f64::max)
}

/// Whether `unwrapped` is congruent to `wrapped` on every valid pixel.
pub fn is_congruent(
    unwrapped: &UnwrappedPhaseMap,
    wrapped: &WrappedPhaseMap,
    mask: &ValidityMask,
) -> bool {
    congruence_residual(unwrapped, wrapped, mask) <= CONGRUENCE_TOLERANCE
}

/// Snap a free-form prediction onto the nearest value congruent with `wrapped`.
///
/// Returns the snapped map and the implied wrap counts. Masked pixels pass
/// the wrapped value through with a sentinel count. A valid pixel whose
/// prediction is not finite, or lies more than [`MAX_WRAP_COUNT`] turns
/// away, fails with [`UnwrapError::NumericInstability`].
pub fn snap_to_congruence(
    prediction: &[f32],
    wrapped: &WrappedPhaseMap,
    mask: &ValidityMask,
) -> Result<(UnwrappedPhaseMap, WrapCountMap)> {
    let shape = wrapped.shape();
    if prediction.len() != shape.len() {
        return Err(UnwrapError::shape(
            "congruence projection",
            "prediction",
            format!("{} values", shape.len()),
            format!("{} values", prediction.len()),
        ));
    }

    let mut counts = Vec::with_capacity(shape.len());
    let mut max_abs = 0u32;
    for (i, ((&p, &w), &valid)) in prediction
        .iter()
        .zip(wrapped.values())
        .zip(mask.as_slice())
        .enumerate()
    {
        if !valid {
            counts.push(WrapCountMap::MASKED);
            continue;
        }
        let k = ((p as f64 - w as f64) / TAU).round();
        if !k.is_finite() || k.abs() > MAX_WRAP_COUNT as f64 {
            let (row, col) = shape.position(i);
            return Err(UnwrapError::NumericInstability {
                stage: "congruence projection",
                step: 0,
                detail: format!(
                    "prediction {p} at pixel ({row}, {col}) is not within {MAX_WRAP_COUNT} wraps"
                ),
            });
        }
        let k = k as i32;
        max_abs = max_abs.max(k.unsigned_abs());
        counts.push(k);
    }
    let counts = WrapCountMap::new(shape, counts, max_abs)?;
    let unwrapped = reconstruct(wrapped, &counts)?;
    Ok((unwrapped, counts))
}
