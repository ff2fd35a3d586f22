// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use dnpu_core::error::{Error, Result};
use ndarray::Array2;

/// Clamps every element into `[-bound, bound]`.
///
/// Values exactly at the bound pass through unchanged; values beyond it are
/// replaced by the bound with the original sign.
pub fn hard_clip(input: &Array2<f32>, bound: f32) -> Array2<f32> {
    input.mapv(|value| value.clamp(-bound, bound))
}

/// Subgradient of [`hard_clip`]: 1 inside the bound (inclusive), 0 outside.
pub fn clip_subgradient_mask(input: &Array2<f32>, bound: f32) -> Array2<f32> {
    input.mapv(|value| if value.abs() <= bound { 1.0 } else { 0.0 })
}

/// Validates an amplification-derived clipping bound at construction time.
pub fn checked_bound(bound: f32, label: &'static str) -> Result<f32> {
    if !bound.is_finite() {
        return Err(Error::NonFiniteValue {
            label,
            value: bound,
        });
    }
    if bound <= 0.0 {
        return Err(Error::InvalidValue { label });
    }
    Ok(bound)
}
