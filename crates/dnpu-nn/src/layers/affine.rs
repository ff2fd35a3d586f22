// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use dnpu_core::config::BoundRange;
use dnpu_core::error::{Error, Result};
use ndarray::Array2;
use rand::{rngs::StdRng, Rng};

use crate::module::{Module, Parameter};

/// Width of the electrode pair every graph input carries.
const INPUT_WIDTH: usize = 2;

/// Learnable affine conditioning of the raw graph input.
///
/// Computes `scale * x + offset` with a scalar scale broadcast across both
/// input dimensions and a length-2 offset broadcast across the batch. Both
/// parameters are drawn uniformly from their configured ranges; the
/// degenerate `[1.0, 1.0]` scale range freezes the scale at exactly `1.0`
/// and keeps it out of the trainable set.
#[derive(Debug)]
pub struct InputAffine {
    offset: Parameter,
    scale: Option<Parameter>,
    offset_range: BoundRange,
    scale_range: BoundRange,
}

fn sample_offset(range: &BoundRange, rng: &mut StdRng) -> Array2<f32> {
    Array2::from_shape_fn((1, INPUT_WIDTH), |_| rng.gen_range(range.min..=range.max))
}

fn sample_scale(range: &BoundRange, rng: &mut StdRng) -> Option<Parameter> {
    if range.is_frozen_unit() {
        return None;
    }
    let value = Array2::from_elem((1, 1), rng.gen_range(range.min..=range.max));
    Some(Parameter::new("input_affine::scale", value))
}

/// Soft linear penalty for leaving a closed range.
fn range_penalty(value: f32, range: &BoundRange) -> f32 {
    (range.min - value).max(0.0) + (value - range.max).max(0.0)
}

/// Subgradient of [`range_penalty`]: -1 below the range, +1 above, 0 inside.
fn range_penalty_slope(value: f32, range: &BoundRange) -> f32 {
    if value < range.min {
        -1.0
    } else if value > range.max {
        1.0
    } else {
        0.0
    }
}

impl InputAffine {
    pub fn new(offset_range: BoundRange, scale_range: BoundRange, rng: &mut StdRng) -> Result<Self> {
        offset_range.validate("offset")?;
        scale_range.validate("scale")?;
        Ok(Self {
            offset: Parameter::new("input_affine::offset", sample_offset(&offset_range, rng)),
            scale: sample_scale(&scale_range, rng),
            offset_range,
            scale_range,
        })
    }

    /// Current offset values, shape `(1, 2)`.
    pub fn offset_value(&self) -> &Array2<f32> {
        self.offset.value()
    }

    /// Current scalar scale; exactly `1.0` when frozen.
    pub fn scale_value(&self) -> f32 {
        match &self.scale {
            Some(param) => param.value()[[0, 0]],
            None => 1.0,
        }
    }

    /// Whether the degenerate scale range froze the scale.
    pub fn is_scale_frozen(&self) -> bool {
        self.scale.is_none()
    }

    /// Soft penalty for offset values outside the configured range. Zero iff
    /// both components lie inside.
    pub fn offset_penalty(&self) -> f32 {
        self.offset
            .value()
            .iter()
            .map(|&value| range_penalty(value, &self.offset_range))
            .sum()
    }

    /// Soft penalty for the scale leaving its configured range.
    pub fn scale_penalty(&self) -> f32 {
        range_penalty(self.scale_value(), &self.scale_range)
    }

    /// Accumulates the bound-penalty subgradients, weighted, into the
    /// parameter accumulators. The manual-gradient counterpart of adding the
    /// penalties to a loss term.
    pub fn accumulate_bound_penalty(&mut self, weight: f32) -> Result<()> {
        if !weight.is_finite() {
            return Err(Error::NonFiniteValue {
                label: "penalty_weight",
                value: weight,
            });
        }
        let offset_grad = self
            .offset
            .value()
            .mapv(|value| weight * range_penalty_slope(value, &self.offset_range));
        self.offset.accumulate(&offset_grad)?;
        let scale_range = self.scale_range;
        if let Some(scale) = self.scale.as_mut() {
            let slope = range_penalty_slope(scale.value()[[0, 0]], &scale_range);
            scale.accumulate(&Array2::from_elem((1, 1), weight * slope))?;
        }
        Ok(())
    }

    /// Re-samples the offset and reconstructs the scale by the construction
    /// rule. Accumulated gradients are discarded.
    pub fn reset(&mut self, rng: &mut StdRng) {
        self.offset = Parameter::new("input_affine::offset", sample_offset(&self.offset_range, rng));
        self.scale = sample_scale(&self.scale_range, rng);
    }

    fn guard_input(&self, input: &Array2<f32>) -> Result<()> {
        let (rows, cols) = input.dim();
        if cols != INPUT_WIDTH {
            return Err(Error::ShapeMismatch {
                expected: (rows, INPUT_WIDTH),
                got: (rows, cols),
            });
        }
        if rows == 0 {
            return Err(Error::EmptyInput("input_affine"));
        }
        Ok(())
    }
}

impl Module for InputAffine {
    fn forward(&self, input: &Array2<f32>) -> Result<Array2<f32>> {
        self.guard_input(input)?;
        let scale = self.scale_value();
        let offset = self.offset.value();
        let (rows, cols) = input.dim();
        let mut output = Array2::zeros((rows, cols));
        for row in 0..rows {
            for col in 0..cols {
                output[[row, col]] = scale * input[[row, col]] + offset[[0, col]];
            }
        }
        Ok(output)
    }

    fn backward(&mut self, input: &Array2<f32>, grad_output: &Array2<f32>) -> Result<Array2<f32>> {
        self.guard_input(input)?;
        if input.dim() != grad_output.dim() {
            return Err(Error::ShapeMismatch {
                expected: input.dim(),
                got: grad_output.dim(),
            });
        }
        let (rows, cols) = input.dim();
        let batch = rows as f32;
        let scale = self.scale_value();

        let mut grad_offset = Array2::zeros((1, cols));
        for row in 0..rows {
            for col in 0..cols {
                grad_offset[[0, col]] += grad_output[[row, col]];
            }
        }
        grad_offset.mapv_inplace(|v| v / batch);
        self.offset.accumulate(&grad_offset)?;

        if let Some(scale_param) = self.scale.as_mut() {
            let mut grad_scale = 0.0f32;
            for row in 0..rows {
                for col in 0..cols {
                    grad_scale += grad_output[[row, col]] * input[[row, col]];
                }
            }
            scale_param.accumulate(&Array2::from_elem((1, 1), grad_scale / batch))?;
        }

        Ok(grad_output.mapv(|v| v * scale))
    }

    fn visit_parameters(&self, visitor: &mut dyn FnMut(&Parameter) -> Result<()>) -> Result<()> {
        visitor(&self.offset)?;
        if let Some(scale) = self.scale.as_ref() {
            visitor(scale)?;
        }
        Ok(())
    }

    fn visit_parameters_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut Parameter) -> Result<()>,
    ) -> Result<()> {
        visitor(&mut self.offset)?;
        if let Some(scale) = self.scale.as_mut() {
            visitor(scale)?;
        }
        Ok(())
    }
}
