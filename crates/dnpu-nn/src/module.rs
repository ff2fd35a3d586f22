// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use dnpu_core::error::{Error, Result};
use ndarray::Array2;

/// Trainable tensor with a local Euclidean gradient accumulator.
pub struct Parameter {
    name: String,
    value: Array2<f32>,
    gradient: Option<Array2<f32>>,
}

impl core::fmt::Debug for Parameter {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let (rows, cols) = self.value.dim();
        write!(
            f,
            "Parameter(name={},shape=({},{}),has_grad={})",
            self.name,
            rows,
            cols,
            self.gradient.is_some()
        )
    }
}

impl Parameter {
    /// Creates a new parameter with the provided tensor value.
    pub fn new(name: impl Into<String>, value: Array2<f32>) -> Self {
        Self {
            name: name.into(),
            value,
            gradient: None,
        }
    }

    /// Returns the identifier assigned to the parameter.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Provides an immutable view into the underlying tensor value.
    pub fn value(&self) -> &Array2<f32> {
        &self.value
    }

    /// Provides a mutable view into the underlying tensor value.
    pub fn value_mut(&mut self) -> &mut Array2<f32> {
        &mut self.value
    }

    /// Returns the currently accumulated gradient, if any.
    pub fn gradient(&self) -> Option<&Array2<f32>> {
        self.gradient.as_ref()
    }

    fn assert_shape(&self, tensor: &Array2<f32>) -> Result<()> {
        if self.value.dim() != tensor.dim() {
            return Err(Error::ShapeMismatch {
                expected: self.value.dim(),
                got: tensor.dim(),
            });
        }
        Ok(())
    }

    /// Adds an update into the local gradient buffer.
    pub fn accumulate(&mut self, update: &Array2<f32>) -> Result<()> {
        self.assert_shape(update)?;
        match self.gradient.as_mut() {
            Some(existing) => *existing += update,
            None => self.gradient = Some(update.clone()),
        }
        Ok(())
    }

    /// Clears the accumulated gradient.
    pub fn zero_gradient(&mut self) {
        if let Some(grad) = self.gradient.as_mut() {
            grad.fill(0.0);
        }
    }

    /// Applies the accumulated update with the supplied learning rate and
    /// clears the accumulator.
    pub fn apply_step(&mut self, learning_rate: f32) -> Result<()> {
        if let Some(grad) = self.gradient.as_mut() {
            self.value.scaled_add(-learning_rate, grad);
            grad.fill(0.0);
        }
        Ok(())
    }
}

/// High-level module trait inspired by PyTorch's `nn.Module` but expressed in
/// pure Rust over `ndarray` buffers.
pub trait Module {
    /// Runs a forward pass.
    fn forward(&self, input: &Array2<f32>) -> Result<Array2<f32>>;

    /// Propagates a gradient backwards. Implementations populate the
    /// relevant parameter accumulators before returning the gradient with
    /// respect to `input`.
    fn backward(&mut self, input: &Array2<f32>, grad_output: &Array2<f32>) -> Result<Array2<f32>>;

    /// Visits immutable parameters.
    fn visit_parameters(&self, visitor: &mut dyn FnMut(&Parameter) -> Result<()>) -> Result<()>;

    /// Visits mutable parameters.
    fn visit_parameters_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut Parameter) -> Result<()>,
    ) -> Result<()>;

    /// Applies every parameter update.
    fn apply_step(&mut self, learning_rate: f32) -> Result<()> {
        self.visit_parameters_mut(&mut |param| param.apply_step(learning_rate))
    }

    /// Clears accumulators across every parameter.
    fn zero_accumulators(&mut self) -> Result<()> {
        self.visit_parameters_mut(&mut |param| {
            param.zero_gradient();
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn accumulate_sums_updates() {
        let mut param = Parameter::new("gate", Array2::zeros((1, 2)));
        param.accumulate(&array![[1.0, -0.5]]).unwrap();
        param.accumulate(&array![[0.5, 0.5]]).unwrap();
        assert_eq!(param.gradient().unwrap(), &array![[1.5, 0.0]]);
    }

    #[test]
    fn accumulate_rejects_shape_mismatch() {
        let mut param = Parameter::new("gate", Array2::zeros((1, 2)));
        let err = param.accumulate(&Array2::zeros((2, 2)));
        assert!(matches!(err, Err(Error::ShapeMismatch { .. })));
    }

    #[test]
    fn apply_step_descends_and_clears() {
        let mut param = Parameter::new("gate", array![[1.0, 1.0]]);
        param.accumulate(&array![[2.0, -2.0]]).unwrap();
        param.apply_step(0.5).unwrap();
        assert_eq!(param.value(), &array![[0.0, 2.0]]);
        assert_eq!(param.gradient().unwrap(), &array![[0.0, 0.0]]);
    }
}
