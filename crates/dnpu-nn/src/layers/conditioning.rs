// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use dnpu_core::error::{Error, Result};
use ndarray::{Array1, Array2};
use std::cell::{Cell, RefCell};

use crate::module::{Module, Parameter};

/// Channel count every conditioning stage operates on: one per device of the
/// upstream layer.
const CHANNELS: usize = 2;

/// Peak-to-peak voltage swing the downstream device accepts. Fixed hardware
/// calibration, not learned.
const VOLTAGE_SWING: f32 = 1.8;

/// Floor applied to the running variance before its reciprocal square root
/// is formed.
pub const MIN_VARIANCE: f32 = 1e-6;

pub const DEFAULT_MOMENTUM: f32 = 0.1;
pub const DEFAULT_EPSILON: f32 = 1e-5;

/// Running-statistics normalization fused with the current-to-voltage remap.
///
/// Training-mode forwards normalize with fresh batch statistics and fold them
/// into the exponential running estimates; evaluation-mode forwards use the
/// frozen running estimates only. The conversion bound is always derived from
/// the *running* standard deviation, never the batch one: the physical
/// dynamic range of a device does not depend on the composition of the
/// current mini-batch.
///
/// Per channel `c` the remap is
/// `voltage = (1.8 / (4·std[c])) · clamp(normed, ±2·std[c]) + offset`
/// with `std[c] = sqrt(running_var[c])`.
#[derive(Debug)]
pub struct CurrentToVoltage {
    momentum: f32,
    epsilon: f32,
    conversion_offset: f32,
    running_mean: RefCell<Array1<f32>>,
    running_var: RefCell<Array1<f32>>,
    training: Cell<bool>,
    last_inv_std: RefCell<Option<Array1<f32>>>,
    last_normed: RefCell<Option<Array2<f32>>>,
    last_cut: RefCell<Option<Array1<f32>>>,
    last_gain: RefCell<Option<Array1<f32>>>,
}

impl CurrentToVoltage {
    pub fn new(momentum: f32, epsilon: f32, conversion_offset: f32) -> Result<Self> {
        if !(0.0..=1.0).contains(&momentum) || !momentum.is_finite() {
            return Err(Error::InvalidValue {
                label: "conversion_momentum",
            });
        }
        if epsilon <= 0.0 || !epsilon.is_finite() {
            return Err(Error::NonFiniteValue {
                label: "conversion_epsilon",
                value: epsilon,
            });
        }
        if !conversion_offset.is_finite() {
            return Err(Error::NonFiniteValue {
                label: "conversion_offset",
                value: conversion_offset,
            });
        }
        Ok(Self {
            momentum,
            epsilon,
            conversion_offset,
            running_mean: RefCell::new(Array1::zeros(CHANNELS)),
            running_var: RefCell::new(Array1::ones(CHANNELS)),
            training: Cell::new(true),
            last_inv_std: RefCell::new(None),
            last_normed: RefCell::new(None),
            last_cut: RefCell::new(None),
            last_gain: RefCell::new(None),
        })
    }

    /// Stage with the usual batch-norm momentum and epsilon.
    pub fn with_defaults(conversion_offset: f32) -> Result<Self> {
        Self::new(DEFAULT_MOMENTUM, DEFAULT_EPSILON, conversion_offset)
    }

    pub fn momentum(&self) -> f32 {
        self.momentum
    }

    pub fn epsilon(&self) -> f32 {
        self.epsilon
    }

    pub fn conversion_offset(&self) -> f32 {
        self.conversion_offset
    }

    /// Enables or disables training mode.
    pub fn set_training(&self, training: bool) {
        self.training.set(training);
    }

    pub fn is_training(&self) -> bool {
        self.training.get()
    }

    /// Snapshot of the running per-channel mean.
    pub fn running_mean(&self) -> Array1<f32> {
        self.running_mean.borrow().clone()
    }

    /// Snapshot of the running per-channel variance.
    pub fn running_variance(&self) -> Array1<f32> {
        self.running_var.borrow().clone()
    }

    /// Normalized activations of the most recent forward pass, kept for the
    /// trace sink and the backward pass.
    pub fn last_normalized(&self) -> Option<Array2<f32>> {
        self.last_normed.borrow().clone()
    }

    /// Restores the untrained state: mean zero, variance one, no caches.
    pub fn reset(&self) {
        *self.running_mean.borrow_mut() = Array1::zeros(CHANNELS);
        *self.running_var.borrow_mut() = Array1::ones(CHANNELS);
        self.last_inv_std.borrow_mut().take();
        self.last_normed.borrow_mut().take();
        self.last_cut.borrow_mut().take();
        self.last_gain.borrow_mut().take();
    }

    fn guard_input(&self, input: &Array2<f32>) -> Result<()> {
        let (rows, cols) = input.dim();
        if cols != CHANNELS {
            return Err(Error::ShapeMismatch {
                expected: (rows, CHANNELS),
                got: (rows, cols),
            });
        }
        if rows == 0 {
            return Err(Error::EmptyInput("current_to_voltage"));
        }
        Ok(())
    }

    fn compute_stats(&self, input: &Array2<f32>) -> (Array1<f32>, Array1<f32>) {
        let (batch, channels) = input.dim();
        let scale = 1.0 / batch as f32;
        let mut mean = Array1::zeros(channels);
        for row in 0..batch {
            for channel in 0..channels {
                mean[channel] += input[[row, channel]];
            }
        }
        mean.mapv_inplace(|v| v * scale);
        let mut variance = Array1::zeros(channels);
        for row in 0..batch {
            for channel in 0..channels {
                let centered = input[[row, channel]] - mean[channel];
                variance[channel] += centered * centered;
            }
        }
        variance.mapv_inplace(|v| v * scale);
        (mean, variance)
    }

    /// Per-channel conversion std from the running variance, floored at
    /// [`MIN_VARIANCE`]. A negative estimate cannot come from valid updates
    /// and is reported rather than silently squashed.
    fn conversion_std(&self) -> Result<Array1<f32>> {
        let running_var = self.running_var.borrow();
        let mut std = Array1::zeros(CHANNELS);
        for channel in 0..CHANNELS {
            let variance = running_var[channel];
            if variance < 0.0 {
                return Err(Error::DegenerateVariance { channel, variance });
            }
            if variance < MIN_VARIANCE {
                tracing::warn!(
                    channel,
                    variance,
                    floor = MIN_VARIANCE,
                    "running variance below floor; conversion bound clamped"
                );
            }
            std[channel] = variance.max(MIN_VARIANCE).sqrt();
        }
        Ok(std)
    }
}

impl Module for CurrentToVoltage {
    fn forward(&self, input: &Array2<f32>) -> Result<Array2<f32>> {
        self.guard_input(input)?;
        let (batch, channels) = input.dim();

        let (mean, inv_std) = if self.training.get() {
            let (mean, variance) = self.compute_stats(input);
            {
                let mut running_mean = self.running_mean.borrow_mut();
                let mut running_var = self.running_var.borrow_mut();
                for channel in 0..channels {
                    running_mean[channel] = self.momentum * mean[channel]
                        + (1.0 - self.momentum) * running_mean[channel];
                    running_var[channel] = self.momentum * variance[channel]
                        + (1.0 - self.momentum) * running_var[channel];
                }
            }
            let inv_std = variance.mapv(|v| 1.0 / (v + self.epsilon).sqrt());
            (mean, inv_std)
        } else {
            let mean = self.running_mean.borrow().clone();
            let inv_std = self
                .running_var
                .borrow()
                .mapv(|v| 1.0 / (v + self.epsilon).sqrt());
            (mean, inv_std)
        };

        let mut normed = Array2::zeros((batch, channels));
        for row in 0..batch {
            for channel in 0..channels {
                normed[[row, channel]] = (input[[row, channel]] - mean[channel]) * inv_std[channel];
            }
        }

        // The conversion bound always comes from the running estimate, which
        // at this point already folded in the current batch.
        let std = self.conversion_std()?;
        let cut = std.mapv(|s| 2.0 * s);
        let gain = std.mapv(|s| VOLTAGE_SWING / (4.0 * s));

        let mut output = Array2::zeros((batch, channels));
        for row in 0..batch {
            for channel in 0..channels {
                let bounded = normed[[row, channel]].clamp(-cut[channel], cut[channel]);
                output[[row, channel]] = gain[channel] * bounded + self.conversion_offset;
            }
        }

        *self.last_inv_std.borrow_mut() = Some(inv_std);
        *self.last_normed.borrow_mut() = Some(normed);
        *self.last_cut.borrow_mut() = Some(cut);
        *self.last_gain.borrow_mut() = Some(gain);

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
        let (batch, channels) = input.dim();

        if !self.training.get() {
            // Evaluation mode is a fixed per-channel affine with a clamp, so
            // the gradient needs no cached batch statistics.
            let mean = self.running_mean.borrow().clone();
            let inv_std = self
                .running_var
                .borrow()
                .mapv(|v| 1.0 / (v + self.epsilon).sqrt());
            let std = self.conversion_std()?;
            let mut grad_input = Array2::zeros((batch, channels));
            for row in 0..batch {
                for channel in 0..channels {
                    let normed =
                        (input[[row, channel]] - mean[channel]) * inv_std[channel];
                    let cut = 2.0 * std[channel];
                    let gain = VOLTAGE_SWING / (4.0 * std[channel]);
                    let inside = if normed.abs() <= cut { 1.0 } else { 0.0 };
                    grad_input[[row, channel]] =
                        grad_output[[row, channel]] * gain * inside * inv_std[channel];
                }
            }
            return Ok(grad_input);
        }

        let inv_std = self
            .last_inv_std
            .borrow()
            .clone()
            .ok_or(Error::MissingStatistics {
                label: "conversion_inv_std",
            })?;
        let normed = self
            .last_normed
            .borrow()
            .clone()
            .ok_or(Error::MissingStatistics {
                label: "conversion_normed",
            })?;
        let cut = self
            .last_cut
            .borrow()
            .clone()
            .ok_or(Error::MissingStatistics {
                label: "conversion_cut",
            })?;
        let gain = self
            .last_gain
            .borrow()
            .clone()
            .ok_or(Error::MissingStatistics {
                label: "conversion_gain",
            })?;
        if normed.dim() != input.dim() {
            return Err(Error::ShapeMismatch {
                expected: normed.dim(),
                got: input.dim(),
            });
        }

        // Chain the clamp subgradient and the conversion gain, then the
        // standard batch-norm input gradient. The running std inside the gain
        // is a buffer, not a function of the batch being differentiated.
        let mut grad_input = Array2::zeros((batch, channels));
        for channel in 0..channels {
            let mut sum_grad = 0.0f32;
            let mut sum_grad_norm = 0.0f32;
            let mut grad_normed = vec![0.0f32; batch];
            for row in 0..batch {
                let inside = if normed[[row, channel]].abs() <= cut[channel] {
                    1.0
                } else {
                    0.0
                };
                let g = grad_output[[row, channel]] * gain[channel] * inside;
                grad_normed[row] = g;
                sum_grad += g;
                sum_grad_norm += g * normed[[row, channel]];
            }
            for row in 0..batch {
                let term = (batch as f32 * grad_normed[row]
                    - sum_grad
                    - normed[[row, channel]] * sum_grad_norm)
                    / batch as f32;
                grad_input[[row, channel]] = term * inv_std[channel];
            }
        }
        Ok(grad_input)
    }

    fn visit_parameters(&self, _visitor: &mut dyn FnMut(&Parameter) -> Result<()>) -> Result<()> {
        Ok(())
    }

    fn visit_parameters_mut(
        &mut self,
        _visitor: &mut dyn FnMut(&mut Parameter) -> Result<()>,
    ) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn demo_input() -> Array2<f32> {
        array![[0.5, 1.0], [1.5, -0.5], [-1.0, 0.2], [0.0, -1.2]]
    }

    #[test]
    fn training_forward_normalizes_each_channel() {
        let stage = CurrentToVoltage::with_defaults(-0.6).unwrap();
        let _ = stage.forward(&demo_input()).unwrap();
        let normed = stage.last_normalized().unwrap();
        for channel in 0..2 {
            let mut mean = 0.0f32;
            let mut var = 0.0f32;
            for row in 0..4 {
                mean += normed[[row, channel]];
                var += normed[[row, channel]] * normed[[row, channel]];
            }
            mean /= 4.0;
            var /= 4.0;
            assert!(mean.abs() < 1e-4);
            assert!((var - 1.0).abs() < 1e-3);
        }
    }

    #[test]
    fn training_forward_updates_running_statistics() {
        let stage = CurrentToVoltage::with_defaults(0.0).unwrap();
        let input = demo_input();
        let (batch_mean, batch_var) = stage.compute_stats(&input);
        let _ = stage.forward(&input).unwrap();
        let running_mean = stage.running_mean();
        let running_var = stage.running_variance();
        for channel in 0..2 {
            let expected_mean = 0.1 * batch_mean[channel];
            let expected_var = 0.1 * batch_var[channel] + 0.9;
            assert!((running_mean[channel] - expected_mean).abs() < 1e-6);
            assert!((running_var[channel] - expected_var).abs() < 1e-6);
        }
    }

    #[test]
    fn evaluation_forward_is_bit_identical_and_frozen() {
        let stage = CurrentToVoltage::with_defaults(-0.6).unwrap();
        let _ = stage.forward(&demo_input()).unwrap();
        stage.set_training(false);
        let frozen_mean = stage.running_mean();
        let input = array![[0.3, -0.4], [0.9, 0.1]];
        let first = stage.forward(&input).unwrap();
        let second = stage.forward(&input).unwrap();
        assert_eq!(first, second);
        assert_eq!(stage.running_mean(), frozen_mean);
    }

    #[test]
    fn conversion_formula_matches_hand_computation() {
        let stage = CurrentToVoltage::with_defaults(-0.6).unwrap();
        stage.set_training(false);
        // Fresh running stats: mean 0, var 1, so std = 1, cut = 2, gain = 0.45.
        let input = array![[0.0, 10.0]];
        let output = stage.forward(&input).unwrap();
        let inv_std = 1.0f32 / (1.0f32 + DEFAULT_EPSILON).sqrt();
        let expected_0 = -0.6;
        let expected_1 = 1.8 / 4.0 * (10.0 * inv_std).min(2.0) - 0.6;
        assert!((output[[0, 0]] - expected_0).abs() < 1e-6);
        assert!((output[[0, 1]] - expected_1).abs() < 1e-6);
    }

    #[test]
    fn zero_running_variance_is_floored_not_nan() {
        let stage = CurrentToVoltage::with_defaults(0.0).unwrap();
        stage.running_var.borrow_mut().fill(0.0);
        stage.set_training(false);
        let output = stage.forward(&array![[0.5, -0.5]]).unwrap();
        for &value in output.iter() {
            assert!(value.is_finite());
        }
    }

    #[test]
    fn negative_running_variance_is_reported() {
        let stage = CurrentToVoltage::with_defaults(0.0).unwrap();
        stage.running_var.borrow_mut()[0] = -1.0;
        stage.set_training(false);
        assert!(matches!(
            stage.forward(&array![[0.5, -0.5]]),
            Err(Error::DegenerateVariance { channel: 0, .. })
        ));
    }

    #[test]
    fn backward_without_forward_is_rejected() {
        let mut stage = CurrentToVoltage::with_defaults(0.0).unwrap();
        let input = array![[0.1, 0.2]];
        let grad = array![[1.0, 1.0]];
        assert!(matches!(
            stage.backward(&input, &grad),
            Err(Error::MissingStatistics { .. })
        ));
    }

    #[test]
    fn training_backward_gradients_sum_to_zero_per_channel() {
        let mut stage = CurrentToVoltage::with_defaults(-0.6).unwrap();
        let input = demo_input();
        let _ = stage.forward(&input).unwrap();
        let grad_out = array![[0.2, -0.1], [0.05, 0.3], [-0.4, 0.6], [0.1, -0.2]];
        let grad_input = stage.backward(&input, &grad_out).unwrap();
        for channel in 0..2 {
            let column_sum: f32 = (0..4).map(|row| grad_input[[row, channel]]).sum();
            assert!(column_sum.abs() < 1e-4);
        }
    }

    #[test]
    fn evaluation_backward_matches_numeric_gradients() {
        let stage = CurrentToVoltage::with_defaults(-0.6).unwrap();
        // Warm the running statistics with one training batch, then freeze.
        let _ = stage.forward(&demo_input()).unwrap();
        stage.set_training(false);

        let input = array![[0.3, -0.6], [1.2, 0.4]];
        let grad_output = array![[0.2, -0.1], [0.05, 0.3]];
        let mut stage = stage;
        let grad_input = stage.backward(&input, &grad_output).unwrap();

        let eps = 1e-3;
        let loss = |stage: &CurrentToVoltage, input: &Array2<f32>| -> f32 {
            let output = stage.forward(input).unwrap();
            output
                .iter()
                .zip(grad_output.iter())
                .map(|(o, g)| o * g)
                .sum()
        };
        for row in 0..2 {
            for channel in 0..2 {
                let mut plus = input.clone();
                plus[[row, channel]] += eps;
                let mut minus = input.clone();
                minus[[row, channel]] -= eps;
                let numeric = (loss(&stage, &plus) - loss(&stage, &minus)) / (2.0 * eps);
                assert!((grad_input[[row, channel]] - numeric).abs() < 1e-3);
            }
        }
    }

    #[test]
    fn reset_restores_untrained_statistics() {
        let stage = CurrentToVoltage::with_defaults(0.0).unwrap();
        let _ = stage.forward(&demo_input()).unwrap();
        stage.reset();
        assert_eq!(stage.running_mean(), Array1::<f32>::zeros(2));
        assert_eq!(stage.running_variance(), Array1::<f32>::ones(2));
        assert!(stage.last_normalized().is_none());
    }
}
