// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use dnpu_core::error::{Error, Result};
use ndarray::{s, Array2};

use crate::layers::clip::{checked_bound, clip_subgradient_mask, hard_clip};
use crate::module::Module;

/// A trainable hardware-device surrogate.
///
/// The surrogate itself is an external collaborator; this trait is the seam
/// the multiplexing graphs compose against. A device consumes the full
/// electrode input `[batch, k]` and produces a single output current
/// `[batch, 1]`, exposes the amplification its readout chain applies (used
/// to derive the hardware-safe clipping bound), carries its own soft
/// control-voltage penalty, and can reinitialise its trainable state.
pub trait DeviceUnit: Module {
    /// Readout amplification, a strictly positive calibration scalar.
    fn amplification(&self) -> f32;

    /// Soft penalty keeping the device's control voltages in range.
    fn regularizer(&self) -> f32;

    /// Reinitialises the device's trainable state.
    fn reset(&mut self);

    /// The device's trainable tensor, for diagnostics. Devices are expected
    /// to expose exactly one.
    fn control_voltages(&self) -> Option<Array2<f32>> {
        let mut first = None;
        let _ = self.visit_parameters(&mut |param| {
            if first.is_none() {
                first = Some(param.value().clone());
            }
            Ok(())
        });
        first
    }
}

/// Checks a device honoured the single-output-channel contract.
pub(crate) fn guard_device_output(input: &Array2<f32>, output: &Array2<f32>) -> Result<()> {
    let (rows, _) = input.dim();
    let (out_rows, out_cols) = output.dim();
    if out_cols != 1 {
        return Err(Error::DeviceOutputWidth { channels: out_cols });
    }
    if out_rows != rows {
        return Err(Error::ShapeMismatch {
            expected: (rows, 1),
            got: (out_rows, out_cols),
        });
    }
    Ok(())
}

/// Two parallel devices consuming the same input.
///
/// Both raw output currents are clamped to the device's own
/// amplification-derived bound the moment they leave the surrogate; the
/// clamped pair forms the two channels handed to the conditioning stage.
/// Reference evaluation is sequential; the two device calls share no data.
pub struct DeviceLayer {
    device_a: Box<dyn DeviceUnit>,
    device_b: Box<dyn DeviceUnit>,
    bound_a: f32,
    bound_b: f32,
}

impl core::fmt::Debug for DeviceLayer {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "DeviceLayer(bound_a={},bound_b={})",
            self.bound_a, self.bound_b
        )
    }
}

/// Raw and clamped activations of one fan-out evaluation.
#[derive(Debug, Clone)]
pub struct FanOut {
    pub raw_a: Array2<f32>,
    pub raw_b: Array2<f32>,
    /// `[batch, 2]`: clamped channel pair.
    pub clamped: Array2<f32>,
}

impl DeviceLayer {
    /// Builds the fan-out stage, deriving each device's static clipping
    /// bound from the base multiplier and the device amplification.
    pub fn new(
        device_a: Box<dyn DeviceUnit>,
        device_b: Box<dyn DeviceUnit>,
        base_clipping_value: f32,
    ) -> Result<Self> {
        let bound_a = checked_bound(
            base_clipping_value * device_a.amplification(),
            "device_clipping_bound",
        )?;
        let bound_b = checked_bound(
            base_clipping_value * device_b.amplification(),
            "device_clipping_bound",
        )?;
        Ok(Self {
            device_a,
            device_b,
            bound_a,
            bound_b,
        })
    }

    pub fn bounds(&self) -> (f32, f32) {
        (self.bound_a, self.bound_b)
    }

    pub fn device_a(&self) -> &dyn DeviceUnit {
        self.device_a.as_ref()
    }

    pub fn device_b(&self) -> &dyn DeviceUnit {
        self.device_b.as_ref()
    }

    /// Runs both devices and clamps their raw outputs.
    pub fn forward(&self, input: &Array2<f32>) -> Result<FanOut> {
        if input.nrows() == 0 {
            return Err(Error::EmptyInput("device_layer"));
        }
        let raw_a = self.device_a.forward(input)?;
        guard_device_output(input, &raw_a)?;
        let raw_b = self.device_b.forward(input)?;
        guard_device_output(input, &raw_b)?;

        let mut clamped = Array2::zeros((input.nrows(), 2));
        clamped
            .slice_mut(s![.., 0..1])
            .assign(&hard_clip(&raw_a, self.bound_a));
        clamped
            .slice_mut(s![.., 1..2])
            .assign(&hard_clip(&raw_b, self.bound_b));
        Ok(FanOut {
            raw_a,
            raw_b,
            clamped,
        })
    }

    /// Propagates a `[batch, 2]` gradient through the clamps and both
    /// devices, summing the two input-gradient contributions. Raw outputs
    /// are recomputed; device forwards are pure.
    pub fn backward(&mut self, input: &Array2<f32>, grad: &Array2<f32>) -> Result<Array2<f32>> {
        if grad.dim() != (input.nrows(), 2) {
            return Err(Error::ShapeMismatch {
                expected: (input.nrows(), 2),
                got: grad.dim(),
            });
        }
        let raw_a = self.device_a.forward(input)?;
        guard_device_output(input, &raw_a)?;
        let raw_b = self.device_b.forward(input)?;
        guard_device_output(input, &raw_b)?;

        let grad_a = grad.slice(s![.., 0..1]).to_owned() * clip_subgradient_mask(&raw_a, self.bound_a);
        let grad_b = grad.slice(s![.., 1..2]).to_owned() * clip_subgradient_mask(&raw_b, self.bound_b);

        let input_grad_a = self.device_a.backward(input, &grad_a)?;
        let input_grad_b = self.device_b.backward(input, &grad_b)?;
        if input_grad_a.dim() != input.dim() || input_grad_b.dim() != input.dim() {
            return Err(Error::ShapeMismatch {
                expected: input.dim(),
                got: input_grad_a.dim(),
            });
        }
        Ok(input_grad_a + input_grad_b)
    }

    /// Sum of both device penalties.
    pub fn regularizer(&self) -> f32 {
        self.device_a.regularizer() + self.device_b.regularizer()
    }

    /// Resets both devices.
    pub fn reset(&mut self) {
        self.device_a.reset();
        self.device_b.reset();
    }

    pub fn visit_parameters(
        &self,
        visitor: &mut dyn FnMut(&crate::module::Parameter) -> Result<()>,
    ) -> Result<()> {
        self.device_a.visit_parameters(visitor)?;
        self.device_b.visit_parameters(visitor)
    }

    pub fn visit_parameters_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut crate::module::Parameter) -> Result<()>,
    ) -> Result<()> {
        self.device_a.visit_parameters_mut(visitor)?;
        self.device_b.visit_parameters_mut(visitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::Parameter;
    use ndarray::array;

    /// Test double: forwards one input column, with a fixed amplification.
    struct ColumnDevice {
        column: usize,
        amplification: f32,
    }

    impl Module for ColumnDevice {
        fn forward(&self, input: &Array2<f32>) -> Result<Array2<f32>> {
            Ok(input.slice(s![.., self.column..self.column + 1]).to_owned())
        }

        fn backward(&mut self, input: &Array2<f32>, grad_output: &Array2<f32>) -> Result<Array2<f32>> {
            let mut grad = Array2::zeros(input.dim());
            grad.slice_mut(s![.., self.column..self.column + 1])
                .assign(grad_output);
            Ok(grad)
        }

        fn visit_parameters(&self, _: &mut dyn FnMut(&Parameter) -> Result<()>) -> Result<()> {
            Ok(())
        }

        fn visit_parameters_mut(
            &mut self,
            _: &mut dyn FnMut(&mut Parameter) -> Result<()>,
        ) -> Result<()> {
            Ok(())
        }
    }

    impl DeviceUnit for ColumnDevice {
        fn amplification(&self) -> f32 {
            self.amplification
        }

        fn regularizer(&self) -> f32 {
            0.0
        }

        fn reset(&mut self) {}
    }

    /// Test double violating the single-channel contract.
    struct WideDevice;

    impl Module for WideDevice {
        fn forward(&self, input: &Array2<f32>) -> Result<Array2<f32>> {
            Ok(input.clone())
        }

        fn backward(&mut self, _: &Array2<f32>, grad_output: &Array2<f32>) -> Result<Array2<f32>> {
            Ok(grad_output.clone())
        }

        fn visit_parameters(&self, _: &mut dyn FnMut(&Parameter) -> Result<()>) -> Result<()> {
            Ok(())
        }

        fn visit_parameters_mut(
            &mut self,
            _: &mut dyn FnMut(&mut Parameter) -> Result<()>,
        ) -> Result<()> {
            Ok(())
        }
    }

    impl DeviceUnit for WideDevice {
        fn amplification(&self) -> f32 {
            1.0
        }

        fn regularizer(&self) -> f32 {
            0.0
        }

        fn reset(&mut self) {}
    }

    fn demo_layer() -> DeviceLayer {
        DeviceLayer::new(
            Box::new(ColumnDevice {
                column: 0,
                amplification: 1.0,
            }),
            Box::new(ColumnDevice {
                column: 1,
                amplification: 1.0,
            }),
            1.0,
        )
        .unwrap()
    }

    #[test]
    fn fan_out_clamps_each_channel_to_its_bound() {
        let layer = demo_layer();
        let out = layer.forward(&array![[2.0, -2.0]]).unwrap();
        assert_eq!(out.raw_a, array![[2.0]]);
        assert_eq!(out.raw_b, array![[-2.0]]);
        assert_eq!(out.clamped, array![[1.0, -1.0]]);
    }

    #[test]
    fn amplification_scales_the_bound() {
        let layer = DeviceLayer::new(
            Box::new(ColumnDevice {
                column: 0,
                amplification: 3.0,
            }),
            Box::new(ColumnDevice {
                column: 1,
                amplification: 0.5,
            }),
            2.0,
        )
        .unwrap();
        assert_eq!(layer.bounds(), (6.0, 1.0));
    }

    #[test]
    fn wide_output_is_a_contract_violation() {
        let layer = DeviceLayer::new(
            Box::new(WideDevice),
            Box::new(ColumnDevice {
                column: 1,
                amplification: 1.0,
            }),
            1.0,
        )
        .unwrap();
        assert!(matches!(
            layer.forward(&array![[0.1, 0.2]]),
            Err(Error::DeviceOutputWidth { channels: 2 })
        ));
    }

    #[test]
    fn backward_masks_saturated_channels() {
        let mut layer = demo_layer();
        // Channel 0 saturates (2.0 beyond bound 1.0), channel 1 stays inside.
        let input = array![[2.0, -0.5]];
        let grad = array![[1.0, 1.0]];
        let grad_input = layer.backward(&input, &grad).unwrap();
        assert_eq!(grad_input, array![[0.0, 1.0]]);
    }

    #[test]
    fn non_positive_amplification_is_rejected() {
        let err = DeviceLayer::new(
            Box::new(ColumnDevice {
                column: 0,
                amplification: 0.0,
            }),
            Box::new(ColumnDevice {
                column: 1,
                amplification: 1.0,
            }),
            1.0,
        );
        assert!(err.is_err());
    }
}
