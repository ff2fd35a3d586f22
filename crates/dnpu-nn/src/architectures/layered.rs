// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Layered multiplexing graphs.
//!
//! Both concrete topologies — two input devices feeding one output device,
//! and two input devices through two hidden devices into one output device —
//! are instances of one layered graph: an affine input stage, a sequence of
//! width-2 device layers each followed by its boundary conditioning, and a
//! final output device behind a hardware clamp.
//!
//! Per layer boundary the order is fixed: each raw device current is clamped
//! to its amplification-derived bound first, then the clamped pair is
//! normalized and remapped to voltages (when the boundary uses the
//! batch-norm policy). Apart from running-statistics accumulation in
//! training mode, `forward` is a pure function of the input, the trainable
//! parameters, and the running statistics.

use dnpu_core::config::ArchitectureConfig;
use dnpu_core::control::control_voltage_indices;
use dnpu_core::error::{Error, Result};
use ndarray::Array2;
use rand::rngs::StdRng;
use std::cell::{Cell, RefCell};

use crate::device::{guard_device_output, DeviceLayer, DeviceUnit};
use crate::layers::affine::InputAffine;
use crate::layers::clip::{checked_bound, clip_subgradient_mask, hard_clip};
use crate::layers::conditioning::CurrentToVoltage;
use crate::module::{Module, Parameter};
use crate::trace::{ForwardTrace, TraceRecorder, TraceStage};

/// Boundary conditioning selected once at construction.
#[derive(Debug)]
pub enum ConditioningPolicy {
    /// The clamped channel pair passes through unchanged.
    Clip,
    /// Running-statistics normalization plus current-to-voltage conversion.
    BatchNorm(CurrentToVoltage),
}

#[derive(Debug)]
struct Stage {
    devices: DeviceLayer,
    policy: ConditioningPolicy,
}

#[derive(Debug, Clone)]
struct ForwardCache {
    input_dim: (usize, usize),
    conditioned: Array2<f32>,
    stage_outputs: Vec<Array2<f32>>,
}

/// Trainable multi-device composition graph.
pub struct LayeredDnpu {
    affine: InputAffine,
    stages: Vec<Stage>,
    output_device: Box<dyn DeviceUnit>,
    output_bound: f32,
    control_electrodes: Vec<usize>,
    training: Cell<bool>,
    trace: TraceRecorder,
    cache: RefCell<Option<ForwardCache>>,
}

impl core::fmt::Debug for LayeredDnpu {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "LayeredDnpu(stages={},output_bound={},training={})",
            self.stages.len(),
            self.output_bound,
            self.training.get()
        )
    }
}

impl LayeredDnpu {
    /// Two input devices feeding one output device. The single layer
    /// boundary follows the configured conditioning policy.
    pub fn two_to_one(
        config: &ArchitectureConfig,
        input_pair: [Box<dyn DeviceUnit>; 2],
        output: Box<dyn DeviceUnit>,
        rng: &mut StdRng,
    ) -> Result<Self> {
        let [input_a, input_b] = input_pair;
        Self::assemble(
            config,
            vec![(input_a, input_b, config.batch_norm)],
            output,
            rng,
        )
    }

    /// Two input devices through two hidden devices into one output device.
    /// The first boundary follows the configured policy; the hidden boundary
    /// always normalizes.
    pub fn two_to_two_to_one(
        config: &ArchitectureConfig,
        input_pair: [Box<dyn DeviceUnit>; 2],
        hidden_pair: [Box<dyn DeviceUnit>; 2],
        output: Box<dyn DeviceUnit>,
        rng: &mut StdRng,
    ) -> Result<Self> {
        let [input_a, input_b] = input_pair;
        let [hidden_a, hidden_b] = hidden_pair;
        Self::assemble(
            config,
            vec![
                (input_a, input_b, config.batch_norm),
                (hidden_a, hidden_b, true),
            ],
            output,
            rng,
        )
    }

    fn assemble(
        config: &ArchitectureConfig,
        device_pairs: Vec<(Box<dyn DeviceUnit>, Box<dyn DeviceUnit>, bool)>,
        output: Box<dyn DeviceUnit>,
        rng: &mut StdRng,
    ) -> Result<Self> {
        config.validate()?;
        let affine = InputAffine::new(config.offset, config.scale, rng)?;
        let base = config.waveform.output_clipping_value;

        let mut stages = Vec::with_capacity(device_pairs.len());
        for (device_a, device_b, batch_norm) in device_pairs {
            let policy = if batch_norm {
                ConditioningPolicy::BatchNorm(CurrentToVoltage::with_defaults(
                    config.current_to_voltage.offset,
                )?)
            } else {
                ConditioningPolicy::Clip
            };
            stages.push(Stage {
                devices: DeviceLayer::new(device_a, device_b, base)?,
                policy,
            });
        }

        let output_bound = checked_bound(base * output.amplification(), "output_clipping_bound")?;
        let control_electrodes = if config.input_indices.is_empty() {
            Vec::new()
        } else {
            control_voltage_indices(&config.input_indices, config.input_electrode_no)?
        };

        tracing::debug!(
            stages = stages.len(),
            batch_norm = config.batch_norm,
            output_bound,
            "assembled multiplexing graph"
        );

        Ok(Self {
            affine,
            stages,
            output_device: output,
            output_bound,
            control_electrodes,
            training: Cell::new(true),
            trace: TraceRecorder::default(),
            cache: RefCell::new(None),
        })
    }

    /// Device layers ahead of the output device.
    pub fn depth(&self) -> usize {
        self.stages.len()
    }

    /// Conditioning policy of the given layer boundary.
    pub fn stage_policy(&self, index: usize) -> Option<&ConditioningPolicy> {
        self.stages.get(index).map(|stage| &stage.policy)
    }

    /// Control-electrode indices derived from the configuration, when the
    /// electrode bookkeeping was supplied.
    pub fn control_electrodes(&self) -> &[usize] {
        &self.control_electrodes
    }

    pub fn affine(&self) -> &InputAffine {
        &self.affine
    }

    /// Sum of the affine bound penalties and every owned device's penalty.
    pub fn regularizer(&self) -> f32 {
        let mut penalty = self.affine.offset_penalty() + self.affine.scale_penalty();
        for stage in &self.stages {
            penalty += stage.devices.regularizer();
        }
        penalty + self.output_device.regularizer()
    }

    /// Accumulates the affine bound-penalty subgradients, weighted.
    pub fn accumulate_penalties(&mut self, weight: f32) -> Result<()> {
        self.affine.accumulate_bound_penalty(weight)
    }

    /// First trainable tensor of every owned device, in the fixed order
    /// input pair, hidden pair (when present), output device.
    pub fn get_control_voltages(&self) -> Result<Vec<Array2<f32>>> {
        let mut voltages = Vec::with_capacity(self.stages.len() * 2 + 1);
        for (index, stage) in self.stages.iter().enumerate() {
            for (channel, device) in [stage.devices.device_a(), stage.devices.device_b()]
                .into_iter()
                .enumerate()
            {
                voltages.push(device.control_voltages().ok_or_else(|| {
                    Error::MissingParameter {
                        name: format!("layer {index} device {channel}"),
                    }
                })?);
            }
        }
        voltages.push(
            self.output_device
                .control_voltages()
                .ok_or_else(|| Error::MissingParameter {
                    name: "output device".to_string(),
                })?,
        );
        Ok(voltages)
    }

    /// Reinitialises the graph: re-samples the affine parameters, restores
    /// every conditioning stage to its untrained statistics, and resets
    /// every owned device. Afterwards the graph has no memory of prior
    /// training, modulo fresh random draws.
    pub fn reset(&mut self, rng: &mut StdRng) {
        self.affine.reset(rng);
        for stage in &mut self.stages {
            stage.devices.reset();
            if let ConditioningPolicy::BatchNorm(conditioning) = &stage.policy {
                conditioning.reset();
            }
        }
        self.output_device.reset();
        self.cache.borrow_mut().take();
        tracing::debug!("multiplexing graph reset");
    }

    /// Switches statistics accumulation on or off across every boundary.
    pub fn set_training(&self, training: bool) {
        self.training.set(training);
        for stage in &self.stages {
            if let ConditioningPolicy::BatchNorm(conditioning) = &stage.policy {
                conditioning.set_training(training);
            }
        }
    }

    pub fn train(&self) {
        self.set_training(true);
    }

    pub fn eval(&self) {
        self.set_training(false);
    }

    pub fn is_training(&self) -> bool {
        self.training.get()
    }

    /// Turns the intermediate-tensor recorder on or off.
    pub fn set_trace_enabled(&self, enabled: bool) {
        self.trace.set_enabled(enabled);
    }

    /// Hands over the trace of the most recent forward pass.
    pub fn take_trace(&self) -> Option<ForwardTrace> {
        self.trace.take()
    }
}

impl Module for LayeredDnpu {
    fn forward(&self, input: &Array2<f32>) -> Result<Array2<f32>> {
        self.trace.begin();
        let conditioned = self.affine.forward(input)?;
        self.trace
            .record(0, TraceStage::AffineConditioned, &conditioned);

        let mut stage_outputs = Vec::with_capacity(self.stages.len());
        let mut activations = conditioned.clone();
        for (index, stage) in self.stages.iter().enumerate() {
            let fan_out = stage.devices.forward(&activations)?;
            self.trace.record(
                index,
                TraceStage::RawDeviceOutput { channel: 0 },
                &fan_out.raw_a,
            );
            self.trace.record(
                index,
                TraceStage::RawDeviceOutput { channel: 1 },
                &fan_out.raw_b,
            );
            self.trace.record(index, TraceStage::Clamped, &fan_out.clamped);

            let boundary_output = match &stage.policy {
                ConditioningPolicy::Clip => fan_out.clamped,
                ConditioningPolicy::BatchNorm(conditioning) => {
                    let converted = conditioning.forward(&fan_out.clamped)?;
                    if let Some(normed) = conditioning.last_normalized() {
                        self.trace.record(index, TraceStage::Normalized, &normed);
                    }
                    self.trace.record(index, TraceStage::Converted, &converted);
                    converted
                }
            };
            stage_outputs.push(boundary_output.clone());
            activations = boundary_output;
        }

        let raw_output = self.output_device.forward(&activations)?;
        guard_device_output(&activations, &raw_output)?;
        let output = hard_clip(&raw_output, self.output_bound);
        self.trace.record(
            self.stages.len(),
            TraceStage::RawDeviceOutput { channel: 0 },
            &raw_output,
        );
        self.trace
            .record(self.stages.len(), TraceStage::Output, &output);

        *self.cache.borrow_mut() = Some(ForwardCache {
            input_dim: input.dim(),
            conditioned,
            stage_outputs,
        });
        Ok(output)
    }

    fn backward(&mut self, input: &Array2<f32>, grad_output: &Array2<f32>) -> Result<Array2<f32>> {
        let cache = self
            .cache
            .borrow()
            .clone()
            .ok_or(Error::MissingStatistics {
                label: "layered_forward",
            })?;
        if cache.input_dim != input.dim() {
            return Err(Error::ShapeMismatch {
                expected: cache.input_dim,
                got: input.dim(),
            });
        }

        let output_input = cache
            .stage_outputs
            .last()
            .cloned()
            .unwrap_or_else(|| cache.conditioned.clone());
        let raw_output = self.output_device.forward(&output_input)?;
        guard_device_output(&output_input, &raw_output)?;
        if grad_output.dim() != raw_output.dim() {
            return Err(Error::ShapeMismatch {
                expected: raw_output.dim(),
                got: grad_output.dim(),
            });
        }

        let masked = grad_output * &clip_subgradient_mask(&raw_output, self.output_bound);
        let mut grad = self.output_device.backward(&output_input, &masked)?;

        for index in (0..self.stages.len()).rev() {
            let stage_input = if index == 0 {
                cache.conditioned.clone()
            } else {
                cache.stage_outputs[index - 1].clone()
            };
            let stage = &mut self.stages[index];
            if let ConditioningPolicy::BatchNorm(conditioning) = &mut stage.policy {
                let fan_out = stage.devices.forward(&stage_input)?;
                grad = conditioning.backward(&fan_out.clamped, &grad)?;
            }
            grad = stage.devices.backward(&stage_input, &grad)?;
        }

        self.affine.backward(input, &grad)
    }

    fn visit_parameters(&self, visitor: &mut dyn FnMut(&Parameter) -> Result<()>) -> Result<()> {
        self.affine.visit_parameters(visitor)?;
        for stage in &self.stages {
            stage.devices.visit_parameters(visitor)?;
        }
        self.output_device.visit_parameters(visitor)
    }

    fn visit_parameters_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut Parameter) -> Result<()>,
    ) -> Result<()> {
        self.affine.visit_parameters_mut(visitor)?;
        for stage in &mut self.stages {
            stage.devices.visit_parameters_mut(visitor)?;
        }
        self.output_device.visit_parameters_mut(visitor)
    }
}
