// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use ndarray::Array2;
use std::cell::{Cell, RefCell};

/// Pipeline position a recorded tensor belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceStage {
    /// Graph input after affine conditioning.
    AffineConditioned,
    /// Raw output current of one device, before any clamping.
    RawDeviceOutput { channel: usize },
    /// Clamped channel pair leaving a device layer.
    Clamped,
    /// Normalized activations inside the conditioning stage.
    Normalized,
    /// Voltages after the current-to-voltage remap.
    Converted,
    /// Final clamped graph output.
    Output,
}

/// One intermediate tensor captured during a forward pass.
#[derive(Debug, Clone)]
pub struct TraceRecord {
    pub layer: usize,
    pub stage: TraceStage,
    pub values: Array2<f32>,
}

/// Every intermediate captured during a single forward pass, in pipeline
/// order.
#[derive(Debug, Clone, Default)]
pub struct ForwardTrace {
    records: Vec<TraceRecord>,
}

impl ForwardTrace {
    pub fn records(&self) -> &[TraceRecord] {
        &self.records
    }

    pub fn find(&self, layer: usize, stage: TraceStage) -> Option<&TraceRecord> {
        self.records
            .iter()
            .find(|record| record.layer == layer && record.stage == stage)
    }
}

/// Interior-mutable recorder the graph writes through during `forward`.
///
/// Disabled by default; when enabled each forward pass starts a fresh trace.
/// Recording only ever clones tensors, so enabling it cannot perturb the
/// forward result.
#[derive(Debug, Default)]
pub(crate) struct TraceRecorder {
    enabled: Cell<bool>,
    current: RefCell<Option<ForwardTrace>>,
}

impl TraceRecorder {
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.set(enabled);
        if !enabled {
            self.current.borrow_mut().take();
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.get()
    }

    /// Starts a fresh trace if recording is on.
    pub fn begin(&self) {
        if self.enabled.get() {
            *self.current.borrow_mut() = Some(ForwardTrace::default());
        }
    }

    pub fn record(&self, layer: usize, stage: TraceStage, values: &Array2<f32>) {
        if !self.enabled.get() {
            return;
        }
        if let Some(trace) = self.current.borrow_mut().as_mut() {
            trace.records.push(TraceRecord {
                layer,
                stage,
                values: values.clone(),
            });
        }
    }

    /// Hands over the most recent trace, leaving the recorder empty.
    pub fn take(&self) -> Option<ForwardTrace> {
        self.current.borrow_mut().take()
    }
}
