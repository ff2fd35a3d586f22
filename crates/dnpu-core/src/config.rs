//! Construction-time configuration for DNPU multiplexing graphs.
//!
//! The schema mirrors what the training harness hands over: bounded ranges
//! for the trainable affine parameters, fixed conversion calibration, the
//! hardware clipping multiplier, the conditioning-policy selector, and
//! optional electrode bookkeeping. Validation is all-or-nothing: a graph is
//! never partially constructed from a bad configuration.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Closed `[min, max]` interval a trainable parameter is expected to stay in.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundRange {
    pub min: f32,
    pub max: f32,
}

impl BoundRange {
    pub fn new(min: f32, max: f32) -> Self {
        Self { min, max }
    }

    /// Checks the range is finite and not inverted.
    pub fn validate(&self, field: &'static str) -> Result<()> {
        if !self.min.is_finite() {
            return Err(Error::NonFiniteValue {
                label: field,
                value: self.min,
            });
        }
        if !self.max.is_finite() {
            return Err(Error::NonFiniteValue {
                label: field,
                value: self.max,
            });
        }
        if self.min > self.max {
            return Err(Error::InvalidRange {
                field,
                min: self.min,
                max: self.max,
            });
        }
        Ok(())
    }

    pub fn contains(&self, value: f32) -> bool {
        value >= self.min && value <= self.max
    }

    /// The degenerate `[1.0, 1.0]` range that freezes a scale parameter.
    pub fn is_frozen_unit(&self) -> bool {
        self.min == 1.0 && self.max == 1.0
    }
}

/// Fixed calibration of the current-to-voltage remap. Not learned.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ConversionConfig {
    /// Additive offset applied after the conversion gain.
    pub offset: f32,
}

/// Hardware clipping configuration.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WaveformConfig {
    /// Base multiplier for the per-device amplification-derived clamp.
    pub output_clipping_value: f32,
}

/// Complete construction-time configuration of a multiplexing graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchitectureConfig {
    pub offset: BoundRange,
    pub scale: BoundRange,
    pub current_to_voltage: ConversionConfig,
    pub waveform: WaveformConfig,
    /// Selects statistical conditioning for the first layer boundary.
    pub batch_norm: bool,
    /// Electrodes driven by the task input; the remainder are control
    /// electrodes. Optional bookkeeping for diagnostics.
    #[serde(default)]
    pub input_indices: Vec<usize>,
    /// Total electrode count per device.
    #[serde(default)]
    pub input_electrode_no: usize,
}

impl ArchitectureConfig {
    /// Deserializes and validates a configuration from JSON.
    pub fn from_json(raw: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(raw).map_err(|err| Error::Config {
            message: err.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Checks every field the graph constructors rely on.
    pub fn validate(&self) -> Result<()> {
        self.offset.validate("offset")?;
        self.scale.validate("scale")?;
        if !self.current_to_voltage.offset.is_finite() {
            return Err(Error::NonFiniteValue {
                label: "current_to_voltage.offset",
                value: self.current_to_voltage.offset,
            });
        }
        let clip = self.waveform.output_clipping_value;
        if !clip.is_finite() {
            return Err(Error::NonFiniteValue {
                label: "waveform.output_clipping_value",
                value: clip,
            });
        }
        if clip <= 0.0 {
            return Err(Error::InvalidValue {
                label: "waveform.output_clipping_value",
            });
        }
        if !self.input_indices.is_empty() {
            crate::control::control_voltage_indices(&self.input_indices, self.input_electrode_no)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn demo_config() -> ArchitectureConfig {
        ArchitectureConfig {
            offset: BoundRange::new(-0.35, 0.7),
            scale: BoundRange::new(0.1, 1.5),
            current_to_voltage: ConversionConfig { offset: -0.6 },
            waveform: WaveformConfig {
                output_clipping_value: 1.0,
            },
            batch_norm: true,
            input_indices: vec![0, 4],
            input_electrode_no: 7,
        }
    }

    #[test]
    fn valid_config_passes_validation() {
        assert!(demo_config().validate().is_ok());
    }

    #[test]
    fn inverted_range_is_rejected() {
        let mut config = demo_config();
        config.offset = BoundRange::new(0.7, -0.35);
        assert!(matches!(
            config.validate(),
            Err(Error::InvalidRange { field: "offset", .. })
        ));
    }

    #[test]
    fn non_finite_conversion_offset_is_rejected() {
        let mut config = demo_config();
        config.current_to_voltage.offset = f32::NAN;
        assert!(matches!(
            config.validate(),
            Err(Error::NonFiniteValue { .. })
        ));
    }

    #[test]
    fn non_positive_clipping_value_is_rejected() {
        let mut config = demo_config();
        config.waveform.output_clipping_value = 0.0;
        assert!(matches!(config.validate(), Err(Error::InvalidValue { .. })));
    }

    #[test]
    fn json_round_trip_preserves_fields() {
        let config = demo_config();
        let raw = serde_json::to_string(&config).unwrap();
        let parsed = ArchitectureConfig::from_json(&raw).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn missing_key_surfaces_as_configuration_error() {
        let raw = r#"{ "offset": { "min": -0.35, "max": 0.7 } }"#;
        assert!(matches!(
            ArchitectureConfig::from_json(raw),
            Err(Error::Config { .. })
        ));
    }

    #[test]
    fn electrode_bookkeeping_is_validated() {
        let mut config = demo_config();
        config.input_indices = vec![0, 9];
        assert!(config.validate().is_err());
    }

    #[test]
    fn frozen_unit_range_is_detected() {
        assert!(BoundRange::new(1.0, 1.0).is_frozen_unit());
        assert!(!BoundRange::new(1.0, 1.5).is_frozen_unit());
        assert!(!BoundRange::new(0.5, 0.5).is_frozen_unit());
    }
}
