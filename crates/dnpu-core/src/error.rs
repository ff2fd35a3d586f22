use thiserror::Error as ThisError;

pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by DNPU graph construction and evaluation.
#[derive(Debug, Clone, PartialEq, ThisError)]
pub enum Error {
    /// Malformed or missing configuration detected at construction time.
    #[error("configuration error: {message}")]
    Config { message: String },
    /// A configured `[min, max]` range is inverted.
    #[error("invalid {field} range: min {min} must not exceed max {max}")]
    InvalidRange {
        field: &'static str,
        min: f32,
        max: f32,
    },
    /// Numeric guard caught a non-finite value before it could propagate.
    #[error("non-finite value in {label}: {value}")]
    NonFiniteValue { label: &'static str, value: f32 },
    /// Generic guard violation for scalar arguments.
    #[error("invalid value for {label}")]
    InvalidValue { label: &'static str },
    /// Two tensors that must agree in shape did not.
    #[error("shape mismatch: expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        expected: (usize, usize),
        got: (usize, usize),
    },
    /// A device collaborator returned an output of unexpected channel width.
    #[error("device produced {channels} output channels, expected exactly 1")]
    DeviceOutputWidth { channels: usize },
    /// A running variance estimate turned negative, which no update rule
    /// here can produce from valid inputs.
    #[error("running variance on channel {channel} is negative: {variance}")]
    DegenerateVariance { channel: usize, variance: f32 },
    /// A backward pass was requested without the forward-pass caches it
    /// relies on.
    #[error("no cached statistics for {label}; run a training-mode forward pass first")]
    MissingStatistics { label: &'static str },
    /// A device was asked for its trainable tensor but exposes none.
    #[error("no trainable parameter exposed by {name}")]
    MissingParameter { name: String },
    /// Computation received an empty batch which would otherwise panic.
    #[error("empty input for {0}")]
    EmptyInput(&'static str),
}
