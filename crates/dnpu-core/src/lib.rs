//! Foundation crate for DNPU multiplexing graphs.
//!
//! Everything here is plumbing the architecture crate builds on:
//!
//! - [`error`] — the error taxonomy shared across the workspace
//! - [`config`] — the construction-time configuration schema and validation
//! - [`control`] — control-electrode bookkeeping for device surrogates
//! - [`determinism`] — env-driven deterministic seeding for parameter draws
//! - [`tracing`] — global tracing subscriber initialisation

pub mod config;
pub mod control;
pub mod determinism;
pub mod error;
pub mod tracing;

pub use config::{ArchitectureConfig, BoundRange, ConversionConfig, WaveformConfig};
pub use control::control_voltage_indices;
pub use error::{Error, Result};
