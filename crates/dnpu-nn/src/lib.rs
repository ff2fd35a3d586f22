//! Module-style surface for DNPU multiplexing graphs.
//!
//! Several trainable device surrogates are composed into two-layer and
//! three-layer directed graphs: a learnable affine stage conditions the raw
//! input, each layer fans the signal out through two parallel devices, raw
//! device currents are clamped to hardware-safe bounds, and a running-
//! statistics normalization stage remaps the clamped currents into the
//! voltage range the next layer accepts. The whole pipeline is
//! differentiable end to end through the manual `backward` implementations.

pub mod architectures;
pub mod device;
pub mod layers;
pub mod module;
pub mod trace;

pub use architectures::{ConditioningPolicy, LayeredDnpu};
pub use device::{DeviceLayer, DeviceUnit, FanOut};
pub use layers::affine::InputAffine;
pub use layers::clip::{clip_subgradient_mask, hard_clip};
pub use layers::conditioning::CurrentToVoltage;
pub use module::{Module, Parameter};

pub use dnpu_core::error::{Error, Result};
