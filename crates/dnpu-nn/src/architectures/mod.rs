pub mod layered;

pub use layered::{ConditioningPolicy, LayeredDnpu};
