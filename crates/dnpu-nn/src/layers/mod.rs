pub mod affine;
pub mod clip;
pub mod conditioning;
