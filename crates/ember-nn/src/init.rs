//! Parameter initialization helpers.
//!
//! The rules themselves live in [`ember_core::Init`]; these are the
//! layer-facing conveniences for building initialized tensors directly.

pub use ember_core::Init;

use ember_core::{Result, Shape, Tensor};

/// All zeros.
pub fn zeros(shape: impl Into<Shape>) -> Result<Tensor> {
    Init::Zeros.materialize(shape)
}

/// All ones.
pub fn ones(shape: impl Into<Shape>) -> Result<Tensor> {
    Init::Ones.materialize(shape)
}

/// Uniform in [low, high).
pub fn uniform(shape: impl Into<Shape>, low: f32, high: f32) -> Result<Tensor> {
    Init::Uniform { low, high }.materialize(shape)
}

/// Glorot uniform.
pub fn xavier_uniform(shape: impl Into<Shape>) -> Result<Tensor> {
    Init::XavierUniform.materialize(shape)
}

/// He uniform with rectifier slope `a` (0 for ReLU).
pub fn kaiming_uniform(shape: impl Into<Shape>, a: f32) -> Result<Tensor> {
    Init::KaimingUniform { a }.materialize(shape)
}
