// error.rs — Error taxonomy for operator construction and execution.
//
//   ConfigError   invalid parameters, caught before anything is allocated.
//   Allocation    texture / buffer acquisition failed; partial acquisitions
//                 are already released when this reaches the caller.
//   Execution     a convolution pass faulted; the operator is back in Ready
//                 and the output buffer must be treated as garbage.
//
// Nothing here is retried internally.

use thiserror::Error;

use crate::gpu::device::GpuError;

/// Invalid operator parameters. Always fatal at construction.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("kernel width must be in 1..={max} grid cells (got {width})")]
    InvalidKernelWidth { width: u32, max: u32 },

    #[error("sector width must be positive (got {0})")]
    InvalidSectorWidth(u32),

    #[error("oversampling factor must be finite and >= 1.0 (got {0})")]
    InvalidOversampling(f32),

    #[error("image dimensions must all be positive (got {width}×{height}×{depth})")]
    InvalidDimensions { width: u32, height: u32, depth: u32 },

    #[error("unsupported interpolation mode: {0}")]
    UnsupportedInterpolation(String),
}

/// Errors surfaced by the operator and its convolution engines.
#[derive(Debug, Error)]
pub enum NufftError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("failed to allocate {resource}: {reason}")]
    Allocation { resource: &'static str, reason: String },

    #[error("{pass} convolution failed: {reason}")]
    Execution { pass: &'static str, reason: String },

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("kernel textures are not initialised")]
    NotReady,

    #[error("operator has been released")]
    Released,

    #[error(transparent)]
    Device(#[from] GpuError),
}

pub type Result<T> = std::result::Result<T, NufftError>;
