// tex-nufft: Texture-interpolated gridding core for non-uniform FFTs
// CPU reference implementation plus a wgpu engine
//
// The convolution kernel is tabulated once and looked up with linear
// filtering (1D table, 2D surface or 3D volume). Samples are binned into
// sectors so each GPU workgroup touches one neighbourhood of the grid.

pub mod config;
pub mod error;
pub mod kernel;
pub mod bounds;
pub mod textures;
pub mod sector;
pub mod grid;
pub mod engine;
pub mod fft;
pub mod operator;
pub mod gpu;

pub use config::{Dimensions, InterpolationMode, NufftConfig, OutputMode};
pub use engine::{ConvolutionEngine, EngineKind, HostEngine};
pub use error::{ConfigError, NufftError, Result};
pub use fft::{FftBackend, NaiveDft, RustFft};
pub use grid::Grid;
pub use operator::{NufftOperator, OperatorState};
