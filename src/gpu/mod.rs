// gpu/mod.rs — GPU convolution layer.
//
// wgpu compute kernels for the two convolution passes. The host engine in
// `crate::engine` stays the authoritative reference: every GPU pass is
// validated against it sample-for-sample.
//
// Architecture:
//
//   Once per operator (rebuild):
//     kernel table + bounds built on CPU → uploaded as textures
//     → pipelines compiled for the interpolation mode
//
//   Once per call:
//     coords, sector lists, samples/grid uploaded → one workgroup per sector
//     → grid (adjoint) or samples (forward) read back
//
// The FFT and deapodization stay on the CPU. Every call ends in a readback
// because the operator hands plain host buffers to its caller.

pub mod convolution;
pub mod device;
pub mod textures;

pub use convolution::TextureEngine;
pub use device::{DeviceProfile, GpuDevice, GpuError};
pub use textures::{GpuTexture, GpuTextures};
