// textures.rs — Texture resource lifecycle and the software sampler.
//
// Two textures back every operator: the kernel lookup table and the
// min/max bounds array. `TextureResources` is the lifecycle contract both
// the host and the GPU implementation honour:
//
//   init_lookup_table    release any previous table, then acquire + upload
//   init_min_max_bounds  release any previous bounds, then acquire + upload
//   free_*               release; idempotent
//   Drop                 releases whatever is still held
//
// `upload_kernel_representation` sequences the two uploads all-or-nothing:
// if the bounds upload fails, the freshly uploaded table is released before
// the error propagates.
//
// SOFTWARE SAMPLER
// ────────────────
// `SoftwareTexture::sample` reproduces what a linear-filtering texture unit
// does with clamp-to-edge addressing and normalised coordinates:
//
//   pos   = clamp(u, 0, 1) · (n - 1)        texel space, texel centres at ints
//   i0    = floor(pos), i1 = min(i0 + 1, n - 1)
//   frac  = floor((pos - i0) · 256 + 0.5) / 256   8-bit filter weight
//   value = mix(t[i0], t[i1], frac)         per axis, x then y then z
//
// The 8-bit fraction matches the fixed-point weights of hardware filtering,
// so host results and GPU results agree to within float rounding. The same
// arithmetic is used by the shader on adapters that cannot filter 32-bit
// float textures.

use tracing::debug;

use crate::bounds::MinMaxBounds;
use crate::config::InterpolationMode;
use crate::error::{NufftError, Result};
use crate::kernel::KernelTable;

/// Fractional bits used for filter weights.
pub const FILTER_FRACTION_BITS: u32 = 8;

const FILTER_STEPS: f32 = (1u32 << FILTER_FRACTION_BITS) as f32;

// ---------------------------------------------------------------------------
// Lifecycle contract
// ---------------------------------------------------------------------------

/// Owner of the kernel and bounds textures for one operator.
pub trait TextureResources {
    /// Acquire and upload the kernel table, releasing any previous one.
    fn init_lookup_table(&mut self, table: &KernelTable) -> Result<()>;
    fn free_lookup_table(&mut self);
    /// Acquire and upload the bounds array, releasing any previous one.
    fn init_min_max_bounds(&mut self, bounds: &MinMaxBounds) -> Result<()>;
    fn free_min_max_bounds(&mut self);
    /// Number of textures currently held (0, 1 or 2).
    fn live_resources(&self) -> usize;

    fn is_ready(&self) -> bool {
        self.live_resources() == 2
    }
}

/// Upload table and bounds as one unit. On failure nothing stays acquired.
pub fn upload_kernel_representation<R: TextureResources + ?Sized>(
    resources: &mut R,
    table: &KernelTable,
    bounds: &MinMaxBounds,
) -> Result<()> {
    resources.free_min_max_bounds();
    resources.free_lookup_table();
    resources.init_lookup_table(table)?;
    if let Err(e) = resources.init_min_max_bounds(bounds) {
        resources.free_lookup_table();
        return Err(e);
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// SoftwareTexture
// ---------------------------------------------------------------------------

/// Host-resident single-channel texture with emulated linear filtering.
#[derive(Debug, Clone, PartialEq)]
pub struct SoftwareTexture {
    extent: [usize; 3],
    data: Vec<f32>,
}

impl SoftwareTexture {
    /// Copy `table` into a fresh allocation.
    pub fn upload(table: &KernelTable) -> Result<Self> {
        let src = table.as_slice();
        let mut data = Vec::new();
        data.try_reserve_exact(src.len()).map_err(|e| NufftError::Allocation {
            resource: "kernel lookup table",
            reason: e.to_string(),
        })?;
        data.extend_from_slice(src);
        Ok(SoftwareTexture { extent: table.extent(), data })
    }

    pub fn extent(&self) -> [usize; 3] {
        self.extent
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }

    /// Filtered fetch at normalised coordinates in [0, 1] per axis.
    /// Axes with extent 1 ignore their coordinate.
    pub fn sample(&self, u: [f32; 3]) -> f32 {
        let [nx, ny, _] = self.extent;
        let (x0, x1, fx) = texel_span(u[0], self.extent[0]);
        let (y0, y1, fy) = texel_span(u[1], self.extent[1]);
        let (z0, z1, fz) = texel_span(u[2], self.extent[2]);
        let at = |x: usize, y: usize, z: usize| self.data[(z * ny + y) * nx + x];

        let c00 = mix(at(x0, y0, z0), at(x1, y0, z0), fx);
        let c10 = mix(at(x0, y1, z0), at(x1, y1, z0), fx);
        let c01 = mix(at(x0, y0, z1), at(x1, y0, z1), fx);
        let c11 = mix(at(x0, y1, z1), at(x1, y1, z1), fx);
        mix(mix(c00, c10, fy), mix(c01, c11, fy), fz)
    }
}

#[inline]
fn texel_span(u: f32, n: usize) -> (usize, usize, f32) {
    if n <= 1 {
        return (0, 0, 0.0);
    }
    let pos = u.clamp(0.0, 1.0) * (n - 1) as f32;
    let base = pos.floor();
    let frac = ((pos - base) * FILTER_STEPS + 0.5).floor() / FILTER_STEPS;
    let i0 = base as usize;
    (i0, (i0 + 1).min(n - 1), frac)
}

#[inline]
fn mix(a: f32, b: f32, t: f32) -> f32 {
    a * (1.0 - t) + b * t
}

/// Kernel weight for normalised per-axis distances, using the fetch pattern
/// of `mode`. Must match `kernel_weight` in the generated shader source.
#[inline]
pub fn kernel_weight(texture: &SoftwareTexture, mode: InterpolationMode, u: [f32; 3]) -> f32 {
    match mode {
        InterpolationMode::Table => {
            texture.sample([u[0], 0.0, 0.0])
                * texture.sample([u[1], 0.0, 0.0])
                * texture.sample([u[2], 0.0, 0.0])
        }
        InterpolationMode::Surface2D => {
            texture.sample([u[0], u[1], 0.0]) * texture.sample([u[2], 0.0, 0.0])
        }
        InterpolationMode::Volume3D => texture.sample(u),
    }
}

// ---------------------------------------------------------------------------
// HostTextures
// ---------------------------------------------------------------------------

/// Host-memory implementation of [`TextureResources`].
#[derive(Debug, Default)]
pub struct HostTextures {
    kernel: Option<(InterpolationMode, SoftwareTexture)>,
    bounds: Option<MinMaxBounds>,
}

/// Borrowed, read-only view over both host textures.
#[derive(Debug, Clone, Copy)]
pub struct HostTextureView<'a> {
    pub mode: InterpolationMode,
    pub kernel: &'a SoftwareTexture,
    pub bounds: &'a MinMaxBounds,
}

impl HostTextureView<'_> {
    #[inline]
    pub fn weight(&self, u: [f32; 3]) -> f32 {
        kernel_weight(self.kernel, self.mode, u)
    }
}

impl HostTextures {
    pub fn new() -> Self {
        Self::default()
    }

    /// `None` unless both textures are live.
    pub fn view(&self) -> Option<HostTextureView<'_>> {
        match (&self.kernel, &self.bounds) {
            (Some((mode, kernel)), Some(bounds)) => {
                Some(HostTextureView { mode: *mode, kernel, bounds })
            }
            _ => None,
        }
    }
}

impl TextureResources for HostTextures {
    fn init_lookup_table(&mut self, table: &KernelTable) -> Result<()> {
        self.free_lookup_table();
        let texture = SoftwareTexture::upload(table)?;
        debug!(extent = ?texture.extent(), bytes = table.size_bytes(), "host lookup table uploaded");
        self.kernel = Some((table.mode(), texture));
        Ok(())
    }

    fn free_lookup_table(&mut self) {
        if self.kernel.take().is_some() {
            debug!("host lookup table released");
        }
    }

    fn init_min_max_bounds(&mut self, bounds: &MinMaxBounds) -> Result<()> {
        self.free_min_max_bounds();
        self.bounds = Some(bounds.clone());
        Ok(())
    }

    fn free_min_max_bounds(&mut self) {
        self.bounds = None;
    }

    fn live_resources(&self) -> usize {
        self.kernel.is_some() as usize + self.bounds.is_some() as usize
    }
}
