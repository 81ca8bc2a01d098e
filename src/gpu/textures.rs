// gpu/textures.rs — Kernel and bounds textures resident on the GPU.
//
// Two textures per operator:
//
//   kernel   R32Float. `Table` is stored as an n×1 2D texture (WGSL has no
//            level-selecting sample on texture_1d), `Surface2D` as n×n 2D,
//            `Volume3D` as n×n×n 3D. Sampled with linear filtering when the
//            device grants FLOAT32_FILTERABLE, otherwise read with
//            `textureLoad`.
//   bounds   Rg32Sint, B×1 2D. Texel b holds the (min, max) grid offsets for
//            fractional-position bucket b. Always read with `textureLoad`.
//
// UPLOAD
// ──────
// Data goes through a staging buffer whose rows are padded to
// `COPY_BYTES_PER_ROW_ALIGNMENT`, then `copy_buffer_to_texture`. A 3D
// texture is just `height · depth` rows with `rows_per_image = height`.
//
// FAILURE
// ───────
// Texture creation is wrapped in OutOfMemory and Validation error scopes.
// If either scope reports an error the half-created texture is dropped and
// the caller sees `NufftError::Allocation`; nothing from that call stays
// acquired.
//
// NEW WGPU CONCEPTS
// ─────────────────
// - `push_error_scope` / `pop_error_scope`: wgpu reports most errors
//   asynchronously to an uncaptured-error handler that panics by default.
//   An error scope captures them instead; popping returns the first one.
// - `TextureViewDimension::D3`: the view decides what the shader sees, so
//   the bind group layout must agree with it.

use std::sync::Arc;

use wgpu::util::DeviceExt;
use tracing::debug;

use crate::bounds::MinMaxBounds;
use crate::config::InterpolationMode;
use crate::error::{ConfigError, NufftError, Result};
use crate::gpu::device::GpuDevice;
use crate::kernel::KernelTable;
use crate::textures::TextureResources;

const COPY_ALIGNMENT: u32 = wgpu::COPY_BYTES_PER_ROW_ALIGNMENT;

/// A texture plus the view the shaders bind.
pub struct GpuTexture {
    pub texture: wgpu::Texture,
    pub view: wgpu::TextureView,
    pub extent: [u32; 3],
    pub format: wgpu::TextureFormat,
}

impl GpuTexture {
    pub fn dimension(&self) -> wgpu::TextureDimension {
        self.texture.dimension()
    }
}

/// GPU implementation of [`TextureResources`].
pub struct GpuTextures {
    gpu: Arc<GpuDevice>,
    kernel: Option<(InterpolationMode, GpuTexture)>,
    bounds: Option<GpuTexture>,
}

impl GpuTextures {
    pub fn new(gpu: Arc<GpuDevice>) -> Self {
        GpuTextures { gpu, kernel: None, bounds: None }
    }

    pub fn kernel(&self) -> Option<&GpuTexture> {
        self.kernel.as_ref().map(|(_, t)| t)
    }

    pub fn kernel_mode(&self) -> Option<InterpolationMode> {
        self.kernel.as_ref().map(|(m, _)| *m)
    }

    pub fn bounds(&self) -> Option<&GpuTexture> {
        self.bounds.as_ref()
    }

    /// Copy the kernel texture back to host memory (tests and diagnostics).
    pub fn read_lookup_table(&self) -> Result<Vec<f32>> {
        let tex = self.kernel().ok_or(NufftError::NotReady)?;
        readback_texture(&self.gpu, tex)
    }

    /// Copy the bounds texture back to host memory.
    pub fn read_min_max_bounds(&self) -> Result<Vec<[i32; 2]>> {
        let tex = self.bounds().ok_or(NufftError::NotReady)?;
        readback_texture(&self.gpu, tex)
    }
}

impl TextureResources for GpuTextures {
    fn init_lookup_table(&mut self, table: &KernelTable) -> Result<()> {
        self.free_lookup_table();
        let [nx, ny, nz] = table.extent().map(|n| n as u32);
        let mode = table.mode();

        let (dimension, limit) = match mode {
            InterpolationMode::Volume3D => (wgpu::TextureDimension::D3, self.gpu.max_texture_3d()),
            _ => (wgpu::TextureDimension::D2, self.gpu.max_texture_2d()),
        };
        if nx.max(ny).max(nz) > limit {
            return Err(ConfigError::UnsupportedInterpolation(format!(
                "{mode} needs {nx}×{ny}×{nz} texels, device limit is {limit} per axis"
            ))
            .into());
        }

        let texture = upload_texture(
            &self.gpu,
            "kernel lookup table",
            wgpu::TextureFormat::R32Float,
            dimension,
            [nx, ny, nz],
            bytemuck::cast_slice(table.as_slice()),
        )?;
        debug!(
            mode = mode.name(),
            extent = ?[nx, ny, nz],
            bytes = table.size_bytes(),
            "kernel texture uploaded"
        );
        self.kernel = Some((mode, texture));
        Ok(())
    }

    fn free_lookup_table(&mut self) {
        if let Some((_, tex)) = self.kernel.take() {
            tex.texture.destroy();
            debug!("kernel texture released");
        }
    }

    fn init_min_max_bounds(&mut self, bounds: &MinMaxBounds) -> Result<()> {
        self.free_min_max_bounds();
        let texture = upload_texture(
            &self.gpu,
            "min/max bounds",
            wgpu::TextureFormat::Rg32Sint,
            wgpu::TextureDimension::D2,
            [bounds.buckets() as u32, 1, 1],
            bytemuck::cast_slice(bounds.as_slice()),
        )?;
        debug!(buckets = bounds.buckets(), "bounds texture uploaded");
        self.bounds = Some(texture);
        Ok(())
    }

    fn free_min_max_bounds(&mut self) {
        if let Some(tex) = self.bounds.take() {
            tex.texture.destroy();
            debug!("bounds texture released");
        }
    }

    fn live_resources(&self) -> usize {
        self.kernel.is_some() as usize + self.bounds.is_some() as usize
    }
}

impl Drop for GpuTextures {
    fn drop(&mut self) {
        self.free_min_max_bounds();
        self.free_lookup_table();
    }
}

// ---------------------------------------------------------------------------
// Upload / readback helpers
// ---------------------------------------------------------------------------

/// Create a texture of `extent` and fill it from tightly packed `data`.
fn upload_texture(
    gpu: &GpuDevice,
    label: &'static str,
    format: wgpu::TextureFormat,
    dimension: wgpu::TextureDimension,
    extent: [u32; 3],
    data: &[u8],
) -> Result<GpuTexture> {
    let [width, height, depth] = extent;
    let texel = format.block_copy_size(None).unwrap_or(4);
    let row_bytes = width * texel;
    let aligned_bytes_per_row = align_to(row_bytes, COPY_ALIGNMENT);
    let rows = (height * depth) as usize;

    let mut staging = Vec::new();
    staging
        .try_reserve_exact(aligned_bytes_per_row as usize * rows)
        .map_err(|e| NufftError::Allocation { resource: label, reason: e.to_string() })?;
    staging.resize(aligned_bytes_per_row as usize * rows, 0u8);
    for (r, src) in data.chunks_exact(row_bytes as usize).enumerate() {
        let dst = r * aligned_bytes_per_row as usize;
        staging[dst..dst + row_bytes as usize].copy_from_slice(src);
    }

    gpu.device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
    gpu.device.push_error_scope(wgpu::ErrorFilter::Validation);

    let size = wgpu::Extent3d { width, height, depth_or_array_layers: depth };
    let texture = gpu.device.create_texture(&wgpu::TextureDescriptor {
        label: Some(label),
        size,
        mip_level_count: 1,
        sample_count: 1,
        dimension,
        format,
        usage: wgpu::TextureUsages::TEXTURE_BINDING
            | wgpu::TextureUsages::COPY_DST
            | wgpu::TextureUsages::COPY_SRC,
        view_formats: &[],
    });
    let view = texture.create_view(&wgpu::TextureViewDescriptor::default());

    let staging_buf = gpu.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
        label: Some("texture staging"),
        contents: &staging,
        usage: wgpu::BufferUsages::COPY_SRC,
    });
    let mut encoder = gpu
        .device
        .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some(label) });
    encoder.copy_buffer_to_texture(
        wgpu::ImageCopyBuffer {
            buffer: &staging_buf,
            layout: wgpu::ImageDataLayout {
                offset: 0,
                bytes_per_row: Some(aligned_bytes_per_row),
                rows_per_image: Some(height),
            },
        },
        wgpu::ImageCopyTexture {
            texture: &texture,
            mip_level: 0,
            origin: wgpu::Origin3d::ZERO,
            aspect: wgpu::TextureAspect::All,
        },
        size,
    );
    gpu.queue.submit(std::iter::once(encoder.finish()));

    let validation = pollster::block_on(gpu.device.pop_error_scope());
    let oom = pollster::block_on(gpu.device.pop_error_scope());
    if let Some(err) = validation.or(oom) {
        texture.destroy();
        return Err(NufftError::Allocation { resource: label, reason: err.to_string() });
    }

    Ok(GpuTexture { texture, view, extent, format })
}

/// Read a whole texture back as texels of `T`, stripping row padding.
/// Blocks until done.
fn readback_texture<T: bytemuck::Pod>(gpu: &GpuDevice, tex: &GpuTexture) -> Result<Vec<T>> {
    let [width, height, depth] = tex.extent;
    let texel = std::mem::size_of::<T>();
    let row_bytes = width as usize * texel;
    let aligned_bytes_per_row = align_to(row_bytes as u32, COPY_ALIGNMENT);
    let rows = (height * depth) as usize;
    let readback_size = aligned_bytes_per_row as u64 * rows as u64;

    let readback_buf = gpu.device.create_buffer(&wgpu::BufferDescriptor {
        label: Some("texture readback"),
        size: readback_size,
        usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
        mapped_at_creation: false,
    });
    let mut encoder = gpu
        .device
        .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some("texture readback") });
    encoder.copy_texture_to_buffer(
        wgpu::ImageCopyTexture {
            texture: &tex.texture,
            mip_level: 0,
            origin: wgpu::Origin3d::ZERO,
            aspect: wgpu::TextureAspect::All,
        },
        wgpu::ImageCopyBuffer {
            buffer: &readback_buf,
            layout: wgpu::ImageDataLayout {
                offset: 0,
                bytes_per_row: Some(aligned_bytes_per_row),
                rows_per_image: Some(height),
            },
        },
        wgpu::Extent3d { width, height, depth_or_array_layers: depth },
    );
    gpu.queue.submit(std::iter::once(encoder.finish()));

    let mapped = map_read(gpu, &readback_buf, "texture readback")?;
    let mut out = vec![T::zeroed(); width as usize * rows];
    let dst: &mut [u8] = bytemuck::cast_slice_mut(&mut out);
    for r in 0..rows {
        let src = r * aligned_bytes_per_row as usize;
        dst[r * row_bytes..(r + 1) * row_bytes].copy_from_slice(&mapped[src..src + row_bytes]);
    }
    drop(mapped);
    readback_buf.unmap();
    Ok(out)
}

/// Map a MAP_READ buffer and wait for it.
pub(crate) fn map_read<'a>(
    gpu: &GpuDevice,
    buffer: &'a wgpu::Buffer,
    pass: &'static str,
) -> Result<wgpu::BufferView<'a>> {
    let slice = buffer.slice(..);
    let (tx, rx) = std::sync::mpsc::channel();
    slice.map_async(wgpu::MapMode::Read, move |r| {
        let _ = tx.send(r);
    });
    gpu.device.poll(wgpu::Maintain::Wait);
    rx.recv()
        .map_err(|e| NufftError::Execution { pass, reason: e.to_string() })?
        .map_err(|e| NufftError::Execution { pass, reason: e.to_string() })?;
    Ok(slice.get_mapped_range())
}

/// Round `value` up to the next multiple of `alignment`.
pub(crate) fn align_to(value: u32, alignment: u32) -> u32 {
    value.div_ceil(alignment) * alignment
}
