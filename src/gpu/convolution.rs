// gpu/convolution.rs — Texture-interpolated gridding and degridding on wgpu.
//
// Design overview:
//
//   TextureEngine is created once per operator. `rebuild()` builds the
//   kernel table and bounds on the host, uploads both as textures, and
//   compiles the two compute pipelines for the active interpolation mode.
//   Each `convolve_*` call uploads the per-call buffers, dispatches one
//   workgroup per sector, and reads the result back.
//
//
// SHADER SOURCE ASSEMBLY
// ──────────────────────
// The interpolation mode and the filtering capability change the shader
// text, not just a constant, so the source is assembled before compilation:
//
//   kernel_lookup.wgsl
//     {{KERNEL_TEXTURE}}  texture_2d<f32> | texture_3d<f32>
//     {{SAMPLER}}         binding 8 sampler, or nothing
//     {{FETCH}}           fetch_{2d,3d}_{filtered,software}.wgsl
//     {{KERNEL_WEIGHT}}   Table:     f(ux)·f(uy)·f(uz)
//                         Surface2D: f(ux, uy)·f(uz, 0)
//                         Volume3D:  f(ux, uy, uz)
//   grid_{adjoint,forward}.wgsl
//     {{KERNEL_LOOKUP}}   the assembled lookup source
//     {{WG_SIZE}}         1D workgroup size
//
// Both passes share one bind group layout:
//
//   0 kernel_tex   1 bounds_tex   2 params (uniform)
//   3 coords       4 sector_offsets   5 sample_order
//   6 samples (adjoint) / grid (forward)            read-only storage
//   7 grid    (adjoint) / out_samples (forward)     read-write storage
//   8 kernel_sampler                                hardware filtering only
//
//
// NEW WGPU CONCEPTS
// ─────────────────
// - **Sampling in a compute shader**: only `textureSampleLevel` is allowed
//   outside fragment shaders (no implicit derivatives). Level 0 is the only
//   mip we create.
// - **2D dispatch for a 1D problem**: a single dispatch dimension is capped
//   at 65535 workgroups, so the sector index is spread over x and y and the
//   shader discards the tail.

use std::sync::Arc;

use num_complex::Complex32;
use tracing::{debug, trace};
use wgpu::util::DeviceExt;

use crate::config::{InterpolationMode, NufftConfig};
use crate::engine::{check_pass_inputs, ConvolutionEngine, KernelRepresentation};
use crate::error::{NufftError, Result};
use crate::gpu::device::GpuDevice;
use crate::gpu::textures::{map_read, GpuTextures};
use crate::grid::Grid;
use crate::sector::SectorMap;
use crate::textures::{upload_kernel_representation, TextureResources};

// ---------------------------------------------------------------------------
// GPU-side structs (must match WGSL layout exactly, repr(C))
// ---------------------------------------------------------------------------

/// Uniform parameters for both passes. Matches `ConvParams` in
/// kernel_lookup.wgsl.
#[repr(C)]
#[derive(Copy, Clone, Debug, bytemuck::Pod, bytemuck::Zeroable)]
struct ConvParams {
    grid_dims: [u32; 4],
    n_samples: u32,
    n_sectors: u32,
    table_len: u32,
    buckets: u32,
    inv_radius: f32,
    sectors_x: u32,
    _pad0: u32,
    _pad1: u32,
}

// ---------------------------------------------------------------------------
// Shader source assembly
// ---------------------------------------------------------------------------

/// Kernel lookup source for `mode`, using the sampler when
/// `hardware_filtering` is set.
pub fn lookup_source(mode: InterpolationMode, hardware_filtering: bool) -> String {
    let (texture, fetch) = match (mode, hardware_filtering) {
        (InterpolationMode::Volume3D, true) => {
            ("texture_3d<f32>", include_str!("../shaders/fetch_3d_filtered.wgsl"))
        }
        (InterpolationMode::Volume3D, false) => {
            ("texture_3d<f32>", include_str!("../shaders/fetch_3d_software.wgsl"))
        }
        (_, true) => ("texture_2d<f32>", include_str!("../shaders/fetch_2d_filtered.wgsl")),
        (_, false) => ("texture_2d<f32>", include_str!("../shaders/fetch_2d_software.wgsl")),
    };
    let weight = match mode {
        InterpolationMode::Table => {
            "fetch_kernel(vec2<f32>(u.x, 0.0)) * fetch_kernel(vec2<f32>(u.y, 0.0)) \
             * fetch_kernel(vec2<f32>(u.z, 0.0))"
        }
        InterpolationMode::Surface2D => "fetch_kernel(u.xy) * fetch_kernel(vec2<f32>(u.z, 0.0))",
        InterpolationMode::Volume3D => "fetch_kernel(u)",
    };
    let sampler = if hardware_filtering {
        "@group(0) @binding(8) var kernel_sampler: sampler;"
    } else {
        ""
    };
    include_str!("../shaders/kernel_lookup.wgsl")
        .replace("{{KERNEL_TEXTURE}}", texture)
        .replace("{{SAMPLER}}", sampler)
        .replace("{{FETCH}}", fetch)
        .replace("{{KERNEL_WEIGHT}}", weight)
}

fn pass_source(template: &str, lookup: &str, wg_size: u32) -> String {
    template
        .replace("{{KERNEL_LOOKUP}}", lookup)
        .replace("{{WG_SIZE}}", &wg_size.to_string())
}

// ---------------------------------------------------------------------------
// Pipelines
// ---------------------------------------------------------------------------

struct Pipelines {
    adjoint: wgpu::ComputePipeline,
    forward: wgpu::ComputePipeline,
    bgl: wgpu::BindGroupLayout,
    sampler: Option<wgpu::Sampler>,
}

impl Pipelines {
    fn new(gpu: &GpuDevice, mode: InterpolationMode) -> Result<Self> {
        let hw = gpu.hardware_filtering;
        let wg = gpu.workgroup_size.invocations;
        let lookup = lookup_source(mode, hw);

        gpu.device.push_error_scope(wgpu::ErrorFilter::Validation);

        let kernel_view_dim = match mode {
            InterpolationMode::Volume3D => wgpu::TextureViewDimension::D3,
            _ => wgpu::TextureViewDimension::D2,
        };
        let storage = |binding: u32, read_only: bool| wgpu::BindGroupLayoutEntry {
            binding,
            visibility: wgpu::ShaderStages::COMPUTE,
            ty: wgpu::BindingType::Buffer {
                ty: wgpu::BufferBindingType::Storage { read_only },
                has_dynamic_offset: false,
                min_binding_size: None,
            },
            count: None,
        };
        let mut entries = vec![
            // 0 — kernel_tex
            wgpu::BindGroupLayoutEntry {
                binding: 0,
                visibility: wgpu::ShaderStages::COMPUTE,
                ty: wgpu::BindingType::Texture {
                    multisampled: false,
                    view_dimension: kernel_view_dim,
                    sample_type: wgpu::TextureSampleType::Float { filterable: hw },
                },
                count: None,
            },
            // 1 — bounds_tex
            wgpu::BindGroupLayoutEntry {
                binding: 1,
                visibility: wgpu::ShaderStages::COMPUTE,
                ty: wgpu::BindingType::Texture {
                    multisampled: false,
                    view_dimension: wgpu::TextureViewDimension::D2,
                    sample_type: wgpu::TextureSampleType::Sint,
                },
                count: None,
            },
            // 2 — params
            wgpu::BindGroupLayoutEntry {
                binding: 2,
                visibility: wgpu::ShaderStages::COMPUTE,
                ty: wgpu::BindingType::Buffer {
                    ty: wgpu::BufferBindingType::Uniform,
                    has_dynamic_offset: false,
                    min_binding_size: None,
                },
                count: None,
            },
            storage(3, true),
            storage(4, true),
            storage(5, true),
            storage(6, true),
            storage(7, false),
        ];
        if hw {
            // 8 — kernel_sampler
            entries.push(wgpu::BindGroupLayoutEntry {
                binding: 8,
                visibility: wgpu::ShaderStages::COMPUTE,
                ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Filtering),
                count: None,
            });
        }
        let bgl = gpu.device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("TextureEngine BGL"),
            entries: &entries,
        });
        let layout = gpu.device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("TextureEngine pipeline layout"),
            bind_group_layouts: &[&bgl],
            push_constant_ranges: &[],
        });

        let build = |label: &'static str, template: &str| {
            let module = gpu.device.create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some(label),
                source: wgpu::ShaderSource::Wgsl(pass_source(template, &lookup, wg).into()),
            });
            gpu.device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label: Some(label),
                layout: Some(&layout),
                module: &module,
                entry_point: Some(label),
                compilation_options: wgpu::PipelineCompilationOptions::default(),
                cache: None,
            })
        };
        let adjoint = build("grid_adjoint", include_str!("../shaders/grid_adjoint.wgsl"));
        let forward = build("grid_forward", include_str!("../shaders/grid_forward.wgsl"));

        let sampler = hw.then(|| {
            gpu.device.create_sampler(&wgpu::SamplerDescriptor {
                label: Some("kernel sampler"),
                address_mode_u: wgpu::AddressMode::ClampToEdge,
                address_mode_v: wgpu::AddressMode::ClampToEdge,
                address_mode_w: wgpu::AddressMode::ClampToEdge,
                mag_filter: wgpu::FilterMode::Linear,
                min_filter: wgpu::FilterMode::Linear,
                mipmap_filter: wgpu::FilterMode::Nearest,
                ..Default::default()
            })
        });

        if let Some(err) = pollster::block_on(gpu.device.pop_error_scope()) {
            return Err(NufftError::Execution { pass: "pipeline compilation", reason: err.to_string() });
        }
        debug!(mode = mode.name(), hardware_filtering = hw, workgroup = wg, "convolution pipelines compiled");
        Ok(Pipelines { adjoint, forward, bgl, sampler })
    }
}

// ---------------------------------------------------------------------------
// TextureEngine
// ---------------------------------------------------------------------------

/// GPU convolution engine backed by texture lookups.
pub struct TextureEngine {
    gpu: Arc<GpuDevice>,
    config: NufftConfig,
    textures: GpuTextures,
    pipelines: Option<Pipelines>,
    table_len: u32,
    buckets: u32,
}

impl TextureEngine {
    pub fn new(gpu: Arc<GpuDevice>, config: &NufftConfig) -> Result<Self> {
        let mut engine = TextureEngine {
            textures: GpuTextures::new(gpu.clone()),
            gpu,
            config: config.clone(),
            pipelines: None,
            table_len: 0,
            buckets: 0,
        };
        engine.rebuild(config)?;
        Ok(engine)
    }

    pub fn textures(&self) -> &GpuTextures {
        &self.textures
    }

    pub fn device(&self) -> &Arc<GpuDevice> {
        &self.gpu
    }

    /// Upload the per-call buffers, run `pipeline` over every sector and
    /// copy binding 7 back into `output`. `output` is left untouched on
    /// error.
    fn dispatch<T: bytemuck::Pod>(
        &self,
        pass: &'static str,
        pipeline: &wgpu::ComputePipeline,
        coords: &[[f32; 3]],
        sectors: &SectorMap,
        input: &[u8],
        output: &mut [T],
    ) -> Result<()> {
        let pipelines = self.pipelines.as_ref().ok_or(NufftError::NotReady)?;
        let (kernel, bounds) = match (self.textures.kernel(), self.textures.bounds()) {
            (Some(k), Some(b)) => (k, b),
            _ => return Err(NufftError::NotReady),
        };
        let gpu = &self.gpu;

        let out_bytes: &mut [u8] = bytemuck::cast_slice_mut(output);
        let largest = (input.len().max(out_bytes.len())) as u64;
        if largest > gpu.max_storage_binding() {
            return Err(NufftError::Allocation {
                resource: "convolution buffers",
                reason: format!("{largest} bytes exceeds the storage binding limit"),
            });
        }

        let dims = self.config.grid_dims();
        let (sectors_x, sectors_y) = gpu.dispatch_sectors(sectors.len() as u32);
        let params = ConvParams {
            grid_dims: [dims.width, dims.height, dims.depth, dims.rank() as u32],
            n_samples: coords.len() as u32,
            n_sectors: sectors.len() as u32,
            table_len: self.table_len,
            buckets: self.buckets,
            inv_radius: 1.0 / self.config.kernel_radius(),
            sectors_x,
            _pad0: 0,
            _pad1: 0,
        };

        gpu.device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
        gpu.device.push_error_scope(wgpu::ErrorFilter::Validation);

        let init = |label: &'static str, contents: &[u8], usage: wgpu::BufferUsages| {
            gpu.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some(label),
                contents,
                usage,
            })
        };
        let params_buf = init("conv params", bytemuck::bytes_of(&params), wgpu::BufferUsages::UNIFORM);
        let coords_buf = init("coords", bytemuck::cast_slice(coords), wgpu::BufferUsages::STORAGE);
        let offsets_buf = init("sector offsets", bytemuck::cast_slice(sectors.offsets()), wgpu::BufferUsages::STORAGE);
        let order_buf = init("sample order", bytemuck::cast_slice(sectors.sample_order()), wgpu::BufferUsages::STORAGE);
        let input_buf = init(pass, input, wgpu::BufferUsages::STORAGE);
        let output_buf = init(
            pass,
            &*out_bytes,
            wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC,
        );
        let rb_buf = gpu.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("convolution readback"),
            size: out_bytes.len() as u64,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let mut entries = vec![
            wgpu::BindGroupEntry { binding: 0, resource: wgpu::BindingResource::TextureView(&kernel.view) },
            wgpu::BindGroupEntry { binding: 1, resource: wgpu::BindingResource::TextureView(&bounds.view) },
            wgpu::BindGroupEntry { binding: 2, resource: params_buf.as_entire_binding() },
            wgpu::BindGroupEntry { binding: 3, resource: coords_buf.as_entire_binding() },
            wgpu::BindGroupEntry { binding: 4, resource: offsets_buf.as_entire_binding() },
            wgpu::BindGroupEntry { binding: 5, resource: order_buf.as_entire_binding() },
            wgpu::BindGroupEntry { binding: 6, resource: input_buf.as_entire_binding() },
            wgpu::BindGroupEntry { binding: 7, resource: output_buf.as_entire_binding() },
        ];
        if let Some(sampler) = &pipelines.sampler {
            entries.push(wgpu::BindGroupEntry { binding: 8, resource: wgpu::BindingResource::Sampler(sampler) });
        }
        let bind_group = gpu.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some(pass),
            layout: &pipelines.bgl,
            entries: &entries,
        });

        let mut encoder = gpu
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some(pass) });
        {
            let mut cpass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some(pass),
                timestamp_writes: None,
            });
            cpass.set_pipeline(pipeline);
            cpass.set_bind_group(0, &bind_group, &[]);
            cpass.dispatch_workgroups(sectors_x, sectors_y, 1);
        }
        encoder.copy_buffer_to_buffer(&output_buf, 0, &rb_buf, 0, out_bytes.len() as u64);
        gpu.queue.submit(std::iter::once(encoder.finish()));

        let validation = pollster::block_on(gpu.device.pop_error_scope());
        let oom = pollster::block_on(gpu.device.pop_error_scope());
        if let Some(err) = validation.or(oom) {
            return Err(NufftError::Execution { pass, reason: err.to_string() });
        }

        let mapped = map_read(gpu, &rb_buf, pass)?;
        out_bytes.copy_from_slice(&mapped);
        drop(mapped);
        rb_buf.unmap();

        trace!(pass, samples = coords.len(), sectors = sectors.len(), sectors_x, sectors_y, "dispatch done");
        Ok(())
    }
}

impl ConvolutionEngine for TextureEngine {
    fn interpolation_mode(&self) -> InterpolationMode {
        self.config.interpolation
    }

    fn rebuild(&mut self, config: &NufftConfig) -> Result<()> {
        self.release();
        let repr = KernelRepresentation::build(config)?;
        upload_kernel_representation(&mut self.textures, &repr.table, &repr.bounds)?;
        match Pipelines::new(&self.gpu, config.interpolation) {
            Ok(p) => self.pipelines = Some(p),
            Err(e) => {
                self.release();
                return Err(e);
            }
        }
        self.config = config.clone();
        self.table_len = repr.table.entries() as u32;
        self.buckets = repr.bounds.buckets() as u32;
        Ok(())
    }

    fn convolve_adjoint(
        &self,
        samples: &[Complex32],
        coords: &[[f32; 3]],
        sectors: &SectorMap,
        grid: &mut Grid,
    ) -> Result<()> {
        let pipelines = self.pipelines.as_ref().ok_or(NufftError::NotReady)?;
        check_pass_inputs(grid.dims(), self.config.grid_dims(), samples.len(), coords, sectors)?;
        if coords.is_empty() {
            return Ok(());
        }
        self.dispatch(
            "adjoint",
            &pipelines.adjoint,
            coords,
            sectors,
            bytemuck::cast_slice(samples),
            grid.as_mut_slice(),
        )
    }

    fn convolve_forward(
        &self,
        grid: &Grid,
        coords: &[[f32; 3]],
        sectors: &SectorMap,
        out: &mut [Complex32],
    ) -> Result<()> {
        let pipelines = self.pipelines.as_ref().ok_or(NufftError::NotReady)?;
        check_pass_inputs(grid.dims(), self.config.grid_dims(), out.len(), coords, sectors)?;
        if coords.is_empty() {
            return Ok(());
        }
        out.fill(Complex32::new(0.0, 0.0));
        self.dispatch(
            "forward",
            &pipelines.forward,
            coords,
            sectors,
            bytemuck::cast_slice(grid.as_slice()),
            out,
        )
    }

    fn release(&mut self) {
        self.pipelines = None;
        self.textures.free_min_max_bounds();
        self.textures.free_lookup_table();
    }

    fn is_ready(&self) -> bool {
        self.pipelines.is_some() && self.textures.is_ready()
    }
}
