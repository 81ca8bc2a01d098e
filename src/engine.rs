// engine.rs — Convolution engines: gridding (adjoint) and degridding (forward).
//
// An engine owns one kernel representation (table + bounds, uploaded to
// whatever texture storage it uses) and runs the two passes against it:
//
//   adjoint   grid[c] += Σ_i  s_i · w(c - p_i)      samples → grid
//   forward   out[i]   = Σ_c  grid[c] · w(c - p_i)  grid → samples
//
// with p = (k + 0.5) · G the grid position of a normalised coordinate
// k ∈ [-0.5, 0.5), cell c centred at integer c, and indices wrapping
// periodically. Per axis only the offsets `floor(p) + bounds[bucket(f)]`
// are visited. On rank-2 problems the z axis collapses to a single cell at
// distance 0.
//
// Two implementations exist:
//
//   HostEngine           this file; rayon over sectors, software sampler,
//                        atomic float accumulation on the host
//   gpu::TextureEngine   wgpu compute, hardware (or emulated) filtering
//
// The operator picks one by `EngineKind` at construction and only talks to
// the `ConvolutionEngine` trait afterwards.
//
// NEW RUST CONCEPTS
// ─────────────────
// - `Box<dyn ConvolutionEngine>`: the engine is chosen at runtime, so the
//   operator stores a trait object instead of being generic over it.
// - `into_par_iter().flat_map_iter(...)`: each sector yields a plain
//   iterator of (slot, value) pairs; rayon concatenates them in parallel.

use num_complex::Complex32;
use rayon::prelude::*;
use tracing::{debug, trace};

use crate::bounds::MinMaxBounds;
use crate::config::{Dimensions, InterpolationMode, NufftConfig};
use crate::error::{NufftError, Result};
use crate::grid::{AtomicGrid, Grid};
use crate::kernel::KernelTable;
use crate::sector::{wrap_coordinate, SectorMap};
use crate::textures::{upload_kernel_representation, HostTextureView, HostTextures, TextureResources};

// ---------------------------------------------------------------------------
// Kernel representation
// ---------------------------------------------------------------------------

/// Everything built from a configuration before any texture is touched.
#[derive(Debug, Clone, PartialEq)]
pub struct KernelRepresentation {
    pub table: KernelTable,
    pub bounds: MinMaxBounds,
}

impl KernelRepresentation {
    pub fn build(config: &NufftConfig) -> Result<Self> {
        let table = KernelTable::build(config)?;
        let bounds = MinMaxBounds::compute(&table);
        debug!(
            effective_radius = bounds.effective_radius(),
            max_span = bounds.max_span(),
            "min/max bounds computed"
        );
        Ok(KernelRepresentation { table, bounds })
    }
}

// ---------------------------------------------------------------------------
// Engine trait
// ---------------------------------------------------------------------------

/// Which engine an operator runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EngineKind {
    /// CPU engine with the software sampler.
    Host,
    /// wgpu texture engine.
    #[default]
    Gpu,
}

/// Polymorphic convolution backend.
pub trait ConvolutionEngine: Send + Sync {
    fn interpolation_mode(&self) -> InterpolationMode;

    /// Release any held textures, then build and upload the kernel
    /// representation for `config`. All-or-nothing.
    fn rebuild(&mut self, config: &NufftConfig) -> Result<()>;

    /// Accumulate `samples` onto `grid`. Existing grid contents are kept.
    fn convolve_adjoint(
        &self,
        samples: &[Complex32],
        coords: &[[f32; 3]],
        sectors: &SectorMap,
        grid: &mut Grid,
    ) -> Result<()>;

    /// Interpolate `grid` at every coordinate into `out`.
    fn convolve_forward(
        &self,
        grid: &Grid,
        coords: &[[f32; 3]],
        sectors: &SectorMap,
        out: &mut [Complex32],
    ) -> Result<()>;

    /// Free all textures. Idempotent.
    fn release(&mut self);

    fn is_ready(&self) -> bool;
}

/// Length, shape and coordinate checks shared by every engine.
pub(crate) fn check_pass_inputs(
    grid_dims: Dimensions,
    expected_grid: Dimensions,
    n_values: usize,
    coords: &[[f32; 3]],
    sectors: &SectorMap,
) -> Result<()> {
    if grid_dims != expected_grid {
        return Err(NufftError::InvalidInput(format!(
            "grid is {grid_dims}, operator expects {expected_grid}"
        )));
    }
    if n_values != coords.len() {
        return Err(NufftError::InvalidInput(format!(
            "{n_values} sample values for {} coordinates",
            coords.len()
        )));
    }
    if sectors.num_samples() != coords.len() {
        return Err(NufftError::InvalidInput(format!(
            "sector map covers {} samples, trajectory has {}",
            sectors.num_samples(),
            coords.len()
        )));
    }
    let rank = expected_grid.rank();
    if let Some(i) = coords.iter().position(|c| c[..rank].iter().any(|v| !v.is_finite())) {
        return Err(NufftError::InvalidInput(format!("coordinate {i} is not finite")));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Per-axis footprint
// ---------------------------------------------------------------------------

/// Cells one sample touches along one axis.
#[derive(Debug, Clone, Copy)]
struct AxisSpan {
    first: i64,
    len: usize,
    pos: f32,
    extent: i64,
    inv_radius: f32,
}

impl AxisSpan {
    fn new(k: f32, extent: u32, active: bool, bounds: &MinMaxBounds, inv_radius: f32) -> Self {
        if !active {
            return AxisSpan { first: 0, len: 1, pos: 0.0, extent: 1, inv_radius: 0.0 };
        }
        let pos = (wrap_coordinate(k) + 0.5) * extent as f32;
        let base = pos.floor();
        let [min, max] = bounds.range_for(pos - base);
        AxisSpan {
            first: base as i64 + min as i64,
            len: (max - min + 1) as usize,
            pos,
            extent: extent as i64,
            inv_radius,
        }
    }

    /// Wrapped cell index and normalised distance of the `i`-th cell.
    #[inline]
    fn cell(&self, i: usize) -> (usize, f32) {
        let c = self.first + i as i64;
        let u = (c as f32 - self.pos).abs() * self.inv_radius;
        (c.rem_euclid(self.extent) as usize, u)
    }
}

fn sample_spans(k: &[f32; 3], dims: Dimensions, bounds: &MinMaxBounds, inv_radius: f32) -> [AxisSpan; 3] {
    let rank = dims.rank();
    let extent = dims.as_array();
    [0, 1, 2].map(|a| AxisSpan::new(k[a], extent[a], a < rank, bounds, inv_radius))
}

/// Visit every (linear index, weight) pair of one sample's footprint.
#[inline]
fn for_each_weight(
    spans: &[AxisSpan; 3],
    dims: Dimensions,
    view: &HostTextureView<'_>,
    mut f: impl FnMut(usize, f32),
) {
    let [sx, sy, sz] = spans;
    for iz in 0..sz.len {
        let (cz, uz) = sz.cell(iz);
        for iy in 0..sy.len {
            let (cy, uy) = sy.cell(iy);
            let row = (cz * dims.height as usize + cy) * dims.width as usize;
            for ix in 0..sx.len {
                let (cx, ux) = sx.cell(ix);
                let w = view.weight([ux, uy, uz]);
                if w != 0.0 {
                    f(row + cx, w);
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// HostEngine
// ---------------------------------------------------------------------------

/// CPU engine. Work is split per sector across the rayon pool.
#[derive(Debug)]
pub struct HostEngine {
    config: NufftConfig,
    textures: HostTextures,
}

impl HostEngine {
    pub fn new(config: &NufftConfig) -> Result<Self> {
        let mut engine = HostEngine { config: config.clone(), textures: HostTextures::new() };
        engine.rebuild(config)?;
        Ok(engine)
    }

    pub fn textures(&self) -> &HostTextures {
        &self.textures
    }

    fn inv_radius(&self) -> f32 {
        1.0 / self.config.kernel_radius()
    }
}

impl ConvolutionEngine for HostEngine {
    fn interpolation_mode(&self) -> InterpolationMode {
        self.config.interpolation
    }

    fn rebuild(&mut self, config: &NufftConfig) -> Result<()> {
        self.textures.free_min_max_bounds();
        self.textures.free_lookup_table();
        let repr = KernelRepresentation::build(config)?;
        upload_kernel_representation(&mut self.textures, &repr.table, &repr.bounds)?;
        self.config = config.clone();
        debug!(mode = config.interpolation.name(), "host engine ready");
        Ok(())
    }

    fn convolve_adjoint(
        &self,
        samples: &[Complex32],
        coords: &[[f32; 3]],
        sectors: &SectorMap,
        grid: &mut Grid,
    ) -> Result<()> {
        let view = self.textures.view().ok_or(NufftError::NotReady)?;
        let dims = self.config.grid_dims();
        check_pass_inputs(grid.dims(), dims, samples.len(), coords, sectors)?;
        let inv_radius = self.inv_radius();

        let acc = AtomicGrid::from_grid(grid);
        (0..sectors.len()).into_par_iter().for_each(|s| {
            for &i in sectors.samples_in(s) {
                let i = i as usize;
                let value = samples[i];
                let spans = sample_spans(&coords[i], dims, view.bounds, inv_radius);
                for_each_weight(&spans, dims, &view, |cell, w| acc.accumulate(cell, value * w));
            }
        });
        acc.write_into(grid);
        trace!(samples = samples.len(), sectors = sectors.len(), "host adjoint pass done");
        Ok(())
    }

    fn convolve_forward(
        &self,
        grid: &Grid,
        coords: &[[f32; 3]],
        sectors: &SectorMap,
        out: &mut [Complex32],
    ) -> Result<()> {
        let view = self.textures.view().ok_or(NufftError::NotReady)?;
        let dims = self.config.grid_dims();
        check_pass_inputs(grid.dims(), dims, out.len(), coords, sectors)?;
        let inv_radius = self.inv_radius();
        let cells = grid.as_slice();

        let values: Vec<(usize, Complex32)> = (0..sectors.len())
            .into_par_iter()
            .flat_map_iter(|s| {
                sectors.samples_in(s).iter().map(move |&i| {
                    let i = i as usize;
                    let spans = sample_spans(&coords[i], dims, view.bounds, inv_radius);
                    let mut sum = Complex32::new(0.0, 0.0);
                    for_each_weight(&spans, dims, &view, |cell, w| sum += cells[cell] * w);
                    (i, sum)
                })
            })
            .collect();
        for (i, v) in values {
            out[i] = v;
        }
        trace!(samples = out.len(), sectors = sectors.len(), "host forward pass done");
        Ok(())
    }

    fn release(&mut self) {
        self.textures.free_min_max_bounds();
        self.textures.free_lookup_table();
    }

    fn is_ready(&self) -> bool {
        self.textures.is_ready()
    }
}
