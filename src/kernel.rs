// kernel.rs — Kaiser–Bessel gridding kernel and its tabulated forms.
//
// The convolution engines never evaluate the kernel analytically on the hot
// path. They read it from a precomputed table through a (hardware or
// emulated) linear-filtering texture unit. This module builds that table.
//
// KERNEL
// ──────
//   k(u) = I0(β·sqrt(1 - u²)) / I0(β)     for |u| < 1, else 0
//   u    = distance / (W / 2)             (W = kernel width in grid cells)
//   β    = π·sqrt(max(0, (W/osf)²·(osf - 0.5)² - 0.8))
//
// k(0) = 1 is the peak. For W = 1 the radicand is negative, β clamps to 0
// and the kernel degenerates to a box over the nearest cell.
//
// TABLE RESOLUTION
// ────────────────
// The 1D table has `floor(0.91 / (osf·1e-3)) · osf · W/2` entries spanning
// u ∈ [0, 1]; entry i sits at u = i / (n - 1) and the last entry is forced
// to exactly 0 so clamp-to-edge addressing yields 0 outside the support.
// The multi-axis forms store outer products of that profile. Their per-axis
// resolution is capped (a 2D surface at 2048², a 3D volume at 128³), and the
// coarser sampling trades a little interpolation accuracy for texture
// memory.
//
// NEW RUST CONCEPTS
// ─────────────────
// - Private helper functions returning `f64` while the table stores `f32`:
//   the reference is computed in double precision once, then narrowed, so
//   the only error left in the table is the final rounding.

use tracing::debug;

use crate::config::{InterpolationMode, NufftConfig};
use crate::error::ConfigError;

/// Target aliasing error used to size the 1D table.
pub const MAXIMUM_ALIASING_ERROR: f64 = 0.001;

/// Per-axis cap for `Surface2D` tables.
pub const SURFACE_MAX_ENTRIES: usize = 2048;

/// Per-axis cap for `Volume3D` tables.
pub const VOLUME_MAX_ENTRIES: usize = 128;

// ---------------------------------------------------------------------------
// Reference kernel
// ---------------------------------------------------------------------------

/// Continuous Kaiser–Bessel kernel for a given width and oversampling.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct KaiserBessel {
    width: u32,
    osf: f32,
    beta: f64,
    i0_beta: f64,
}

impl KaiserBessel {
    pub fn new(width: u32, osf: f32) -> Self {
        let w = width as f64;
        let o = osf as f64;
        let radicand = (w / o).powi(2) * (o - 0.5).powi(2) - 0.8;
        let beta = std::f64::consts::PI * radicand.max(0.0).sqrt();
        KaiserBessel { width, osf, beta, i0_beta: bessel_i0(beta) }
    }

    pub fn beta(&self) -> f64 {
        self.beta
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn osf(&self) -> f32 {
        self.osf
    }

    /// Support radius in grid cells.
    pub fn radius(&self) -> f64 {
        self.width as f64 / 2.0
    }

    /// Kernel value at normalised distance `u` (1.0 = support edge).
    pub fn eval(&self, u: f64) -> f64 {
        let u = u.abs();
        if u >= 1.0 {
            return 0.0;
        }
        bessel_i0(self.beta * (1.0 - u * u).sqrt()) / self.i0_beta
    }

    /// Kernel value at a distance measured in grid cells.
    pub fn eval_distance(&self, d: f64) -> f64 {
        self.eval(d / self.radius())
    }
}

/// Modified Bessel function of the first kind, order zero.
///
/// Power series Σ ((x/2)^k / k!)², summed until a term no longer moves the
/// result. Converges quickly for the β range used here (β < 60).
pub fn bessel_i0(x: f64) -> f64 {
    let half = x / 2.0;
    let mut term = 1.0;
    let mut sum = 1.0;
    let mut k = 1.0;
    loop {
        term *= half / k;
        let t2 = term * term;
        sum += t2;
        if t2 < sum * 1e-16 {
            break;
        }
        k += 1.0;
    }
    sum
}

/// Number of 1D table entries for a kernel width and oversampling factor.
pub fn table_entries(width: u32, osf: f32) -> usize {
    let kernel_osf = (0.91 / (osf as f64 * MAXIMUM_ALIASING_ERROR)).floor();
    let radius_osr = osf as f64 * width as f64 / 2.0;
    ((kernel_osf * radius_osr).floor() as usize).max(2)
}

// ---------------------------------------------------------------------------
// KernelTable
// ---------------------------------------------------------------------------

/// Precomputed kernel weights in the layout of the selected interpolation
/// mode. Immutable once built.
///
/// Layout is row-major with x fastest: `data[(k * n + j) * n + i]` for a
/// volume, `data[j * n + i]` for a surface, `data[i]` for a table.
#[derive(Debug, Clone, PartialEq)]
pub struct KernelTable {
    mode: InterpolationMode,
    kernel: KaiserBessel,
    entries: usize,
    data: Vec<f32>,
}

impl KernelTable {
    /// Tabulate the kernel described by `config`.
    pub fn build(config: &NufftConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let kernel = KaiserBessel::new(config.kernel_width, config.osf);
        let full = table_entries(config.kernel_width, config.osf);
        let mode = config.interpolation;

        let entries = match mode {
            InterpolationMode::Table => full,
            InterpolationMode::Surface2D => full.min(SURFACE_MAX_ENTRIES),
            InterpolationMode::Volume3D => full.min(VOLUME_MAX_ENTRIES),
        };

        let profile = tabulate_profile(&kernel, entries);
        let data = match mode {
            InterpolationMode::Table => profile,
            InterpolationMode::Surface2D => {
                let mut data = Vec::with_capacity(entries * entries);
                for &py in &profile {
                    data.extend(profile.iter().map(|&px| px * py));
                }
                data
            }
            InterpolationMode::Volume3D => {
                let mut data = Vec::with_capacity(entries * entries * entries);
                for &pz in &profile {
                    for &py in &profile {
                        let pzy = pz * py;
                        data.extend(profile.iter().map(|&px| px * pzy));
                    }
                }
                data
            }
        };

        debug!(
            mode = mode.name(),
            width = config.kernel_width,
            beta = kernel.beta(),
            entries,
            values = data.len(),
            "kernel table built"
        );

        Ok(KernelTable { mode, kernel, entries, data })
    }

    pub fn mode(&self) -> InterpolationMode {
        self.mode
    }

    pub fn kernel(&self) -> &KaiserBessel {
        &self.kernel
    }

    /// Entries along each tabulated axis.
    pub fn entries(&self) -> usize {
        self.entries
    }

    /// Texture extent `[x, y, z]`. Unused axes have extent 1.
    pub fn extent(&self) -> [usize; 3] {
        let n = self.entries;
        match self.mode {
            InterpolationMode::Table => [n, 1, 1],
            InterpolationMode::Surface2D => [n, n, 1],
            InterpolationMode::Volume3D => [n, n, n],
        }
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }

    pub fn size_bytes(&self) -> usize {
        self.data.len() * std::mem::size_of::<f32>()
    }

    /// Normalised distance at table index `i`.
    pub fn u_at(&self, i: usize) -> f64 {
        i as f64 / (self.entries - 1) as f64
    }

    /// Along-axis profile (the first row of the table).
    pub fn profile(&self) -> &[f32] {
        &self.data[..self.entries]
    }

    /// Reference kernel value at a tabulated position.
    pub fn reference_at(&self, index: [usize; 3]) -> f64 {
        let rank = self.mode.table_rank();
        index[..rank]
            .iter()
            .map(|&i| self.kernel.eval(self.u_at(i)))
            .product()
    }

    /// Largest |table - reference| over every tabulated point.
    pub fn max_tabulation_error(&self) -> f64 {
        let [nx, ny, nz] = self.extent();
        let reference: Vec<f64> = (0..self.entries).map(|i| self.kernel.eval(self.u_at(i))).collect();
        let axis = |extent: usize, i: usize| if extent > 1 { reference[i] } else { 1.0 };
        let mut max_err = 0.0f64;
        for k in 0..nz {
            for j in 0..ny {
                let rkj = axis(nz, k) * axis(ny, j);
                for i in 0..nx {
                    let v = self.data[(k * ny + j) * nx + i] as f64;
                    max_err = max_err.max((v - rkj * reference[i]).abs());
                }
            }
        }
        max_err
    }
}

fn tabulate_profile(kernel: &KaiserBessel, entries: usize) -> Vec<f32> {
    let last = entries - 1;
    let mut profile: Vec<f32> = (0..entries)
        .map(|i| kernel.eval(i as f64 / last as f64) as f32)
        .collect();
    profile[last] = 0.0;
    profile
}
