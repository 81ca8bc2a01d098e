// grid.rs — Complex-valued oversampled grid and commutative accumulation.
//
// `Grid` is the plain container: row-major, x fastest, one `Complex32` per
// cell. It doubles as the image type after the FFT stage since both are
// just complex volumes with an extent.
//
// CONCURRENT ACCUMULATION
// ───────────────────────
// Adjoint convolution scatters many samples onto shared cells. Workers must
// not lock per cell, and the result must not depend on which worker runs
// first. `AtomicGrid` stores each real/imaginary component as the bit
// pattern of an f32 inside an `AtomicU32` and adds with a compare-exchange
// loop:
//
//   loop {
//       old = load(cell)
//       new = bits(f32(old) + value)
//       if compare_exchange(cell, old, new) succeeded { break }
//   }
//
// This is the same primitive the GPU shader uses (WGSL has no atomic<f32>).
// Addition is commutative, so every interleaving produces the same sum up
// to floating-point reassociation.
//
// NEW RUST CONCEPTS
// ─────────────────
// - `AtomicU32::compare_exchange_weak`: may fail spuriously, which is why
//   it always sits inside a loop.
// - `Ordering::Relaxed`: sufficient here: every cell is independent and
//   the rayon join at the end of the pass provides the happens-before edge
//   for the final read.

use std::sync::atomic::{AtomicU32, Ordering};

use num_complex::Complex32;

use crate::config::Dimensions;

// ---------------------------------------------------------------------------
// Grid
// ---------------------------------------------------------------------------

/// A complex volume with explicit extent.
#[derive(Debug, Clone, PartialEq)]
pub struct Grid {
    dims: Dimensions,
    data: Vec<Complex32>,
}

impl Grid {
    /// Zero-filled grid.
    pub fn zeros(dims: Dimensions) -> Self {
        Grid { dims, data: vec![Complex32::new(0.0, 0.0); dims.count()] }
    }

    /// Wrap existing data. Panics if the length does not match `dims`.
    pub fn from_vec(dims: Dimensions, data: Vec<Complex32>) -> Self {
        assert_eq!(
            data.len(),
            dims.count(),
            "grid data length {} does not match {dims}",
            data.len()
        );
        Grid { dims, data }
    }

    pub fn dims(&self) -> Dimensions {
        self.dims
    }

    pub fn as_slice(&self) -> &[Complex32] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [Complex32] {
        &mut self.data
    }

    pub fn into_vec(self) -> Vec<Complex32> {
        self.data
    }

    #[inline]
    pub fn get(&self, x: u32, y: u32, z: u32) -> Complex32 {
        self.data[self.dims.index(x, y, z)]
    }

    #[inline]
    pub fn set(&mut self, x: u32, y: u32, z: u32, v: Complex32) {
        let i = self.dims.index(x, y, z);
        self.data[i] = v;
    }

    pub fn fill(&mut self, v: Complex32) {
        self.data.iter_mut().for_each(|c| *c = v);
    }

    /// Iterate over `(linear_index, value)` for every non-zero cell.
    pub fn nonzero(&self) -> impl Iterator<Item = (usize, Complex32)> + '_ {
        self.data
            .iter()
            .copied()
            .enumerate()
            .filter(|(_, v)| v.re != 0.0 || v.im != 0.0)
    }

    /// Sum of |v|² over all cells.
    pub fn energy(&self) -> f64 {
        self.data.iter().map(|v| v.norm_sqr() as f64).sum()
    }
}

// ---------------------------------------------------------------------------
// AtomicGrid
// ---------------------------------------------------------------------------

/// Shared-mutable grid supporting lock-free commutative accumulation.
pub struct AtomicGrid {
    dims: Dimensions,
    /// Interleaved re/im bit patterns.
    cells: Vec<AtomicU32>,
}

impl AtomicGrid {
    /// Start from the current contents of `grid` (accumulation is in place).
    pub fn from_grid(grid: &Grid) -> Self {
        let cells = grid
            .as_slice()
            .iter()
            .flat_map(|c| [AtomicU32::new(c.re.to_bits()), AtomicU32::new(c.im.to_bits())])
            .collect();
        AtomicGrid { dims: grid.dims(), cells }
    }

    pub fn dims(&self) -> Dimensions {
        self.dims
    }

    /// Add `value` into cell `index`. Order-independent across threads.
    #[inline]
    pub fn accumulate(&self, index: usize, value: Complex32) {
        atomic_add_f32(&self.cells[2 * index], value.re);
        atomic_add_f32(&self.cells[2 * index + 1], value.im);
    }

    /// Copy the accumulated values back into `grid`.
    pub fn write_into(self, grid: &mut Grid) {
        debug_assert_eq!(grid.dims(), self.dims);
        for (dst, pair) in grid.as_mut_slice().iter_mut().zip(self.cells.chunks_exact(2)) {
            *dst = Complex32::new(
                f32::from_bits(pair[0].load(Ordering::Relaxed)),
                f32::from_bits(pair[1].load(Ordering::Relaxed)),
            );
        }
    }
}

#[inline]
fn atomic_add_f32(cell: &AtomicU32, value: f32) {
    let mut old = cell.load(Ordering::Relaxed);
    loop {
        let new = (f32::from_bits(old) + value).to_bits();
        match cell.compare_exchange_weak(old, new, Ordering::Relaxed, Ordering::Relaxed) {
            Ok(_) => break,
            Err(current) => old = current,
        }
    }
}
