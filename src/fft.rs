// fft.rs — FFT stage between the grid and the image.
//
// The convolution core does not own FFT math. The operator only needs
// something that moves a centred complex volume between grid space and
// image space, so that seam is a trait. `RustFft` is the production
// backend. `NaiveDft` is a direct O(n²) separable DFT kept as a reference
// to check it against.
//
// CONVENTION
// ──────────
// Both domains are centred: index n on an axis of length M represents
// n - M/2. Per axis
//
//   forward   X[m] = 1/sqrt(M) · Σ_n x[n] · exp(-2πi (m - M/2)(n - M/2) / M)
//   inverse   x[n] = 1/sqrt(M) · Σ_m X[m] · exp(+2πi (m - M/2)(n - M/2) / M)
//
// so the pair is unitary and `inverse` is the exact adjoint of `forward`.
// Axes of extent 1 are left alone.
//
// NEW RUST CONCEPTS
// ─────────────────
// - `rustfft::FftPlanner`: builds an `Arc<dyn Fft<f32>>` for one length and
//   direction. `Fft` requires `Send + Sync`, so one cached plan serves every
//   line of an axis across the rayon pool.
// - `slice::rotate_left` / `rotate_right`: the in-place ifftshift / fftshift
//   that turn the centred convention into the FFT's zero-based one.
// - `map_init`: one scratch buffer per rayon worker instead of per line.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use num_complex::{Complex32, Complex64};
use rayon::prelude::*;
use rustfft::{Fft, FftDirection, FftPlanner};

use crate::config::Dimensions;

/// Grid ⇄ image transform used by the operator.
pub trait FftBackend: Send + Sync {
    /// Image → grid, in place.
    fn forward(&self, data: &mut [Complex32], dims: Dimensions);
    /// Grid → image, in place.
    fn inverse(&self, data: &mut [Complex32], dims: Dimensions);
}

// ---------------------------------------------------------------------------
// RustFft
// ---------------------------------------------------------------------------

/// Separable centred FFT on `rustfft`. Plans are built once per axis
/// length and direction, then cached.
pub struct RustFft {
    plans: Mutex<HashMap<(usize, bool), Arc<dyn Fft<f32>>>>,
}

impl RustFft {
    pub fn new() -> Self {
        RustFft { plans: Mutex::new(HashMap::new()) }
    }

    fn plan(&self, len: usize, direction: FftDirection) -> Arc<dyn Fft<f32>> {
        // A poisoned cache still holds valid plans.
        let mut plans = self.plans.lock().unwrap_or_else(|p| p.into_inner());
        let key = (len, direction == FftDirection::Inverse);
        plans
            .entry(key)
            .or_insert_with(|| FftPlanner::new().plan_fft(len, direction))
            .clone()
    }

    fn transform(&self, data: &mut [Complex32], dims: Dimensions, direction: FftDirection) {
        assert_eq!(data.len(), dims.count(), "buffer does not match {dims}");
        for axis in 0..3 {
            let n = dims.as_array()[axis] as usize;
            if n <= 1 {
                continue;
            }
            let plan = self.plan(n, direction);
            let centre = n / 2;
            let scale = 1.0 / (n as f32).sqrt();
            map_lines(
                data,
                dims,
                axis,
                || vec![Complex32::new(0.0, 0.0); plan.get_inplace_scratch_len()],
                |scratch, line| {
                    line.rotate_left(centre);
                    plan.process_with_scratch(line, scratch);
                    line.rotate_right(centre);
                    for v in line.iter_mut() {
                        *v *= scale;
                    }
                },
            );
        }
    }
}

impl Default for RustFft {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for RustFft {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("RustFft")
    }
}

impl FftBackend for RustFft {
    fn forward(&self, data: &mut [Complex32], dims: Dimensions) {
        self.transform(data, dims, FftDirection::Forward);
    }

    fn inverse(&self, data: &mut [Complex32], dims: Dimensions) {
        self.transform(data, dims, FftDirection::Inverse);
    }
}

// ---------------------------------------------------------------------------
// NaiveDft
// ---------------------------------------------------------------------------

/// Separable direct DFT with centred indexing. Reference for `RustFft`.
#[derive(Debug, Clone, Copy, Default)]
pub struct NaiveDft;

impl FftBackend for NaiveDft {
    fn forward(&self, data: &mut [Complex32], dims: Dimensions) {
        naive_transform(data, dims, -1.0);
    }

    fn inverse(&self, data: &mut [Complex32], dims: Dimensions) {
        naive_transform(data, dims, 1.0);
    }
}

fn naive_transform(data: &mut [Complex32], dims: Dimensions, sign: f64) {
    assert_eq!(data.len(), dims.count(), "buffer does not match {dims}");
    for axis in 0..3 {
        let n = dims.as_array()[axis] as usize;
        if n <= 1 {
            continue;
        }
        let twiddles: Vec<Complex64> = (0..n)
            .map(|t| Complex64::from_polar(1.0, sign * 2.0 * std::f64::consts::PI * t as f64 / n as f64))
            .collect();
        map_lines(data, dims, axis, || (), |_, line| {
            let out = dft_line(line, &twiddles);
            line.copy_from_slice(&out);
        });
    }
}

fn dft_line(line: &[Complex32], twiddles: &[Complex64]) -> Vec<Complex32> {
    let n = line.len() as i64;
    let c = n / 2;
    let scale = 1.0 / (n as f64).sqrt();
    (0..n)
        .map(|m| {
            let sum: Complex64 = line
                .iter()
                .enumerate()
                .map(|(j, x)| {
                    let t = ((m - c) * (j as i64 - c)).rem_euclid(n) as usize;
                    Complex64::new(x.re as f64, x.im as f64) * twiddles[t]
                })
                .sum();
            let v = sum * scale;
            Complex32::new(v.re as f32, v.im as f32)
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Line iteration
// ---------------------------------------------------------------------------

/// Apply `op` to every line along `axis`, in parallel. Each line is
/// gathered into a contiguous buffer and scattered back afterwards.
fn map_lines<S, I, F>(data: &mut [Complex32], dims: Dimensions, axis: usize, init: I, op: F)
where
    I: Fn() -> S + Sync + Send,
    F: Fn(&mut S, &mut [Complex32]) + Sync + Send,
{
    let n = dims.as_array()[axis] as usize;
    let stride = match axis {
        0 => 1,
        1 => dims.width as usize,
        _ => dims.width as usize * dims.height as usize,
    };

    // Every line along `axis` starts where that axis' coordinate is 0.
    let starts: Vec<usize> = (0..data.len()).filter(|&i| (i / stride) % n == 0).collect();
    let src: &[Complex32] = data;
    let lines: Vec<Vec<Complex32>> = starts
        .par_iter()
        .map_init(init, |state, &s| {
            let mut line: Vec<Complex32> = (0..n).map(|j| src[s + j * stride]).collect();
            op(state, &mut line);
            line
        })
        .collect();

    for (&s, line) in starts.iter().zip(lines) {
        for (j, v) in line.into_iter().enumerate() {
            data[s + j * stride] = v;
        }
    }
}
