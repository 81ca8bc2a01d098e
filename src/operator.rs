// operator.rs — NUFFT operator: convolution + FFT + deapodization.
//
// Construction does all the expensive, fallible work once:
//
//   validate config → bin trajectory into sectors → pick engine
//   → engine builds + uploads kernel table and bounds (all-or-nothing)
//   → precompute deapodization factors
//
// after which the operator sits in `Ready` and serves any number of
// adjoint / forward calls.
//
// STATE MACHINE
// ─────────────
//   Ready ──perform_*──► Executing ──(success or error)──► Ready
//   Ready ──release──► Released   (terminal; every later call → Released)
//
// PIPELINE
// ────────
//   adjoint   k-space ─conv─► grid ─IDFT─► crop ─÷D─► image
//   forward   image ─÷D─► pad ─DFT─► grid ─conv─► k-space
//
// `OutputMode` stops the adjoint early (returning the grid or the
// un-deapodized image) and tells the forward pass which stage its input
// belongs to. Cropping keeps the image centred on the grid centre:
// image index x sits at grid index x + G/2 - I/2 on every axis.
//
// DEAPODIZATION
// ─────────────
// D is the image-domain footprint of the kernel: grid a unit sample at
// k = 0, inverse-transform, crop. Dividing by D undoes the apodization the
// convolution introduced, so a unit sample at the origin reconstructs a
// flat image of ones. D is real up to rounding. Values too close to zero
// are clamped to keep the division bounded.

use std::sync::Arc;

use num_complex::Complex32;
use tracing::{debug, info, warn};

use crate::config::{Dimensions, NufftConfig, OutputMode};
use crate::engine::{ConvolutionEngine, EngineKind, HostEngine};
use crate::error::{NufftError, Result};
use crate::fft::{FftBackend, RustFft};
use crate::gpu::convolution::TextureEngine;
use crate::gpu::device::GpuDevice;
use crate::grid::Grid;
use crate::sector::SectorMap;

/// Smallest |D| relative to its peak that is divided by as-is.
const DEAPODIZATION_FLOOR: f32 = 1e-6;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperatorState {
    Ready,
    Executing,
    Released,
}

/// A NUFFT operator bound to one trajectory.
pub struct NufftOperator {
    config: NufftConfig,
    coords: Vec<[f32; 3]>,
    sectors: SectorMap,
    engine: Box<dyn ConvolutionEngine>,
    fft: Box<dyn FftBackend>,
    deapodization: Vec<f32>,
    state: OperatorState,
}

impl NufftOperator {
    /// Build an operator on the requested engine with the `rustfft` backend.
    ///
    /// `trajectory` holds normalised coordinates in [-0.5, 0.5); the z
    /// component is ignored for 2D images.
    pub fn new(config: &NufftConfig, trajectory: Vec<[f32; 3]>, kind: EngineKind) -> Result<Self> {
        config.validate()?;
        let engine: Box<dyn ConvolutionEngine> = match kind {
            EngineKind::Host => Box::new(HostEngine::new(config)?),
            EngineKind::Gpu => {
                let device = Arc::new(GpuDevice::new()?);
                Box::new(TextureEngine::new(device, config)?)
            }
        };
        Self::with_engine(config, trajectory, engine, Box::new(RustFft::new()))
    }

    /// Build an operator around an already-initialised engine.
    pub fn with_engine(
        config: &NufftConfig,
        trajectory: Vec<[f32; 3]>,
        engine: Box<dyn ConvolutionEngine>,
        fft: Box<dyn FftBackend>,
    ) -> Result<Self> {
        config.validate()?;
        if !engine.is_ready() {
            return Err(NufftError::NotReady);
        }
        if engine.interpolation_mode() != config.interpolation {
            return Err(NufftError::InvalidInput(format!(
                "engine built for {}, config asks for {}",
                engine.interpolation_mode(),
                config.interpolation
            )));
        }
        let rank = config.image_dims.rank();
        if let Some(i) = trajectory.iter().position(|c| c[..rank].iter().any(|v| !v.is_finite())) {
            return Err(NufftError::InvalidInput(format!("coordinate {i} is not finite")));
        }

        let grid_dims = config.grid_dims();
        let sectors = SectorMap::assign(&trajectory, grid_dims, config.sector_width);
        let mut op = NufftOperator {
            config: config.clone(),
            coords: trajectory,
            sectors,
            engine,
            fft,
            deapodization: Vec::new(),
            state: OperatorState::Ready,
        };
        op.deapodization = op.compute_deapodization()?;

        info!(
            mode = op.interpolation_type_name(),
            image = %config.image_dims,
            grid = %grid_dims,
            samples = op.coords.len(),
            sectors = op.sectors.len(),
            "operator ready"
        );
        Ok(op)
    }

    pub fn state(&self) -> OperatorState {
        self.state
    }

    pub fn config(&self) -> &NufftConfig {
        &self.config
    }

    pub fn num_samples(&self) -> usize {
        self.coords.len()
    }

    pub fn sectors(&self) -> &SectorMap {
        &self.sectors
    }

    /// Diagnostic name of the active interpolation mode.
    pub fn interpolation_type_name(&self) -> &'static str {
        self.engine.interpolation_mode().name()
    }

    /// Real deapodization factors, one per image pixel.
    pub fn deapodization_factors(&self) -> &[f32] {
        &self.deapodization
    }

    /// Gridding: k-space samples → image (or grid, for `Convolution`).
    pub fn perform_adjoint(&mut self, kspace: &[Complex32], mode: OutputMode) -> Result<Grid> {
        self.check_live()?;
        if kspace.len() != self.coords.len() {
            return Err(NufftError::InvalidInput(format!(
                "{} k-space samples for a trajectory of {}",
                kspace.len(),
                self.coords.len()
            )));
        }
        self.execute(|op| {
            let mut grid = Grid::zeros(op.config.grid_dims());
            op.engine.convolve_adjoint(kspace, &op.coords, &op.sectors, &mut grid)?;
            if mode == OutputMode::Convolution {
                return Ok(grid);
            }
            let mut image = op.grid_to_image(grid);
            if mode == OutputMode::Deapodization {
                for (v, &d) in image.as_mut_slice().iter_mut().zip(&op.deapodization) {
                    *v /= d;
                }
            }
            Ok(image)
        })
    }

    /// Degridding: image (or grid, for `Convolution`) → k-space samples.
    pub fn perform_forward(&mut self, input: &Grid, mode: OutputMode) -> Result<Vec<Complex32>> {
        self.check_live()?;
        let expected = match mode {
            OutputMode::Convolution => self.config.grid_dims(),
            _ => self.config.image_dims,
        };
        if input.dims() != expected {
            return Err(NufftError::InvalidInput(format!(
                "input is {}, expected {expected}",
                input.dims()
            )));
        }
        self.execute(|op| {
            let mut out = vec![Complex32::new(0.0, 0.0); op.coords.len()];
            let padded;
            let grid = match mode {
                OutputMode::Convolution => input,
                OutputMode::Fft => {
                    padded = op.image_to_grid(input.clone());
                    &padded
                }
                OutputMode::Deapodization => {
                    let mut image = input.clone();
                    for (v, &d) in image.as_mut_slice().iter_mut().zip(&op.deapodization) {
                        *v /= d;
                    }
                    padded = op.image_to_grid(image);
                    &padded
                }
            };
            op.engine.convolve_forward(grid, &op.coords, &op.sectors, &mut out)?;
            Ok(out)
        })
    }

    /// Re-run kernel construction (and deapodization) for the current
    /// configuration. Leaves the operator without textures on failure.
    pub fn rebuild_kernel(&mut self) -> Result<()> {
        self.check_live()?;
        self.engine.rebuild(&self.config)?;
        self.deapodization = self.compute_deapodization()?;
        Ok(())
    }

    /// Free every device resource. Terminal and idempotent.
    pub fn release(&mut self) {
        if self.state != OperatorState::Released {
            self.engine.release();
            self.state = OperatorState::Released;
            debug!("operator released");
        }
    }

    fn check_live(&self) -> Result<()> {
        match self.state {
            OperatorState::Released => Err(NufftError::Released),
            _ => Ok(()),
        }
    }

    fn execute<T>(&mut self, pass: impl FnOnce(&Self) -> Result<T>) -> Result<T> {
        match self.state {
            OperatorState::Released => return Err(NufftError::Released),
            // Only reachable when a pass panicked and the caller caught the
            // unwind: the state was never restored.
            OperatorState::Executing => {
                return Err(NufftError::Execution {
                    pass: "operator",
                    reason: "a previous call did not complete".into(),
                })
            }
            OperatorState::Ready => {}
        }
        self.state = OperatorState::Executing;
        let result = pass(self);
        self.state = OperatorState::Ready;
        if let Err(e) = &result {
            warn!(error = %e, "operator call failed");
        }
        result
    }

    fn compute_deapodization(&self) -> Result<Vec<f32>> {
        let grid_dims = self.config.grid_dims();
        let origin = [[0.0f32; 3]];
        let sectors = SectorMap::assign(&origin, grid_dims, self.config.sector_width);
        let mut grid = Grid::zeros(grid_dims);
        self.engine
            .convolve_adjoint(&[Complex32::new(1.0, 0.0)], &origin, &sectors, &mut grid)?;
        let image = self.grid_to_image(grid);

        let mut factors: Vec<f32> = image.as_slice().iter().map(|v| v.re).collect();
        let peak = factors.iter().fold(0.0f32, |m, v| m.max(v.abs()));
        let floor = peak * DEAPODIZATION_FLOOR;
        let mut clamped = 0usize;
        for d in &mut factors {
            if d.abs() < floor {
                *d = floor.copysign(*d);
                clamped += 1;
            }
        }
        if clamped > 0 {
            warn!(clamped, "deapodization factors clamped near zero");
        }
        debug!(peak, "deapodization factors computed");
        Ok(factors)
    }

    fn grid_to_image(&self, mut grid: Grid) -> Grid {
        let dims = grid.dims();
        self.fft.inverse(grid.as_mut_slice(), dims);
        crop(&grid, self.config.image_dims)
    }

    fn image_to_grid(&self, image: Grid) -> Grid {
        let grid_dims = self.config.grid_dims();
        let mut grid = pad(&image, grid_dims);
        self.fft.forward(grid.as_mut_slice(), grid_dims);
        grid
    }
}

impl Drop for NufftOperator {
    fn drop(&mut self) {
        self.release();
    }
}

/// Per-axis offset of the image inside the grid.
fn centre_offset(grid: Dimensions, image: Dimensions) -> [u32; 3] {
    let g = grid.as_array();
    let i = image.as_array();
    [0, 1, 2].map(|a| g[a] / 2 - i[a] / 2)
}

fn crop(grid: &Grid, image_dims: Dimensions) -> Grid {
    let [ox, oy, oz] = centre_offset(grid.dims(), image_dims);
    let mut image = Grid::zeros(image_dims);
    for z in 0..image_dims.depth {
        for y in 0..image_dims.height {
            for x in 0..image_dims.width {
                image.set(x, y, z, grid.get(x + ox, y + oy, z + oz));
            }
        }
    }
    image
}

fn pad(image: &Grid, grid_dims: Dimensions) -> Grid {
    let dims = image.dims();
    let [ox, oy, oz] = centre_offset(grid_dims, dims);
    let mut grid = Grid::zeros(grid_dims);
    for z in 0..dims.depth {
        for y in 0..dims.height {
            for x in 0..dims.width {
                grid.set(x + ox, y + oy, z + oz, image.get(x, y, z));
            }
        }
    }
    grid
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::InterpolationMode;
    use crate::fft::NaiveDft;
    use num_complex::Complex64;

    fn host_operator(config: &NufftConfig, coords: Vec<[f32; 3]>) -> NufftOperator {
        NufftOperator::new(config, coords, EngineKind::Host).unwrap()
    }

    fn config() -> NufftConfig {
        NufftConfig::new(6, 8, 2.0, Dimensions::new_2d(16, 16))
    }

    fn dot(a: &[Complex32], b: &[Complex32]) -> Complex64 {
        a.iter()
            .zip(b)
            .map(|(x, y)| Complex64::new(x.re as f64, -x.im as f64) * Complex64::new(y.re as f64, y.im as f64))
            .sum()
    }

    #[test]
    fn test_origin_sample_reconstructs_flat_image() {
        let c = config();
        let mut op = host_operator(&c, vec![[0.0; 3]]);
        let image = op.perform_adjoint(&[Complex32::new(1.0, 0.0)], OutputMode::Deapodization).unwrap();
        assert_eq!(image.dims(), c.image_dims);
        for v in image.as_slice() {
            assert!((v - Complex32::new(1.0, 0.0)).norm() < 1e-4, "{v}");
        }
    }

    #[test]
    fn test_off_centre_sample_matches_direct_sum() {
        let c = config();
        let k = [0.13f32, -0.27, 0.0];
        let mut op = host_operator(&c, vec![k]);
        let image = op.perform_adjoint(&[Complex32::new(1.0, 0.0)], OutputMode::Deapodization).unwrap();
        let half = [8.0f64, 8.0];
        for y in 0..16 {
            for x in 0..16 {
                let phase = 2.0
                    * std::f64::consts::PI
                    * (k[0] as f64 * (x as f64 - half[0]) + k[1] as f64 * (y as f64 - half[1]));
                let want = Complex64::from_polar(1.0, phase);
                let got = image.get(x, y, 0);
                let err = (Complex64::new(got.re as f64, got.im as f64) - want).norm();
                assert!(err < 1e-2, "pixel ({x},{y}): {got} vs {want}");
            }
        }
    }

    #[test]
    fn test_full_operator_pair_is_adjoint() {
        let c = config().with_interpolation(InterpolationMode::Table);
        let coords: Vec<[f32; 3]> = (0..64)
            .map(|i| {
                let t = i as f32 / 64.0;
                [t - 0.5, (t * 7.3).fract() - 0.5, 0.0]
            })
            .collect();
        let samples: Vec<Complex32> =
            (0..64).map(|i| Complex32::new((i as f32 * 0.37).sin(), (i as f32 * 0.11).cos())).collect();
        let image_data: Vec<Complex32> =
            (0..256).map(|i| Complex32::new((i % 7) as f32 - 3.0, (i % 5) as f32 * 0.5)).collect();
        let image = Grid::from_vec(c.image_dims, image_data);

        let mut op = host_operator(&c, coords);
        let adj = op.perform_adjoint(&samples, OutputMode::Deapodization).unwrap();
        let fwd = op.perform_forward(&image, OutputMode::Deapodization).unwrap();

        let lhs = dot(adj.as_slice(), image.as_slice());
        let rhs = dot(&samples, &fwd);
        assert!((lhs - rhs).norm() < 1e-3 * lhs.norm().max(1.0), "{lhs} vs {rhs}");
    }

    #[test]
    fn test_output_modes_shape() {
        let c = config();
        let mut op = host_operator(&c, vec![[0.1, 0.2, 0.0]]);
        let s = [Complex32::new(1.0, 0.0)];
        assert_eq!(op.perform_adjoint(&s, OutputMode::Convolution).unwrap().dims(), c.grid_dims());
        assert_eq!(op.perform_adjoint(&s, OutputMode::Fft).unwrap().dims(), c.image_dims);

        let grid = Grid::zeros(c.grid_dims());
        assert_eq!(op.perform_forward(&grid, OutputMode::Convolution).unwrap().len(), 1);
        let err = op.perform_forward(&grid, OutputMode::Fft).unwrap_err();
        assert!(matches!(err, NufftError::InvalidInput(_)));
    }

    #[test]
    fn test_state_transitions_and_release() {
        let c = config();
        let mut op = host_operator(&c, vec![[0.0; 3]]);
        assert_eq!(op.state(), OperatorState::Ready);
        assert_eq!(op.interpolation_type_name(), "TEXTURE2D_LOOKUP");

        // A failing call still returns the operator to Ready.
        assert!(op.perform_adjoint(&[], OutputMode::Convolution).is_err());
        assert_eq!(op.state(), OperatorState::Ready);

        op.release();
        op.release();
        assert_eq!(op.state(), OperatorState::Released);
        let err = op.perform_adjoint(&[Complex32::new(1.0, 0.0)], OutputMode::Fft).unwrap_err();
        assert!(matches!(err, NufftError::Released));
        assert!(matches!(op.rebuild_kernel(), Err(NufftError::Released)));
    }

    #[test]
    fn test_released_wins_over_input_errors() {
        let c = config();
        let mut op = host_operator(&c, vec![[0.0; 3]]);
        op.release();
        // Wrong length and wrong shape still report the terminal state.
        let err = op.perform_adjoint(&[], OutputMode::Convolution).unwrap_err();
        assert!(matches!(err, NufftError::Released));
        let err = op.perform_forward(&Grid::zeros(Dimensions::new_2d(3, 3)), OutputMode::Fft).unwrap_err();
        assert!(matches!(err, NufftError::Released));
    }

    /// Host engine that panics on any adjoint call with more than one sample.
    struct PanickingEngine(HostEngine);

    impl ConvolutionEngine for PanickingEngine {
        fn interpolation_mode(&self) -> crate::config::InterpolationMode {
            self.0.interpolation_mode()
        }
        fn rebuild(&mut self, config: &NufftConfig) -> Result<()> {
            self.0.rebuild(config)
        }
        fn convolve_adjoint(&self, samples: &[Complex32], coords: &[[f32; 3]], sectors: &SectorMap, grid: &mut Grid) -> Result<()> {
            assert!(coords.len() < 2, "engine fault");
            self.0.convolve_adjoint(samples, coords, sectors, grid)
        }
        fn convolve_forward(&self, grid: &Grid, coords: &[[f32; 3]], sectors: &SectorMap, out: &mut [Complex32]) -> Result<()> {
            self.0.convolve_forward(grid, coords, sectors, out)
        }
        fn release(&mut self) {
            self.0.release()
        }
        fn is_ready(&self) -> bool {
            self.0.is_ready()
        }
    }

    #[test]
    fn test_panicked_call_leaves_operator_unusable_until_release() {
        let c = config();
        let engine = Box::new(PanickingEngine(HostEngine::new(&c).unwrap()));
        let mut op =
            NufftOperator::with_engine(&c, vec![[0.0; 3], [0.1, 0.1, 0.0]], engine, Box::new(NaiveDft)).unwrap();
        let samples = [Complex32::new(1.0, 0.0); 2];
        let caught = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            op.perform_adjoint(&samples, OutputMode::Convolution)
        }));
        assert!(caught.is_err());
        assert_eq!(op.state(), OperatorState::Executing);

        let err = op.perform_forward(&Grid::zeros(c.grid_dims()), OutputMode::Convolution).unwrap_err();
        assert!(matches!(err, NufftError::Execution { pass: "operator", .. }));
        op.release();
        assert_eq!(op.state(), OperatorState::Released);
    }

    #[test]
    fn test_huge_coordinates_fold_onto_the_grid() {
        let c = config();
        let s = [Complex32::new(1.0, 0.0)];
        let mut far = host_operator(&c, vec![[1e30, -7.75, 0.0]]);
        let mut near = host_operator(&c, vec![[0.0, 0.25, 0.0]]);
        let a = far.perform_adjoint(&s, OutputMode::Convolution).unwrap();
        let b = near.perform_adjoint(&s, OutputMode::Convolution).unwrap();
        assert_eq!(a, b);
        assert!(a.nonzero().count() > 0);
    }

    #[test]
    fn test_rebuild_kernel_keeps_results() {
        let c = config();
        let mut op = host_operator(&c, vec![[0.2, -0.1, 0.0]]);
        let s = [Complex32::new(0.0, 1.0)];
        let before = op.perform_adjoint(&s, OutputMode::Deapodization).unwrap();
        op.rebuild_kernel().unwrap();
        let after = op.perform_adjoint(&s, OutputMode::Deapodization).unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn test_construction_errors() {
        let mut c = config();
        c.kernel_width = 0;
        assert!(matches!(
            NufftOperator::new(&c, vec![], EngineKind::Host),
            Err(NufftError::Config(_))
        ));
        let err = NufftOperator::new(&config(), vec![[f32::NAN, 0.0, 0.0]], EngineKind::Host);
        assert!(matches!(err, Err(NufftError::InvalidInput(_))));
    }

    #[test]
    fn test_crop_pad_are_centred() {
        let grid_dims = Dimensions::new_2d(8, 6);
        let image_dims = Dimensions::new_2d(4, 3);
        assert_eq!(centre_offset(grid_dims, image_dims), [2, 2, 0]);
        let mut image = Grid::zeros(image_dims);
        image.set(2, 1, 0, Complex32::new(1.0, 0.0));
        let grid = pad(&image, grid_dims);
        assert_eq!(grid.get(4, 3, 0), Complex32::new(1.0, 0.0));
        assert_eq!(crop(&grid, image_dims), image);
    }
}
