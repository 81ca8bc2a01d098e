// config.rs — Operator configuration record.
//
// Everything the convolution core needs to know about the problem is carried
// by `NufftConfig`: kernel support, sector size, oversampling, the image
// extent and which kernel representation to build. It is plain data, built
// in code and validated once before any table or texture exists.
//
// GRID GEOMETRY
// ─────────────
// The oversampled grid has `ceil(dim * osf)` cells along every axis whose
// image extent is > 1. A 2D problem is expressed with `depth == 1`; its grid
// keeps depth 1 and every z-coordinate is ignored.

use std::fmt;
use std::str::FromStr;

use crate::error::ConfigError;

/// Widest supported kernel support, in oversampled grid cells.
pub const MAX_KERNEL_WIDTH: u32 = 16;

// ---------------------------------------------------------------------------
// Dimensions
// ---------------------------------------------------------------------------

/// Extent of an image or grid. `depth == 1` denotes a 2D problem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Dimensions {
    pub width: u32,
    pub height: u32,
    pub depth: u32,
}

impl Dimensions {
    pub fn new_2d(width: u32, height: u32) -> Self {
        Dimensions { width, height, depth: 1 }
    }

    pub fn new_3d(width: u32, height: u32, depth: u32) -> Self {
        Dimensions { width, height, depth }
    }

    /// 2 or 3.
    pub fn rank(&self) -> usize {
        if self.depth > 1 { 3 } else { 2 }
    }

    pub fn is_3d(&self) -> bool {
        self.rank() == 3
    }

    /// Number of cells.
    pub fn count(&self) -> usize {
        self.width as usize * self.height as usize * self.depth as usize
    }

    pub fn as_array(&self) -> [u32; 3] {
        [self.width, self.height, self.depth]
    }

    /// Oversampled grid for this image extent.
    pub fn grid(&self, osf: f32) -> Dimensions {
        let scale = |d: u32| -> u32 {
            if d <= 1 { d } else { (d as f32 * osf).ceil() as u32 }
        };
        Dimensions {
            width: scale(self.width),
            height: scale(self.height),
            depth: scale(self.depth),
        }
    }

    /// Row-major linear index (x fastest).
    #[inline]
    pub fn index(&self, x: u32, y: u32, z: u32) -> usize {
        (z as usize * self.height as usize + y as usize) * self.width as usize + x as usize
    }
}

impl fmt::Display for Dimensions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_3d() {
            write!(f, "{}×{}×{}", self.width, self.height, self.depth)
        } else {
            write!(f, "{}×{}", self.width, self.height)
        }
    }
}

// ---------------------------------------------------------------------------
// InterpolationMode
// ---------------------------------------------------------------------------

/// Dimensionality of the precomputed kernel representation.
///
/// - `Table`: 1D radial table, fetched once per axis and multiplied.
/// - `Surface2D`: precomputed two-axis product; one fetch covers x and y.
/// - `Volume3D`: precomputed three-axis product; one fetch per grid cell,
///   at the cost of a much larger (and coarser) table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum InterpolationMode {
    Table,
    #[default]
    Surface2D,
    Volume3D,
}

impl InterpolationMode {
    /// Diagnostic name, as printed in logs.
    pub fn name(&self) -> &'static str {
        match self {
            InterpolationMode::Table => "TEXTURE_LOOKUP",
            InterpolationMode::Surface2D => "TEXTURE2D_LOOKUP",
            InterpolationMode::Volume3D => "TEXTURE3D_LOOKUP",
        }
    }

    /// Number of axes spanned by the table.
    pub fn table_rank(&self) -> usize {
        match self {
            InterpolationMode::Table => 1,
            InterpolationMode::Surface2D => 2,
            InterpolationMode::Volume3D => 3,
        }
    }
}

impl fmt::Display for InterpolationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for InterpolationMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "table" | "texture_lookup" | "texture1d_lookup" | "1d" => Ok(InterpolationMode::Table),
            "surface" | "texture2d_lookup" | "2d" => Ok(InterpolationMode::Surface2D),
            "volume" | "texture3d_lookup" | "3d" => Ok(InterpolationMode::Volume3D),
            _ => Err(ConfigError::UnsupportedInterpolation(s.to_string())),
        }
    }
}

impl TryFrom<u32> for InterpolationMode {
    type Error = ConfigError;

    fn try_from(code: u32) -> Result<Self, Self::Error> {
        match code {
            1 => Ok(InterpolationMode::Table),
            2 => Ok(InterpolationMode::Surface2D),
            3 => Ok(InterpolationMode::Volume3D),
            other => Err(ConfigError::UnsupportedInterpolation(format!("code {other}"))),
        }
    }
}

// ---------------------------------------------------------------------------
// OutputMode
// ---------------------------------------------------------------------------

/// How far an operator call runs through the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputMode {
    /// Stop after the convolution: the oversampled grid is the result
    /// (adjoint) or the input (forward).
    Convolution,
    /// Convolution plus FFT, no deapodization.
    Fft,
    /// Full transform including deapodization.
    #[default]
    Deapodization,
}

// ---------------------------------------------------------------------------
// NufftConfig
// ---------------------------------------------------------------------------

/// Parameters for building an operator.
#[derive(Debug, Clone, PartialEq)]
pub struct NufftConfig {
    /// Kernel support diameter in oversampled grid cells.
    pub kernel_width: u32,
    /// Sector edge length in grid cells.
    pub sector_width: u32,
    /// Oversampling factor (grid / image ratio).
    pub osf: f32,
    pub image_dims: Dimensions,
    pub interpolation: InterpolationMode,
}

impl NufftConfig {
    /// Configuration with the default `Surface2D` interpolation.
    pub fn new(kernel_width: u32, sector_width: u32, osf: f32, image_dims: Dimensions) -> Self {
        NufftConfig {
            kernel_width,
            sector_width,
            osf,
            image_dims,
            interpolation: InterpolationMode::default(),
        }
    }

    pub fn with_interpolation(mut self, mode: InterpolationMode) -> Self {
        self.interpolation = mode;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.kernel_width == 0 || self.kernel_width > MAX_KERNEL_WIDTH {
            return Err(ConfigError::InvalidKernelWidth {
                width: self.kernel_width,
                max: MAX_KERNEL_WIDTH,
            });
        }
        if self.sector_width == 0 {
            return Err(ConfigError::InvalidSectorWidth(self.sector_width));
        }
        if !self.osf.is_finite() || self.osf < 1.0 {
            return Err(ConfigError::InvalidOversampling(self.osf));
        }
        let d = self.image_dims;
        if d.width == 0 || d.height == 0 || d.depth == 0 {
            return Err(ConfigError::InvalidDimensions {
                width: d.width,
                height: d.height,
                depth: d.depth,
            });
        }
        Ok(())
    }

    pub fn grid_dims(&self) -> Dimensions {
        self.image_dims.grid(self.osf)
    }

    /// Kernel support radius in grid cells.
    pub fn kernel_radius(&self) -> f32 {
        self.kernel_width as f32 / 2.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> NufftConfig {
        NufftConfig::new(3, 8, 2.0, Dimensions::new_2d(64, 64))
    }

    #[test]
    fn test_default_interpolation_is_surface() {
        assert_eq!(base().interpolation, InterpolationMode::Surface2D);
    }

    #[test]
    fn test_grid_dims_2d() {
        let g = NufftConfig::new(3, 8, 1.25, Dimensions::new_2d(100, 64)).grid_dims();
        assert_eq!(g, Dimensions::new_2d(125, 80));
        assert_eq!(g.rank(), 2);
    }

    #[test]
    fn test_grid_dims_3d_rounds_up() {
        let g = Dimensions::new_3d(10, 10, 5).grid(1.5);
        assert_eq!(g, Dimensions::new_3d(15, 15, 8));
    }

    #[test]
    fn test_validate_rejects_zero_kernel_width() {
        let mut c = base();
        c.kernel_width = 0;
        assert!(matches!(c.validate(), Err(ConfigError::InvalidKernelWidth { width: 0, .. })));
    }

    #[test]
    fn test_validate_rejects_wide_kernel() {
        let mut c = base();
        c.kernel_width = MAX_KERNEL_WIDTH + 1;
        assert!(c.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_bad_osf_and_dims() {
        let mut c = base();
        c.osf = 0.5;
        assert_eq!(c.validate(), Err(ConfigError::InvalidOversampling(0.5)));
        c.osf = f32::NAN;
        assert!(c.validate().is_err());

        let mut c = base();
        c.image_dims = Dimensions::new_2d(0, 10);
        assert!(matches!(c.validate(), Err(ConfigError::InvalidDimensions { .. })));

        let mut c = base();
        c.sector_width = 0;
        assert_eq!(c.validate(), Err(ConfigError::InvalidSectorWidth(0)));
    }

    #[test]
    fn test_mode_parsing() {
        assert_eq!("table".parse::<InterpolationMode>(), Ok(InterpolationMode::Table));
        assert_eq!("TEXTURE3D_LOOKUP".parse::<InterpolationMode>(), Ok(InterpolationMode::Volume3D));
        assert!(matches!(
            "cubic".parse::<InterpolationMode>(),
            Err(ConfigError::UnsupportedInterpolation(_))
        ));
        assert_eq!(InterpolationMode::try_from(2), Ok(InterpolationMode::Surface2D));
        assert!(InterpolationMode::try_from(7).is_err());
    }

    #[test]
    fn test_mode_names() {
        assert_eq!(InterpolationMode::Table.name(), "TEXTURE_LOOKUP");
        assert_eq!(InterpolationMode::Surface2D.to_string(), "TEXTURE2D_LOOKUP");
        assert_eq!(InterpolationMode::Volume3D.table_rank(), 3);
    }

    #[test]
    fn test_index_row_major() {
        let d = Dimensions::new_3d(4, 3, 2);
        assert_eq!(d.index(0, 0, 0), 0);
        assert_eq!(d.index(1, 0, 0), 1);
        assert_eq!(d.index(0, 1, 0), 4);
        assert_eq!(d.index(0, 0, 1), 12);
        assert_eq!(d.count(), 24);
    }
}
