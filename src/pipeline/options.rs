//! Pipeline configuration.
//!
//! `PipelineOptions` is constructed once from the CLI configuration,
//! validated, and passed immutably into every job invocation. Workers never
//! read ambient state.

use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::tools::GdalCapabilities;

/// Errors that can occur while validating pipeline options.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum OptionsError {
    /// JPEG quality outside 1-100.
    #[error("JPEG quality must be between 1 and 100, got {0}")]
    InvalidQuality(u8),

    /// Non-positive target resolution.
    #[error("Target resolution must be positive, got {0}")]
    InvalidResolution(String),

    /// Zero-sized output tile block.
    #[error("Block size must be positive in both dimensions, got {x}x{y}")]
    InvalidBlockSize { x: u32, y: u32 },

    /// Unknown resample kernel name.
    #[error("Unknown resample kernel '{0}'")]
    UnknownKernel(String),
}

/// Resampling kernel used by the translate and warp stages.
///
/// Only kernel names the GDAL tools accept are representable; free-form
/// strings never reach a command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResampleKernel {
    Nearest,
    Bilinear,
    Cubic,
    CubicSpline,
    Lanczos,
    Average,
    Mode,
}

impl ResampleKernel {
    /// The name the GDAL tools expect for `-r`.
    pub fn as_str(&self) -> &'static str {
        match self {
            ResampleKernel::Nearest => "near",
            ResampleKernel::Bilinear => "bilinear",
            ResampleKernel::Cubic => "cubic",
            ResampleKernel::CubicSpline => "cubicspline",
            ResampleKernel::Lanczos => "lanczos",
            ResampleKernel::Average => "average",
            ResampleKernel::Mode => "mode",
        }
    }
}

impl std::fmt::Display for ResampleKernel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResampleKernel {
    type Err = OptionsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "near" | "nearest" => Ok(ResampleKernel::Nearest),
            "bilinear" => Ok(ResampleKernel::Bilinear),
            "cubic" => Ok(ResampleKernel::Cubic),
            "cubicspline" => Ok(ResampleKernel::CubicSpline),
            "lanczos" => Ok(ResampleKernel::Lanczos),
            "average" => Ok(ResampleKernel::Average),
            "mode" => Ok(ResampleKernel::Mode),
            other => Err(OptionsError::UnknownKernel(other.to_string())),
        }
    }
}

/// Internal tiling of the output raster, in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockSize {
    /// Tile width.
    pub x: u32,
    /// Tile height.
    pub y: u32,
}

impl BlockSize {
    /// Creates a new block size.
    pub fn new(x: u32, y: u32) -> Self {
        Self { x, y }
    }
}

impl Default for BlockSize {
    fn default() -> Self {
        Self { x: 256, y: 256 }
    }
}

/// Immutable per-run pipeline configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineOptions {
    /// Ground distance per output pixel, in target CRS units.
    pub resolution: f64,
    /// Resampling kernel for the translate and warp stages.
    pub resample: ResampleKernel,
    /// Output raster tiling.
    pub block_size: BlockSize,
    /// JPEG quality (1-100), used only when `compress` is set.
    pub quality: u8,
    /// Whether to downcast to 8-bit and JPEG-compress the final raster.
    pub compress: bool,
    /// Whether hardware (OpenCL) acceleration may be used by the warp tool.
    /// When false the acceleration path is explicitly disabled.
    pub acceleration: bool,
    /// Whether existing targets are deleted and regenerated. When false an
    /// existing target makes the job a skip, which is the sole resume
    /// mechanism for re-run batches.
    pub overwrite: bool,
    /// Directory for temporary intermediates; the system default when unset.
    pub temp_dir: Option<PathBuf>,
    /// Raw converter executable.
    pub converter: PathBuf,
    /// Converter-specific tuning flags, passed through verbatim.
    pub converter_args: Vec<String>,
    /// Probed GDAL tool capabilities, cached for the whole run.
    pub capabilities: GdalCapabilities,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            resolution: 0.02,
            resample: ResampleKernel::Lanczos,
            block_size: BlockSize::default(),
            quality: 95,
            compress: false,
            acceleration: false,
            overwrite: false,
            temp_dir: None,
            converter: PathBuf::from("iiq2tif"),
            converter_args: Vec::new(),
            capabilities: GdalCapabilities::default(),
        }
    }
}

impl PipelineOptions {
    /// Creates options with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the target resolution.
    pub fn with_resolution(mut self, resolution: f64) -> Self {
        self.resolution = resolution;
        self
    }

    /// Sets the resample kernel.
    pub fn with_resample(mut self, kernel: ResampleKernel) -> Self {
        self.resample = kernel;
        self
    }

    /// Sets the output block size.
    pub fn with_block_size(mut self, block_size: BlockSize) -> Self {
        self.block_size = block_size;
        self
    }

    /// Enables compression at the given JPEG quality.
    pub fn with_compression(mut self, quality: u8) -> Self {
        self.compress = true;
        self.quality = quality;
        self
    }

    /// Sets the acceleration flag.
    pub fn with_acceleration(mut self, enabled: bool) -> Self {
        self.acceleration = enabled;
        self
    }

    /// Sets the overwrite flag.
    pub fn with_overwrite(mut self, enabled: bool) -> Self {
        self.overwrite = enabled;
        self
    }

    /// Overrides the temporary directory.
    pub fn with_temp_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.temp_dir = Some(dir.into());
        self
    }

    /// Sets the raw converter executable.
    pub fn with_converter(mut self, path: impl Into<PathBuf>) -> Self {
        self.converter = path.into();
        self
    }

    /// Sets the verbatim converter tuning flags.
    pub fn with_converter_args(mut self, args: Vec<String>) -> Self {
        self.converter_args = args;
        self
    }

    /// Sets the probed tool capabilities.
    pub fn with_capabilities(mut self, capabilities: GdalCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Validates numeric ranges.
    ///
    /// # Errors
    ///
    /// Returns `OptionsError` for an out-of-range quality, a non-positive
    /// resolution, or a zero block dimension.
    pub fn validate(&self) -> Result<(), OptionsError> {
        if self.quality == 0 || self.quality > 100 {
            return Err(OptionsError::InvalidQuality(self.quality));
        }
        if self.resolution <= 0.0 || self.resolution.is_nan() {
            return Err(OptionsError::InvalidResolution(self.resolution.to_string()));
        }
        if self.block_size.x == 0 || self.block_size.y == 0 {
            return Err(OptionsError::InvalidBlockSize {
                x: self.block_size.x,
                y: self.block_size.y,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let options = PipelineOptions::default();
        assert!(options.validate().is_ok());
        assert!((options.resolution - 0.02).abs() < f64::EPSILON);
        assert_eq!(options.resample, ResampleKernel::Lanczos);
        assert_eq!(options.block_size, BlockSize::new(256, 256));
        assert_eq!(options.quality, 95);
        assert!(!options.compress);
        assert!(!options.acceleration);
        assert!(!options.overwrite);
    }

    #[test]
    fn test_builder() {
        let options = PipelineOptions::new()
            .with_resolution(0.05)
            .with_resample(ResampleKernel::Cubic)
            .with_block_size(BlockSize::new(512, 512))
            .with_compression(80)
            .with_acceleration(true)
            .with_overwrite(true)
            .with_temp_dir("/scratch")
            .with_converter("/opt/iiq/convert")
            .with_converter_args(vec!["--bits".to_string(), "16".to_string()]);

        assert!(options.validate().is_ok());
        assert!(options.compress);
        assert_eq!(options.quality, 80);
        assert_eq!(options.temp_dir, Some(PathBuf::from("/scratch")));
        assert_eq!(options.converter, PathBuf::from("/opt/iiq/convert"));
        assert_eq!(options.converter_args.len(), 2);
    }

    #[test]
    fn test_quality_range() {
        let options = PipelineOptions::new().with_compression(0);
        assert_eq!(options.validate(), Err(OptionsError::InvalidQuality(0)));

        let options = PipelineOptions::new().with_compression(101);
        assert_eq!(options.validate(), Err(OptionsError::InvalidQuality(101)));

        let options = PipelineOptions::new().with_compression(100);
        assert!(options.validate().is_ok());
    }

    #[test]
    fn test_resolution_must_be_positive() {
        let options = PipelineOptions::new().with_resolution(0.0);
        assert!(matches!(
            options.validate(),
            Err(OptionsError::InvalidResolution(_))
        ));

        let options = PipelineOptions::new().with_resolution(-1.0);
        assert!(options.validate().is_err());
    }

    #[test]
    fn test_block_size_must_be_positive() {
        let options = PipelineOptions::new().with_block_size(BlockSize::new(0, 256));
        assert_eq!(
            options.validate(),
            Err(OptionsError::InvalidBlockSize { x: 0, y: 256 })
        );
    }

    #[test]
    fn test_kernel_round_trip() {
        for name in [
            "near",
            "bilinear",
            "cubic",
            "cubicspline",
            "lanczos",
            "average",
            "mode",
        ] {
            let kernel: ResampleKernel = name.parse().unwrap();
            assert_eq!(kernel.as_str(), name);
        }
    }

    #[test]
    fn test_kernel_aliases_and_case() {
        assert_eq!(
            "nearest".parse::<ResampleKernel>().unwrap(),
            ResampleKernel::Nearest
        );
        assert_eq!(
            "Lanczos".parse::<ResampleKernel>().unwrap(),
            ResampleKernel::Lanczos
        );
    }

    #[test]
    fn test_unknown_kernel_rejected() {
        let err = "sinc".parse::<ResampleKernel>().unwrap_err();
        assert_eq!(err, OptionsError::UnknownKernel("sinc".to_string()));
    }
}
