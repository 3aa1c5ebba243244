//! Georeferencing pipeline.
//!
//! Per job, a strictly sequential chain of external tool invocations:
//! raw-convert, translate with ground control points, warp into the target
//! CRS, and an optional JPEG compression pass. Intermediate rasters live in
//! uniquely named temporary files that are removed on every exit path.

pub mod options;
pub mod runner;
pub mod tools;

pub use options::{BlockSize, OptionsError, PipelineOptions, ResampleKernel};
pub use runner::{run, JobOutcome, PipelineError, Stage};
pub use tools::{GdalCapabilities, SystemToolRunner, ToolError, ToolInvocation, ToolRunner};
