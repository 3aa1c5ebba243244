//! The per-job georeferencing state machine.
//!
//! Five strictly sequential steps: preflight checks, raw conversion,
//! geometric registration (translate with ground control points), warp into
//! the target CRS, and an optional compression pass. Each step depends on the
//! previous step's output file; a failure aborts only the current job.
//!
//! Temporary intermediates are `tempfile` guards, so they are deleted on
//! every exit path including early failure.

use std::fs;
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::{debug, info};

use crate::catalog::job::{GroundControlPoint, JobDescriptor};

use super::options::PipelineOptions;
use super::tools::{ToolError, ToolInvocation, ToolRunner};

/// Nice increment for the raw converter, so long conversions do not starve
/// the rest of the system.
const CONVERTER_NICE: u8 = 10;

/// GDAL raster cache budget in megabytes for the warp stage.
const WARP_CACHE_MB: u32 = 8000;

/// A stage of the external tool sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Raw capture to intermediate raster.
    Convert,
    /// Ground-control-point registration.
    Translate,
    /// Reprojection into the target CRS.
    Warp,
    /// 8-bit downcast and JPEG compression.
    Compress,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Stage::Convert => write!(f, "conversion"),
            Stage::Translate => write!(f, "translation"),
            Stage::Warp => write!(f, "warp"),
            Stage::Compress => write!(f, "compression"),
        }
    }
}

/// Errors that abort a single job. None of these abort the batch.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// The raw input file does not exist.
    #[error("Input file {0} does not exist")]
    MissingInput(PathBuf),

    /// The job's corner coordinates are not pairwise distinct.
    #[error("Corner coordinates for {0} are not pairwise distinct")]
    DegenerateCorners(PathBuf),

    /// A tool process could not be launched.
    #[error("{stage} failed to launch: {source}")]
    LaunchFailed {
        stage: Stage,
        #[source]
        source: ToolError,
    },

    /// A tool process exited non-zero.
    #[error("{stage} failed (exit code {exit_code}): {stderr}")]
    ToolFailed {
        stage: Stage,
        exit_code: i32,
        stderr: String,
    },

    /// The intermediate raster's metadata could not be read.
    #[error("Unreadable raster metadata for {path}: {reason}")]
    Metadata { path: PathBuf, reason: String },

    /// Filesystem error around the target or the temporaries.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl PipelineError {
    /// The stage this error belongs to, if it is a stage failure.
    pub fn stage(&self) -> Option<Stage> {
        match self {
            PipelineError::LaunchFailed { stage, .. } | PipelineError::ToolFailed { stage, .. } => {
                Some(*stage)
            }
            _ => None,
        }
    }
}

/// Outcome of a pipeline run that did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    /// The target raster was produced.
    Succeeded,
    /// The target already existed and overwrite is off; nothing was done.
    Skipped,
}

/// Georeferences one image.
///
/// `threads` is the job's share of the compute units as decided by the
/// scheduler; it is passed through to every tool invocation so intra-job
/// parallelism composes with the outer allocation.
///
/// # Errors
///
/// Any stage failure is returned as a `PipelineError`; the caller catches it
/// at the job boundary and continues with the remaining jobs.
pub async fn run(
    job: &JobDescriptor,
    options: &PipelineOptions,
    threads: usize,
    runner: &dyn ToolRunner,
) -> Result<JobOutcome, PipelineError> {
    debug!(source = %job.source_path.display(), "Checking file locations");

    if !job.source_path.is_file() {
        return Err(PipelineError::MissingInput(job.source_path.clone()));
    }

    // A degenerate quadrilateral cannot be registered; reject it before any
    // tool runs.
    if !job.corners_distinct() {
        return Err(PipelineError::DegenerateCorners(job.target_path.clone()));
    }

    if job.target_path.exists() {
        if options.overwrite {
            info!(tile = %job.target_path.display(), "Target exists, overwriting");
            fs::remove_file(&job.target_path)?;
        } else {
            info!(tile = %job.target_path.display(), "Target exists, skipping");
            return Ok(JobOutcome::Skipped);
        }
    }

    if let Some(parent) = job.target_path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            debug!(dir = %parent.display(), "Creating target directory");
            fs::create_dir_all(parent)?;
        }
    }

    // Stage 1: raw capture to intermediate raster.
    let converted = temp_raster(options)?;
    let convert = ToolInvocation::new(&options.converter)
        .args(options.converter_args.iter().cloned())
        .arg("--threads")
        .arg(threads.to_string())
        .arg(path_arg(&job.source_path))
        .arg(path_arg(converted.path()))
        .with_nice(CONVERTER_NICE);
    info!(source = %job.source_path.display(), "Converting raw capture");
    run_stage(runner, Stage::Convert, &convert).await?;

    // The registration corners come from the intermediate raster's own
    // metadata, not from assumptions about the capture format.
    let (width, height) = raster_size(runner, converted.path()).await?;
    debug!(width, height, "Intermediate raster size");

    let srs = format!("epsg:{}", job.epsg);

    // Stage 2: register the four corners.
    let registered = temp_raster(options)?;
    let mut translate = ToolInvocation::new("gdal_translate").args(["-of", "GTiff"]);
    for (pixel_x, pixel_y, point) in corner_gcps(job, width, height) {
        translate = translate.args([
            "-gcp".to_string(),
            pixel_x.to_string(),
            pixel_y.to_string(),
            point.easting.to_string(),
            point.northing.to_string(),
        ]);
    }
    translate = translate
        .args(["-a_srs", srs.as_str()])
        .args(["-oo".to_string(), format!("NUM_THREADS={}", threads)])
        .args(["-r", options.resample.as_str()]);
    if options.capabilities.multicore {
        translate = translate.args(["-co".to_string(), format!("NUM_THREADS={}", threads)]);
    }
    translate = translate
        .arg(path_arg(converted.path()))
        .arg(path_arg(registered.path()));
    info!(tile = %job.target_path.display(), "Transforming image to given coordinates");
    run_stage(runner, Stage::Translate, &translate).await?;

    // Stage 3: warp into the target CRS. The warp writes the target
    // directly unless a compression pass follows.
    let warped_temp = if options.compress {
        Some(temp_raster(options)?)
    } else {
        None
    };
    let warp_destination: &Path = warped_temp
        .as_ref()
        .map(|t| t.path())
        .unwrap_or(&job.target_path);

    let mut warp = ToolInvocation::new("gdalwarp")
        .args(["-of", "GTiff"])
        .args(["-dstnodata", "0 0 0"])
        .args(["-t_srs", srs.as_str()])
        .args([
            "--config".to_string(),
            "GDAL_CACHEMAX".to_string(),
            WARP_CACHE_MB.to_string(),
        ])
        .args(["-wm".to_string(), WARP_CACHE_MB.to_string()])
        .args(["-wo".to_string(), format!("NUM_THREADS={}", threads)])
        .args(["-oo".to_string(), format!("NUM_THREADS={}", threads)])
        .args(["-r", options.resample.as_str()])
        .args(["-co".to_string(), format!("BLOCKXSIZE={}", options.block_size.x)])
        .args(["-co".to_string(), format!("BLOCKYSIZE={}", options.block_size.y)])
        .args([
            "-tr".to_string(),
            options.resolution.to_string(),
            options.resolution.to_string(),
        ]);
    if options.capabilities.multicore {
        warp = warp.args(["-doo".to_string(), format!("NUM_THREADS={}", threads)]);
        if !options.acceleration {
            // The OpenCL warp path is unreliable; opt out unless requested.
            warp = warp.args(["-wo", "USE_OPENCL=FALSE"]);
        }
    }
    warp = warp
        .arg(path_arg(registered.path()))
        .arg(path_arg(warp_destination));
    info!(tile = %job.target_path.display(), "Warping image");
    run_stage(runner, Stage::Warp, &warp).await?;

    // Stage 4: optional 8-bit downcast and JPEG compression.
    if let Some(warped) = &warped_temp {
        let compress = ToolInvocation::new("gdal_translate")
            .args(["-of", "GTiff"])
            .args(["-ot", "Byte"])
            .args(["-scale", "0", "65535", "0", "255"])
            .args(["-co", "COMPRESS=JPEG"])
            .args(["-co".to_string(), format!("JPEG_QUALITY={}", options.quality)])
            .arg(path_arg(warped.path()))
            .arg(path_arg(&job.target_path));
        info!(tile = %job.target_path.display(), quality = options.quality, "Compressing image");
        run_stage(runner, Stage::Compress, &compress).await?;
    }

    // Stage 5: drop the sidecar metadata the tool chain leaves behind.
    let aux = aux_path(&job.target_path);
    if aux.is_file() {
        debug!(aux = %aux.display(), "Removing auxiliary file");
        fs::remove_file(&aux)?;
    }

    Ok(JobOutcome::Succeeded)
}

/// Runs one stage and maps a non-zero exit to a stage failure.
async fn run_stage(
    runner: &dyn ToolRunner,
    stage: Stage,
    invocation: &ToolInvocation,
) -> Result<(), PipelineError> {
    debug!(stage = %stage, command = %invocation, "Invoking tool");

    let output = runner
        .run(invocation)
        .await
        .map_err(|source| PipelineError::LaunchFailed { stage, source })?;

    if output.success() {
        Ok(())
    } else {
        Err(PipelineError::ToolFailed {
            stage,
            exit_code: output.exit_code.unwrap_or(-1),
            stderr: output.stderr.trim().to_string(),
        })
    }
}

/// The four pixel-to-geographic correspondences for a raster of the given
/// size: `(0,0)` is the north-west corner, `(width,0)` north-east,
/// `(0,height)` south-west and `(width,height)` south-east.
pub fn corner_gcps(
    job: &JobDescriptor,
    width: u64,
    height: u64,
) -> [(u64, u64, GroundControlPoint); 4] {
    [
        (0, 0, job.north_west),
        (width, 0, job.north_east),
        (0, height, job.south_west),
        (width, height, job.south_east),
    ]
}

/// Reads the raster's own size metadata via `gdalinfo -json`.
async fn raster_size(
    runner: &dyn ToolRunner,
    path: &Path,
) -> Result<(u64, u64), PipelineError> {
    let invocation = ToolInvocation::new("gdalinfo").arg("-json").arg(path_arg(path));

    let metadata_err = |reason: String| PipelineError::Metadata {
        path: path.to_path_buf(),
        reason,
    };

    let output = runner
        .run(&invocation)
        .await
        .map_err(|e| metadata_err(e.to_string()))?;
    if !output.success() {
        return Err(metadata_err(format!(
            "gdalinfo exit code {}",
            output.exit_code.unwrap_or(-1)
        )));
    }

    let info: serde_json::Value =
        serde_json::from_str(&output.stdout).map_err(|e| metadata_err(e.to_string()))?;

    let size = info
        .get("size")
        .and_then(|s| s.as_array())
        .ok_or_else(|| metadata_err("missing 'size' field".to_string()))?;
    let width = size
        .first()
        .and_then(|v| v.as_u64())
        .ok_or_else(|| metadata_err("invalid width".to_string()))?;
    let height = size
        .get(1)
        .and_then(|v| v.as_u64())
        .ok_or_else(|| metadata_err("invalid height".to_string()))?;

    Ok((width, height))
}

/// Creates a uniquely named temporary raster, honouring the temp-dir
/// override. The guard deletes the file when dropped.
fn temp_raster(options: &PipelineOptions) -> Result<NamedTempFile, std::io::Error> {
    let builder = {
        let mut b = tempfile::Builder::new();
        b.prefix("geoforge-").suffix(".tif");
        b
    };
    match &options.temp_dir {
        Some(dir) => builder.tempfile_in(dir),
        None => builder.tempfile(),
    }
}

/// The sidecar metadata path GDAL leaves beside an output (`<file>.aux.xml`).
fn aux_path(target: &Path) -> PathBuf {
    let mut name = target.as_os_str().to_owned();
    name.push(".aux.xml");
    PathBuf::from(name)
}

fn path_arg(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}
