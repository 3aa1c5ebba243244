//! CLI command definitions.
//!
//! One flat command: select images from the catalog by pattern, compute the
//! batch allocation, and run the georeferencing pipeline over the selection.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::Parser;
use tracing::info;

use crate::catalog::{Catalog, CatalogConfig, CatalogError, JobDescriptor, JobFilter};
use crate::pipeline::{
    BlockSize, GdalCapabilities, PipelineOptions, ResampleKernel, SystemToolRunner, ToolRunner,
};
use crate::scheduler::{allocate, WorkerPool};

/// Batch georeferencing of survey image tiles.
#[derive(Parser, Debug)]
#[command(name = "geoforge")]
#[command(about = "Georeference survey images selected from the catalog")]
#[command(version)]
#[command(
    long_about = "geoforge selects raw survey captures from the image catalog, converts them \
to GeoTIFF, registers the four corner coordinates, warps them into the target CRS and \
optionally JPEG-compresses the result.\n\nExample usage:\n  geoforge --session '2023-05.*' \
--camera cam2 --compress --overwrite"
)]
pub struct Cli {
    /// Image data location pattern.
    #[arg(short = 'l', long, default_value = ".*")]
    pub location: String,

    /// Session pattern.
    #[arg(short = 's', long, default_value = ".*")]
    pub session: String,

    /// Transect pattern.
    #[arg(short = 't', long, default_value = ".*")]
    pub transect: String,

    /// Camera pattern.
    #[arg(short = 'c', long, default_value = ".*")]
    pub camera: String,

    /// Image identifier pattern.
    #[arg(short = 'i', long, default_value = ".*")]
    pub image: String,

    /// Full catalog connection URL; overrides the individual --db-* options.
    #[arg(long, env = "DATABASE_URL")]
    pub database_url: Option<String>,

    /// Catalog database host.
    #[arg(long, default_value = "127.0.0.1")]
    pub db_host: String,

    /// Catalog database port.
    #[arg(long, default_value_t = 5432)]
    pub db_port: u16,

    /// Catalog database name.
    #[arg(long, default_value = "daisi")]
    pub db_name: String,

    /// Catalog database user.
    #[arg(long, default_value = "daisi")]
    pub db_user: String,

    /// Catalog database password.
    #[arg(long, default_value = "", env = "GEOFORGE_DB_PASSWORD")]
    pub db_password: String,

    /// Overwrite existing target images instead of skipping them.
    #[arg(short = 'o', long)]
    pub overwrite: bool,

    /// Downcast to 8-bit and JPEG-compress the final image.
    #[arg(long)]
    pub compress: bool,

    /// Compression quality (1-100), only with --compress.
    #[arg(short = 'q', long, default_value_t = 95)]
    pub quality: u8,

    /// Target resolution in CRS units per pixel.
    #[arg(short = 'r', long, default_value_t = 0.02)]
    pub resolution: f64,

    /// Resampling algorithm (near, bilinear, cubic, cubicspline, lanczos,
    /// average, mode).
    #[arg(long, default_value = "lanczos")]
    pub resample: String,

    /// X and Y block size of the output raster tiling.
    #[arg(long, num_args = 2, value_names = ["X", "Y"], default_values_t = [256u32, 256u32])]
    pub block_size: Vec<u32>,

    /// Allow hardware (OpenCL) acceleration in the warp stage.
    #[arg(long)]
    pub opencl: bool,

    /// Directory for temporary intermediate rasters.
    #[arg(long)]
    pub temp_dir: Option<PathBuf>,

    /// Raw converter executable.
    #[arg(long, default_value = "iiq2tif")]
    pub converter: PathBuf,

    /// Extra converter tuning flags, passed through verbatim.
    #[arg(long, default_value = "", allow_hyphen_values = true)]
    pub converter_args: String,

    /// Compute units to spread over the batch; defaults to the detected
    /// logical core count.
    #[arg(long)]
    pub compute_units: Option<usize>,

    /// Print the batch summary as JSON.
    #[arg(long)]
    pub json: bool,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

impl Cli {
    fn filter(&self) -> JobFilter {
        JobFilter::match_all()
            .with_location(&self.location)
            .with_session(&self.session)
            .with_transect(&self.transect)
            .with_camera(&self.camera)
            .with_image(&self.image)
    }

    fn database_url(&self) -> String {
        self.database_url.clone().unwrap_or_else(|| {
            CatalogConfig {
                host: self.db_host.clone(),
                port: self.db_port,
                database: self.db_name.clone(),
                user: self.db_user.clone(),
                password: self.db_password.clone(),
            }
            .connection_url()
        })
    }

    fn pipeline_options(&self) -> anyhow::Result<PipelineOptions> {
        let resample: ResampleKernel = self
            .resample
            .parse()
            .context("invalid --resample value")?;

        let block_size = match self.block_size.as_slice() {
            [x, y] => BlockSize::new(*x, *y),
            _ => bail!("--block-size takes exactly two values"),
        };

        let mut options = PipelineOptions::new()
            .with_resolution(self.resolution)
            .with_resample(resample)
            .with_block_size(block_size)
            .with_acceleration(self.opencl)
            .with_overwrite(self.overwrite)
            .with_converter(&self.converter)
            .with_converter_args(
                self.converter_args
                    .split_whitespace()
                    .map(String::from)
                    .collect(),
            );
        if self.compress {
            options = options.with_compression(self.quality);
        }
        if let Some(dir) = &self.temp_dir {
            options = options.with_temp_dir(dir);
        }

        options.validate().context("invalid pipeline options")?;
        Ok(options)
    }
}

/// Parses the command line.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Parses the command line and runs the batch.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Runs the batch for already-parsed arguments.
///
/// The exit status reflects whether the run reached scheduling (catalog
/// reachable, at least one matching image, valid configuration); individual
/// job failures are reported in the summary but do not fail the process.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    let options = cli.pipeline_options()?;
    let filter = cli.filter();

    let catalog = Catalog::connect(&cli.database_url())
        .await
        .context("connecting to the image catalog")?;

    let jobs = jobs_or_abort(catalog.fetch_jobs(&filter).await)?;
    info!(jobs = jobs.len(), "Catalog selection complete");

    let runner: Arc<dyn ToolRunner> = Arc::new(SystemToolRunner::new());

    // Probe the tool chain once; workers only branch on the cached flag.
    let capabilities = GdalCapabilities::probe(runner.as_ref()).await;
    info!(multicore = capabilities.multicore, "Probed GDAL capabilities");
    let options = options.with_capabilities(capabilities);

    let compute_units = cli.compute_units.unwrap_or_else(detect_compute_units);
    let allocation = allocate(jobs.len(), compute_units)?;
    info!(%allocation, compute_units, "Computed allocation");

    let summary = WorkerPool::new(options, runner).dispatch(jobs, allocation).await;

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        println!("{}", summary);
    }

    Ok(())
}

/// Maps the catalog selection onto the run outcome. An empty selection
/// aborts the run here, before any allocation or dispatch happens.
fn jobs_or_abort(
    fetched: Result<Vec<JobDescriptor>, CatalogError>,
) -> anyhow::Result<Vec<JobDescriptor>> {
    match fetched {
        Ok(jobs) => Ok(jobs),
        Err(CatalogError::NoMatchingImages) => {
            bail!("no matching jobs: the patterns selected nothing from the catalog")
        }
        Err(e) => Err(e).context("querying the image catalog"),
    }
}

/// Detected logical core count, with a floor of one.
fn detect_compute_units() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    use crate::catalog::GroundControlPoint;

    #[test]
    fn test_cli_debug_assert() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_defaults() {
        let cli = Cli::try_parse_from(["geoforge"]).unwrap();

        assert_eq!(cli.location, ".*");
        assert_eq!(cli.session, ".*");
        assert!(!cli.overwrite);
        assert!(!cli.compress);
        assert_eq!(cli.quality, 95);
        assert_eq!(cli.block_size, vec![256, 256]);
        assert_eq!(cli.resample, "lanczos");
        assert!(cli.compute_units.is_none());
        assert_eq!(cli.log_level, "info");
    }

    #[test]
    fn test_filter_from_args() {
        let cli = Cli::try_parse_from([
            "geoforge",
            "--session",
            "2023-05.*",
            "--camera",
            "cam2",
        ])
        .unwrap();

        let filter = cli.filter();
        assert_eq!(filter.session, "2023-05.*");
        assert_eq!(filter.camera, "cam2");
        assert_eq!(filter.transect, ".*");
    }

    #[test]
    fn test_pipeline_options_from_args() {
        let cli = Cli::try_parse_from([
            "geoforge",
            "--compress",
            "--quality",
            "80",
            "--resolution",
            "0.05",
            "--resample",
            "cubic",
            "--block-size",
            "512",
            "512",
            "--converter-args",
            "--bits 16 --recover",
        ])
        .unwrap();

        let options = cli.pipeline_options().unwrap();
        assert!(options.compress);
        assert_eq!(options.quality, 80);
        assert_eq!(options.resample, ResampleKernel::Cubic);
        assert_eq!(options.block_size, BlockSize::new(512, 512));
        assert_eq!(
            options.converter_args,
            vec!["--bits", "16", "--recover"]
        );
    }

    #[test]
    fn test_invalid_resample_rejected() {
        let cli = Cli::try_parse_from(["geoforge", "--resample", "sinc"]).unwrap();
        assert!(cli.pipeline_options().is_err());
    }

    #[test]
    fn test_invalid_quality_rejected() {
        let cli = Cli::try_parse_from(["geoforge", "--compress", "--quality", "0"]).unwrap();
        assert!(cli.pipeline_options().is_err());
    }

    #[test]
    fn test_database_url_override() {
        let cli = Cli::try_parse_from([
            "geoforge",
            "--database-url",
            "postgres://u:p@db:5433/survey",
        ])
        .unwrap();
        assert_eq!(cli.database_url(), "postgres://u:p@db:5433/survey");
    }

    #[test]
    fn test_database_url_from_parts() {
        // The url and password options also read the environment; skip when
        // the host environment sets them.
        if std::env::var_os("DATABASE_URL").is_some()
            || std::env::var_os("GEOFORGE_DB_PASSWORD").is_some()
        {
            return;
        }

        let cli = Cli::try_parse_from([
            "geoforge",
            "--db-host",
            "db.example",
            "--db-name",
            "survey",
            "--db-user",
            "reader",
        ])
        .unwrap();
        assert_eq!(
            cli.database_url(),
            "postgres://reader:@db.example:5432/survey"
        );
    }

    #[test]
    fn test_empty_catalog_aborts_before_scheduling() {
        let err = jobs_or_abort(Err(CatalogError::NoMatchingImages)).unwrap_err();
        assert!(err.to_string().contains("no matching jobs"));
    }

    #[test]
    fn test_catalog_query_errors_propagate() {
        let err = jobs_or_abort(Err(CatalogError::InvalidRow("bad epsg".to_string())))
            .unwrap_err();
        assert!(err.to_string().contains("querying the image catalog"));
    }

    #[test]
    fn test_matching_jobs_pass_through() {
        let job = JobDescriptor {
            epsg: 32632,
            source_path: "/data/raw/t01_c2_0001.iiq".into(),
            target_path: "/data/geo/t01_c2_0001.tif".into(),
            north_east: GroundControlPoint::new(1.0, 1.0),
            north_west: GroundControlPoint::new(0.0, 1.0),
            south_east: GroundControlPoint::new(1.0, 0.0),
            south_west: GroundControlPoint::new(0.0, 0.0),
        };

        let jobs = jobs_or_abort(Ok(vec![job.clone()])).unwrap();
        assert_eq!(jobs, vec![job]);
    }

    #[test]
    fn test_detect_compute_units_floor() {
        assert!(detect_compute_units() >= 1);
    }
}
