//! geoforge: batch georeferencing of survey image tiles.
//!
//! Source images are selected from a PostgreSQL catalog, converted from the
//! proprietary raw capture format to an intermediate GeoTIFF, registered with
//! four corner ground-control points, warped into the target coordinate
//! reference system and optionally JPEG compressed.
//!
//! The crate is organised around two cooperating pieces:
//!
//! - [`scheduler`]: splits the machine's compute units into a static
//!   `(process_count, thread_count)` allocation for a batch of independent
//!   jobs, then dispatches them through a worker pool.
//! - [`pipeline`]: the per-job state machine that drives the external GDAL
//!   tool chain through temporary intermediate files.
//!
//! The [`catalog`] module holds the job descriptors and the database client
//! that produces them; [`cli`] is the command-line surface.

pub mod catalog;
pub mod cli;
pub mod pipeline;
pub mod scheduler;

pub use catalog::job::{GroundControlPoint, JobDescriptor, JobFilter};
pub use pipeline::options::PipelineOptions;
pub use scheduler::allocation::{allocate, Allocation};
