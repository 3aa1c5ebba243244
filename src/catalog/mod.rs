//! Image catalog: job descriptors and the database client that selects them.

pub mod database;
pub mod job;

pub use database::{Catalog, CatalogConfig, CatalogError};
pub use job::{GroundControlPoint, JobDescriptor, JobFilter};
