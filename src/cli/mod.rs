//! Command-line interface for geoforge.
//!
//! Owns the argument surface, the catalog selection, the capability probe
//! and the hand-off to the scheduler.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli};
