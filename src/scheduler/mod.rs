//! Job-distribution scheduler.
//!
//! Computes a static `(process_count, thread_count)` split of the available
//! compute units for a batch of independent jobs, then dispatches the batch
//! through a worker pool. Allocation happens once per run; there is no work
//! stealing or rebalancing.

pub mod allocation;
pub mod worker_pool;

pub use allocation::{allocate, Allocation, AllocationError};
pub use worker_pool::{BatchSummary, JobReport, JobStatus, WorkerPool};
