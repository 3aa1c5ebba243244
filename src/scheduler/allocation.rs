//! Static compute-unit allocation.
//!
//! Each job's actual work happens in external tool subprocesses that take a
//! thread-count option, so the scheduler splits the machine between
//! *process-level* parallelism (how many jobs run at once) and *thread-level*
//! parallelism (how many threads each job's tools may use). The split is
//! computed once per batch and never rebalanced.

use thiserror::Error;

/// Errors that can occur while computing an allocation.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AllocationError {
    /// The batch is empty. Callers must report "no matching jobs" and exit
    /// before scheduling instead of allocating for zero jobs.
    #[error("Cannot allocate workers for an empty batch")]
    EmptyBatch,

    /// No compute units are available.
    #[error("Cannot allocate workers without compute units")]
    NoComputeUnits,
}

/// How a batch is spread over the available compute units.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Allocation {
    /// Number of jobs run concurrently.
    pub process_count: usize,
    /// Threads granted to each job's external tool invocations.
    pub thread_count: usize,
}

impl Allocation {
    /// Total parallelism requested across all concurrent jobs.
    ///
    /// May exceed the compute-unit count by the slack the ceiling divisions
    /// introduce, never by more.
    pub fn total_parallelism(&self) -> usize {
        self.process_count * self.thread_count
    }
}

impl std::fmt::Display for Allocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} concurrent jobs x {} threads",
            self.process_count, self.thread_count
        )
    }
}

/// Computes the allocation for `batch_size` jobs over `compute_units` units.
///
/// `thread_count = min(C, ceil(C / N))` gives every job at least one thread
/// without over-subscribing a single job when the batch is large;
/// `process_count = min(C, ceil(C / thread_count))` then caps concurrency so
/// the product stays within the unit count up to ceiling slack. A single job
/// receives all units as threads; a batch at least as large as the unit
/// count runs single-threaded jobs.
///
/// # Errors
///
/// Returns an error for an empty batch or a zero unit count.
pub fn allocate(batch_size: usize, compute_units: usize) -> Result<Allocation, AllocationError> {
    if batch_size == 0 {
        return Err(AllocationError::EmptyBatch);
    }
    if compute_units == 0 {
        return Err(AllocationError::NoComputeUnits);
    }

    let thread_count = compute_units.min(compute_units.div_ceil(batch_size));
    let process_count = compute_units.min(compute_units.div_ceil(thread_count));

    Ok(Allocation {
        process_count,
        thread_count,
    })
}
