//! Worker pool dispatching a batch of georeferencing jobs.
//!
//! The pool spawns exactly `process_count` workers. Each worker pulls one
//! job at a time from a shared queue and runs the pipeline with the static
//! per-job thread budget; there is no work stealing, no rebalancing and no
//! retry. Failures are caught at the job boundary, recorded, and the batch
//! continues.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use serde::Serialize;
use tracing::{error, info, warn};

use crate::catalog::job::JobDescriptor;
use crate::pipeline;
use crate::pipeline::options::PipelineOptions;
use crate::pipeline::runner::JobOutcome;
use crate::pipeline::tools::ToolRunner;

use super::allocation::Allocation;

/// Final status of one job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// The target raster was produced.
    Succeeded,
    /// The target already existed; nothing was done.
    Skipped,
    /// A pipeline stage failed; the target was not produced.
    Failed,
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Succeeded => write!(f, "succeeded"),
            JobStatus::Skipped => write!(f, "skipped"),
            JobStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Outcome report for one job.
#[derive(Debug, Clone, Serialize)]
pub struct JobReport {
    /// Target path identifying the job.
    pub target_path: PathBuf,
    /// Final status.
    pub status: JobStatus,
    /// Failing stage, when the job failed.
    pub stage: Option<String>,
    /// Failure reason, when the job failed.
    pub reason: Option<String>,
}

impl JobReport {
    fn succeeded(job: &JobDescriptor) -> Self {
        Self {
            target_path: job.target_path.clone(),
            status: JobStatus::Succeeded,
            stage: None,
            reason: None,
        }
    }

    fn skipped(job: &JobDescriptor) -> Self {
        Self {
            target_path: job.target_path.clone(),
            status: JobStatus::Skipped,
            stage: None,
            reason: None,
        }
    }

    fn failed(job: &JobDescriptor, error: &pipeline::PipelineError) -> Self {
        Self {
            target_path: job.target_path.clone(),
            status: JobStatus::Failed,
            stage: error.stage().map(|s| s.to_string()),
            reason: Some(error.to_string()),
        }
    }
}

/// Aggregate outcome of a dispatched batch.
#[derive(Debug, Serialize)]
pub struct BatchSummary {
    /// Jobs that produced their target.
    pub succeeded: u64,
    /// Jobs skipped because the target already existed.
    pub skipped: u64,
    /// Jobs that failed in some pipeline stage.
    pub failed: u64,
    /// Wall-clock duration of the whole batch in milliseconds.
    pub duration_ms: u64,
    /// Per-job reports, grouped by worker.
    pub reports: Vec<JobReport>,
}

impl BatchSummary {
    /// Total number of processed jobs.
    pub fn total(&self) -> u64 {
        self.succeeded + self.skipped + self.failed
    }
}

impl std::fmt::Display for BatchSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} succeeded, {} skipped, {} failed ({} jobs in {:.1}s)",
            self.succeeded,
            self.skipped,
            self.failed,
            self.total(),
            self.duration_ms as f64 / 1000.0
        )
    }
}

/// Worker pool bound to one pipeline configuration and tool runner.
pub struct WorkerPool {
    options: Arc<PipelineOptions>,
    runner: Arc<dyn ToolRunner>,
}

impl WorkerPool {
    /// Creates a new pool.
    pub fn new(options: PipelineOptions, runner: Arc<dyn ToolRunner>) -> Self {
        Self {
            options: Arc::new(options),
            runner,
        }
    }

    /// Runs the whole batch under the given allocation and waits for it.
    ///
    /// Spawns `allocation.process_count` workers; each processes one job at
    /// a time with `allocation.thread_count` threads for its tools.
    pub async fn dispatch(
        &self,
        jobs: Vec<JobDescriptor>,
        allocation: Allocation,
    ) -> BatchSummary {
        let start = Instant::now();
        let batch_size = jobs.len();

        info!(
            jobs = batch_size,
            processes = allocation.process_count,
            threads = allocation.thread_count,
            "Dispatching batch"
        );

        let queue = Arc::new(Mutex::new(VecDeque::from(jobs)));

        let mut handles = Vec::with_capacity(allocation.process_count);
        for i in 0..allocation.process_count {
            let worker = Worker {
                id: format!("worker-{}", i),
                queue: Arc::clone(&queue),
                options: Arc::clone(&self.options),
                runner: Arc::clone(&self.runner),
                threads: allocation.thread_count,
            };
            handles.push(tokio::spawn(worker.run()));
        }

        // Each worker hands its reports back through the join handle, and
        // the counters are tallied from those reports, so the two cannot
        // disagree.
        let mut reports = Vec::with_capacity(batch_size);
        for handle in handles {
            match handle.await {
                Ok(mut worker_reports) => reports.append(&mut worker_reports),
                Err(e) => error!(error = %e, "Worker task panicked"),
            }
        }

        let tally = |status: JobStatus| -> u64 {
            reports.iter().filter(|r| r.status == status).count() as u64
        };
        let succeeded = tally(JobStatus::Succeeded);
        let skipped = tally(JobStatus::Skipped);
        let failed = tally(JobStatus::Failed);

        let summary = BatchSummary {
            succeeded,
            skipped,
            failed,
            duration_ms: start.elapsed().as_millis() as u64,
            reports,
        };

        info!(summary = %summary, "Batch complete");
        summary
    }
}

/// A single worker draining the shared job queue.
struct Worker {
    id: String,
    queue: Arc<Mutex<VecDeque<JobDescriptor>>>,
    options: Arc<PipelineOptions>,
    runner: Arc<dyn ToolRunner>,
    threads: usize,
}

impl Worker {
    async fn run(self) -> Vec<JobReport> {
        info!(worker_id = %self.id, "Worker started");

        let mut reports = Vec::new();
        loop {
            // Lock is held only for the pop, never across an await.
            let job = self
                .queue
                .lock()
                .map(|mut q| q.pop_front())
                .unwrap_or(None);

            let Some(job) = job else {
                break;
            };

            reports.push(self.process_job(&job).await);
        }

        info!(worker_id = %self.id, jobs = reports.len(), "Worker stopped");
        reports
    }

    async fn process_job(&self, job: &JobDescriptor) -> JobReport {
        match pipeline::run(job, &self.options, self.threads, self.runner.as_ref()).await {
            Ok(JobOutcome::Succeeded) => {
                info!(
                    worker_id = %self.id,
                    tile = %job.target_path.display(),
                    "Job succeeded"
                );
                JobReport::succeeded(job)
            }
            Ok(JobOutcome::Skipped) => {
                info!(
                    worker_id = %self.id,
                    tile = %job.target_path.display(),
                    "Job skipped, target exists"
                );
                JobReport::skipped(job)
            }
            Err(e) => {
                warn!(
                    worker_id = %self.id,
                    tile = %job.target_path.display(),
                    stage = e.stage().map(|s| s.to_string()).unwrap_or_default(),
                    error = %e,
                    "Job failed"
                );
                JobReport::failed(job, &e)
            }
        }
    }
}
