//! Background execution of queued rebalance jobs.

use std::path::Path;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use jobtrack_core::{ids::RebalanceJobId, position::PositionGroup};
use jobtrack_storage::{ItemStore, JobQueue, JobStatus, SqliteStorage, StorageError};

use crate::config::EngineConfig;
use crate::context::ExecutionContext;
use crate::rebalance::{RebalanceOutcome, run_rebalance};
use crate::EngineError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobReport {
    Completed {
        job_id: RebalanceJobId,
        group: PositionGroup,
        outcome: RebalanceOutcome,
    },
    /// Attempt failed and the job went back to the queue.
    Retrying {
        job_id: RebalanceJobId,
        attempts: u32,
        error: String,
    },
    /// Attempt failed and no attempts are left.
    DeadLettered {
        job_id: RebalanceJobId,
        attempts: u32,
        error: String,
    },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JobRunSummary {
    pub processed: usize,
    pub rebalanced: usize,
    pub skipped: usize,
    pub retried: usize,
    pub dead_lettered: usize,
}

impl JobRunSummary {
    pub fn record(&mut self, report: &JobReport) {
        self.processed += 1;
        match report {
            JobReport::Completed {
                outcome: RebalanceOutcome::Rebalanced { .. },
                ..
            } => self.rebalanced += 1,
            JobReport::Completed { .. } => self.skipped += 1,
            JobReport::Retrying { .. } => self.retried += 1,
            JobReport::DeadLettered { .. } => self.dead_lettered += 1,
        }
    }

    pub fn merge(&mut self, other: JobRunSummary) {
        self.processed += other.processed;
        self.rebalanced += other.rebalanced;
        self.skipped += other.skipped;
        self.retried += other.retried;
        self.dead_lettered += other.dead_lettered;
    }
}

/// Claim and run one job. Job failures are handed back to the queue's retry
/// policy; only queue bookkeeping failures are returned as errors.
pub fn process_next_job<S>(
    storage: &mut S,
    config: &EngineConfig,
) -> Result<Option<JobReport>, StorageError>
where
    S: ItemStore + JobQueue,
{
    let Some(job) = storage.claim_next_job()? else {
        return Ok(None);
    };

    // Every job run is its own execution.
    let ctx = ExecutionContext::new();
    match run_rebalance(&ctx, storage, &job.group, config) {
        Ok(outcome) => {
            storage.complete_job(job.job_id)?;
            tracing::debug!(job_id = %job.job_id, ?outcome, "rebalance job done");
            Ok(Some(JobReport::Completed {
                job_id: job.job_id,
                group: job.group,
                outcome,
            }))
        }
        Err(err) => {
            let error = err.to_string();
            let status = storage.fail_job(job.job_id, &error, config.queue.retry_backoff_ms)?;
            if status == JobStatus::Failed {
                tracing::error!(
                    job_id = %job.job_id,
                    group = %job.group,
                    attempts = job.attempts,
                    %error,
                    "rebalance job gave up"
                );
                Ok(Some(JobReport::DeadLettered {
                    job_id: job.job_id,
                    attempts: job.attempts,
                    error,
                }))
            } else {
                tracing::warn!(
                    job_id = %job.job_id,
                    group = %job.group,
                    attempts = job.attempts,
                    %error,
                    "rebalance job failed, will retry"
                );
                Ok(Some(JobReport::Retrying {
                    job_id: job.job_id,
                    attempts: job.attempts,
                    error,
                }))
            }
        }
    }
}

/// Put jobs whose claim outlived the lease back in the queue. Covers a run
/// whose outcome could not be recorded, which would otherwise stay `running`.
pub fn requeue_expired<S>(storage: &mut S, config: &EngineConfig) -> Result<usize, StorageError>
where
    S: JobQueue,
{
    let requeued = storage.requeue_expired(config.queue.claim_lease_ms)?;
    if requeued > 0 {
        tracing::warn!(requeued, lease_ms = config.queue.claim_lease_ms, "re-queued expired rebalance jobs");
    }
    Ok(requeued)
}

/// Run jobs until none is runnable. Terminates because every failed attempt
/// counts against the job's `max_attempts`.
pub fn drain_queue<S>(storage: &mut S, config: &EngineConfig) -> Result<JobRunSummary, StorageError>
where
    S: ItemStore + JobQueue,
{
    requeue_expired(storage, config)?;
    let mut summary = JobRunSummary::default();
    while let Some(report) = process_next_job(storage, config)? {
        summary.record(&report);
    }
    Ok(summary)
}

/// A thread that polls the queue of a database file with its own connection.
pub struct RebalanceWorker {
    shutdown: Sender<()>,
    handle: JoinHandle<JobRunSummary>,
}

impl RebalanceWorker {
    /// Open `path`, put jobs orphaned by a previous run back in the queue,
    /// and start polling.
    pub fn spawn(path: impl AsRef<Path>, config: EngineConfig) -> Result<Self, EngineError> {
        config.validate()?;
        let mut storage = SqliteStorage::open(path)?;

        let recovered = storage.recover_jobs()?;
        if recovered > 0 {
            tracing::warn!(recovered, "re-queued rebalance jobs left running");
        }

        let (shutdown, signal) = mpsc::channel();
        let handle = thread::Builder::new()
            .name("rebalance-worker".into())
            .spawn(move || worker_loop(storage, config, signal))?;
        tracing::info!("rebalance worker started");

        Ok(Self { shutdown, handle })
    }

    /// Stop after the current batch and return what the worker did.
    pub fn shutdown(self) -> Result<JobRunSummary, EngineError> {
        // The worker may already have exited; joining is what matters.
        let _ = self.shutdown.send(());
        let summary = self.handle.join().map_err(|_| EngineError::WorkerPanicked)?;
        tracing::info!(processed = summary.processed, "rebalance worker stopped");
        Ok(summary)
    }
}

fn worker_loop(
    mut storage: SqliteStorage,
    config: EngineConfig,
    signal: Receiver<()>,
) -> JobRunSummary {
    let poll_interval = Duration::from_millis(config.queue.poll_interval_ms);
    let mut summary = JobRunSummary::default();

    loop {
        if let Err(err) = requeue_expired(&mut storage, &config) {
            tracing::warn!(error = %err, "could not re-queue expired jobs");
        }

        let mut handled = 0;
        while handled < config.queue.batch_size {
            match process_next_job(&mut storage, &config) {
                Ok(Some(report)) => {
                    summary.record(&report);
                    handled += 1;
                }
                Ok(None) => break,
                Err(err) if err.is_transient() => {
                    tracing::warn!(error = %err, "queue busy, backing off");
                    break;
                }
                Err(err) => {
                    tracing::error!(error = %err, "queue bookkeeping failed");
                    break;
                }
            }
        }

        let stop = if handled == config.queue.batch_size {
            // More work is likely waiting; only stop if asked.
            match signal.try_recv() {
                Ok(()) | Err(TryRecvError::Disconnected) => true,
                Err(TryRecvError::Empty) => false,
            }
        } else {
            match signal.recv_timeout(poll_interval) {
                Ok(()) | Err(RecvTimeoutError::Disconnected) => true,
                Err(RecvTimeoutError::Timeout) => false,
            }
        };
        if stop {
            return summary;
        }
    }
}
