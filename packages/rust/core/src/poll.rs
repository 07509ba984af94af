//! Poll cycle over RUNNING jobs.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use leadscout_shared::{JobStatus, Result};
use leadscout_storage::Storage;
use serde::Serialize;
use tokio::time::MissedTickBehavior;
use tracing::{info, instrument, warn};

use crate::jobs::{JobLifecycle, PollOutcome};

/// Aggregate outcome of one poll cycle.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PollSummary {
    /// Jobs visited, whatever happened to them.
    pub processed: u32,
    pub completed: u32,
    pub failed: u32,
    pub cancelled: u32,
    /// Jobs whose poll raised; they stay RUNNING for the next cycle.
    pub errors: u32,
}

/// Discovers RUNNING jobs and drives each through the state machine.
pub struct PollOrchestrator {
    storage: Arc<Storage>,
    jobs: Arc<dyn JobLifecycle>,
}

impl PollOrchestrator {
    pub fn new(storage: Arc<Storage>, jobs: Arc<dyn JobLifecycle>) -> Self {
        Self { storage, jobs }
    }

    /// Poll every RUNNING job once, oldest first.
    ///
    /// Only the discovery query can fail the cycle. Per-job errors are
    /// logged and counted.
    #[instrument(skip_all)]
    pub async fn poll_cycle(&self) -> Result<PollSummary> {
        let running = self.storage.list_jobs_by_status(JobStatus::Running).await?;
        let mut summary = PollSummary::default();

        for job in &running {
            summary.processed += 1;
            match self.jobs.poll_one(job).await {
                Ok(PollOutcome::Unchanged) => {}
                Ok(PollOutcome::Completed { .. }) => summary.completed += 1,
                Ok(PollOutcome::Failed { .. }) => summary.failed += 1,
                Ok(PollOutcome::Cancelled) => summary.cancelled += 1,
                Err(e) => {
                    warn!(job_id = %job.id, error = %e, "poll failed, will retry next cycle");
                    summary.errors += 1;
                }
            }
        }

        info!(
            processed = summary.processed,
            completed = summary.completed,
            failed = summary.failed,
            cancelled = summary.cancelled,
            errors = summary.errors,
            "poll cycle finished"
        );
        Ok(summary)
    }

    /// Run [`poll_cycle`](Self::poll_cycle) every `every` until `shutdown`
    /// resolves. A failed cycle is logged and the loop keeps going.
    pub async fn watch<F>(&self, every: Duration, shutdown: F) -> u64
    where
        F: Future<Output = ()>,
    {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        let mut cycles = 0u64;
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!(cycles, "watch loop stopping");
                    return cycles;
                }
                _ = ticker.tick() => {
                    cycles += 1;
                    if let Err(e) = self.poll_cycle().await {
                        warn!(error = %e, "poll cycle failed");
                    }
                }
            }
        }
    }
}
