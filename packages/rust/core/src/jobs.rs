//! Research job state machine.
//!
//! ```text
//! PENDING ──submit ok──▶ RUNNING ──remote completed──▶ COMPLETED
//!    │                      ├──remote failed / parse error──▶ FAILED
//!    └──submit error──▶ FAILED └──remote cancelled──▶ CANCELLED
//! ```
//!
//! Every status write is conditional on the status the job was read with,
//! so two actors racing on one job end in a conflict instead of a mixed
//! state. Terminal jobs can be re-parsed from their stored output with
//! [`JobLifecycle::reprocess`].

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use leadscout_remote::{RemoteState, ResearchService};
use leadscout_shared::{
    CandidateRecord, JobId, JobStatus, LeadScoutError, ParseTier, ResearchJob, Result,
};
use leadscout_storage::Storage;
use serde_json::json;
use tracing::{error, info, instrument, warn};

use crate::matcher::{KeyMatcher, RecordMatcher};
use crate::merger::{FillBlanksMerger, RecordMerger};
use crate::parser::{ResponseParser, preview, response_schema};
use crate::prompt::PromptConfig;
use crate::reconcile::{ReconcileSummary, Reconciler};

/// Characters of raw output quoted in a job's error after a parse failure.
const ERROR_PREVIEW_CHARS: usize = 500;

/// What a single poll did to a RUNNING job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    /// The remote interaction is still in progress; nothing was written.
    Unchanged,
    Completed {
        created: u32,
        updated: u32,
        tier: ParseTier,
    },
    Failed {
        error: String,
    },
    Cancelled,
}

/// Lifecycle operations on research jobs.
#[async_trait]
pub trait JobLifecycle: Send + Sync {
    /// Create a job for a locality (id or name) and start the remote
    /// research. Returns the RUNNING job.
    async fn submit(&self, locality_ref: &str, prompt: &PromptConfig) -> Result<ResearchJob>;

    /// Check a RUNNING job against the research service once.
    async fn poll_one(&self, job: &ResearchJob) -> Result<PollOutcome>;

    /// Re-parse and re-reconcile a terminal job's stored output.
    async fn reprocess(&self, job_id: &JobId) -> Result<ResearchJob>;

    /// Delete a terminal job.
    async fn delete(&self, job_id: &JobId) -> Result<()>;
}

/// The job state machine over storage, a research service and a parser.
pub struct JobMachine {
    storage: Arc<Storage>,
    research: Arc<dyn ResearchService>,
    parser: Arc<dyn ResponseParser>,
    matcher: Box<dyn RecordMatcher>,
    merger: Box<dyn RecordMerger>,
}

impl JobMachine {
    pub fn new(
        storage: Arc<Storage>,
        research: Arc<dyn ResearchService>,
        parser: Arc<dyn ResponseParser>,
    ) -> Self {
        Self {
            storage,
            research,
            parser,
            matcher: Box::new(KeyMatcher),
            merger: Box::new(FillBlanksMerger),
        }
    }

    /// Replace the default [`KeyMatcher`].
    pub fn with_matcher(mut self, matcher: Box<dyn RecordMatcher>) -> Self {
        self.matcher = matcher;
        self
    }

    /// Replace the default [`FillBlanksMerger`].
    pub fn with_merger(mut self, merger: Box<dyn RecordMerger>) -> Self {
        self.merger = merger;
        self
    }

    /// Parse `raw` and reconcile the records into the job's locality.
    async fn process_output(
        &self,
        job: &ResearchJob,
        raw: &str,
    ) -> Result<(Vec<CandidateRecord>, ParseTier, ReconcileSummary)> {
        let parsed = self.parser.parse(raw).await?;
        let locality = self
            .storage
            .get_locality(&job.locality_id)
            .await?
            .ok_or_else(|| LeadScoutError::not_found(format!("locality {}", job.locality_id)))?;

        let reconciler = Reconciler {
            storage: &self.storage,
            matcher: self.matcher.as_ref(),
            merger: self.merger.as_ref(),
        };
        let summary = reconciler.run(&locality, &parsed.records).await;

        info!(
            job_id = %job.id,
            tier = %parsed.tier,
            candidates = parsed.records.len(),
            created = summary.created,
            updated = summary.updated,
            skipped = summary.skipped,
            "reconciled research output"
        );
        Ok((parsed.records, parsed.tier, summary))
    }

    /// Record a parse/reconcile result on `job` without changing status.
    fn store_result(
        job: &mut ResearchJob,
        records: Vec<CandidateRecord>,
        tier: ParseTier,
        summary: ReconcileSummary,
    ) {
        job.result = Some(json!({ "records": records }));
        job.parse_tier = Some(tier);
        job.records_created = summary.created;
        job.records_updated = summary.updated;
        job.updated_at = Utc::now();
    }

    async fn fail(&self, job: &mut ResearchJob, expected: JobStatus, error: String) -> Result<()> {
        warn!(job_id = %job.id, %error, "research job failed");
        job.error = Some(error);
        job.finish(JobStatus::Failed);
        self.storage.update_job(job, expected).await
    }

    /// Move a PENDING job to FAILED while another error is already being
    /// returned. A failure to do so is only logged.
    async fn fail_or_log(&self, job: &mut ResearchJob, error: String) {
        if let Err(e) = self.fail(job, JobStatus::Pending, error).await {
            error!(job_id = %job.id, error = %e, "could not mark pending job as failed");
        }
    }
}

#[async_trait]
impl JobLifecycle for JobMachine {
    #[instrument(skip_all, fields(locality = %locality_ref))]
    async fn submit(&self, locality_ref: &str, prompt: &PromptConfig) -> Result<ResearchJob> {
        let locality = self
            .storage
            .find_locality(locality_ref)
            .await?
            .ok_or_else(|| LeadScoutError::not_found(format!("locality '{locality_ref}'")))?;

        let record_types = self.storage.list_record_types().await?;
        let schema = response_schema();
        let text = prompt.render(&locality, &record_types, &schema);

        let mut job = ResearchJob::new(&locality.id);
        self.storage.insert_job(&job).await?;

        // From here on every exit leaves the row terminal.
        let handle = match self.research.submit(&text, &schema).await {
            Ok(handle) => handle,
            Err(e) => {
                self.fail_or_log(&mut job, e.to_string()).await;
                return Err(e);
            }
        };

        job.interaction_id = Some(handle);
        job.status = JobStatus::Running;
        job.updated_at = Utc::now();
        if let Err(e) = self.storage.update_job(&job, JobStatus::Pending).await {
            let error = format!(
                "submitted as {} but the job could not be marked running: {e}",
                job.interaction_id.as_deref().unwrap_or_default()
            );
            self.fail_or_log(&mut job, error).await;
            return Err(e);
        }

        info!(
            job_id = %job.id,
            locality = %locality,
            interaction_id = job.interaction_id.as_deref().unwrap_or_default(),
            "research submitted"
        );
        Ok(job)
    }

    #[instrument(skip_all, fields(job_id = %job.id))]
    async fn poll_one(&self, job: &ResearchJob) -> Result<PollOutcome> {
        if job.status != JobStatus::Running {
            return Err(LeadScoutError::invalid_state(format!(
                "job {} is {}, only running jobs can be polled",
                job.id, job.status
            )));
        }

        let mut job = job.clone();
        let Some(handle) = job.interaction_id.clone() else {
            let error = "running job has no interaction handle".to_string();
            self.fail(&mut job, JobStatus::Running, error.clone()).await?;
            return Ok(PollOutcome::Failed { error });
        };

        // Remote errors leave the job untouched; the next cycle retries.
        let status = self.research.get_status(&handle).await?;

        match status.state {
            RemoteState::Pending | RemoteState::Running => Ok(PollOutcome::Unchanged),
            RemoteState::Failed => {
                let error = status
                    .error
                    .unwrap_or_else(|| format!("remote status: {}", status.state.as_str()));
                self.fail(&mut job, JobStatus::Running, error.clone()).await?;
                Ok(PollOutcome::Failed { error })
            }
            RemoteState::Cancelled => {
                job.error = Some(
                    status
                        .error
                        .unwrap_or_else(|| format!("remote status: {}", status.state.as_str())),
                );
                job.finish(JobStatus::Cancelled);
                self.storage.update_job(&job, JobStatus::Running).await?;
                info!(job_id = %job.id, "research job cancelled remotely");
                Ok(PollOutcome::Cancelled)
            }
            RemoteState::Completed => {
                let raw = status.payload.unwrap_or_default();
                job.raw_result = Some(raw.clone());

                match self.process_output(&job, &raw).await {
                    Ok((records, tier, summary)) => {
                        Self::store_result(&mut job, records, tier, summary);
                        job.error = None;
                        job.finish(JobStatus::Completed);
                        self.storage.update_job(&job, JobStatus::Running).await?;
                        info!(
                            job_id = %job.id,
                            created = summary.created,
                            updated = summary.updated,
                            "research job completed"
                        );
                        Ok(PollOutcome::Completed {
                            created: summary.created,
                            updated: summary.updated,
                            tier,
                        })
                    }
                    Err(e) => {
                        let error = format!(
                            "{e}\n\nraw output preview:\n{}",
                            preview(&raw, ERROR_PREVIEW_CHARS)
                        );
                        self.fail(&mut job, JobStatus::Running, error.clone()).await?;
                        Ok(PollOutcome::Failed { error })
                    }
                }
            }
        }
    }

    #[instrument(skip_all, fields(job_id = %job_id))]
    async fn reprocess(&self, job_id: &JobId) -> Result<ResearchJob> {
        let mut job = self
            .storage
            .get_job(job_id)
            .await?
            .ok_or_else(|| LeadScoutError::not_found(format!("job {job_id}")))?;

        if job.status.is_in_flight() {
            return Err(LeadScoutError::conflict(format!(
                "job {job_id} is {} and cannot be reprocessed until it finishes",
                job.status
            )));
        }
        let Some(raw) = job.raw_result.clone() else {
            return Err(LeadScoutError::validation(format!(
                "job {job_id} has no stored research output to reprocess"
            )));
        };

        let prior = job.status;
        match self.process_output(&job, &raw).await {
            Ok((records, tier, summary)) => {
                Self::store_result(&mut job, records, tier, summary);
                if prior == JobStatus::Failed {
                    job.error = None;
                    job.finish(JobStatus::Completed);
                }
                self.storage.update_job(&job, prior).await?;
                info!(job_id = %job.id, status = %job.status, "research job reprocessed");
                Ok(job)
            }
            Err(e) => {
                if prior == JobStatus::Failed {
                    job.error = Some(format!(
                        "{e}\n\nraw output preview:\n{}",
                        preview(&raw, ERROR_PREVIEW_CHARS)
                    ));
                    job.updated_at = Utc::now();
                    self.storage.update_job(&job, prior).await?;
                }
                Err(e)
            }
        }
    }

    #[instrument(skip_all, fields(job_id = %job_id))]
    async fn delete(&self, job_id: &JobId) -> Result<()> {
        self.storage.delete_job(job_id).await?;
        info!(job_id = %job_id, "research job deleted");
        Ok(())
    }
}
