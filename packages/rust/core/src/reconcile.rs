//! Reconciliation of parsed candidates into persisted records.

use leadscout_shared::{CandidateRecord, LeadScoutError, Locality, Result};
use leadscout_storage::Storage;
use tracing::{debug, warn};

use crate::matcher::RecordMatcher;
use crate::merger::RecordMerger;

/// Counts from one reconciliation pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileSummary {
    pub created: u32,
    pub updated: u32,
    /// Candidates dropped because they could not be reconciled.
    pub skipped: u32,
}

enum Change {
    Created,
    Updated,
}

/// Runs the matcher and merger over a batch of candidates.
///
/// Every candidate is committed on its own. A failing candidate is logged
/// and skipped; the rest of the batch still goes through.
pub(crate) struct Reconciler<'a> {
    pub storage: &'a Storage,
    pub matcher: &'a dyn RecordMatcher,
    pub merger: &'a dyn RecordMerger,
}

impl Reconciler<'_> {
    pub async fn run(
        &self,
        job_locality: &Locality,
        candidates: &[CandidateRecord],
    ) -> ReconcileSummary {
        let mut summary = ReconcileSummary::default();

        for candidate in candidates {
            match self.reconcile_one(job_locality, candidate).await {
                Ok(Change::Created) => summary.created += 1,
                Ok(Change::Updated) => summary.updated += 1,
                Err(e @ LeadScoutError::ReconciliationSkip { .. }) => {
                    warn!(record = %candidate.name, error = %e, "skipping record");
                    summary.skipped += 1;
                }
                Err(e) => {
                    warn!(record = %candidate.name, error = %e, "failed to reconcile record");
                    summary.skipped += 1;
                }
            }
        }
        summary
    }

    async fn reconcile_one(
        &self,
        job_locality: &Locality,
        candidate: &CandidateRecord,
    ) -> Result<Change> {
        let locality = self.resolve_locality(job_locality, candidate).await?;
        let existing = self.storage.list_records_by_locality(&locality.id).await?;

        match self.matcher.find_match(candidate, &locality, &existing) {
            Some(found) => {
                let outcome = self.merger.merge(found, candidate);
                if outcome.changed() {
                    self.storage
                        .apply_record_merge(found, &outcome.record, candidate.notes.as_deref())
                        .await?;
                }
                debug!(
                    record_id = %found.id,
                    fields = ?outcome.fields_changed,
                    "merged into existing record"
                );
                Ok(Change::Updated)
            }
            None => {
                let record = self.merger.create(candidate, &locality);
                self.storage.insert_record(&record).await?;
                debug!(record_id = %record.id, name = %record.name, "created record");
                Ok(Change::Created)
            }
        }
    }

    /// The candidate's own locality reference, or the job's locality when
    /// it names none.
    async fn resolve_locality(
        &self,
        job_locality: &Locality,
        candidate: &CandidateRecord,
    ) -> Result<Locality> {
        let Some(reference) = candidate.locality.as_deref() else {
            return Ok(job_locality.clone());
        };

        if reference == job_locality.id
            || reference.eq_ignore_ascii_case(&job_locality.name)
            || reference.eq_ignore_ascii_case(&job_locality.to_string())
        {
            return Ok(job_locality.clone());
        }

        self.storage.find_locality(reference).await?.ok_or_else(|| {
            LeadScoutError::skip(format!(
                "locality '{reference}' of record '{}' is unknown",
                candidate.name
            ))
        })
    }
}
