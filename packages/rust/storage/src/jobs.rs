//! Research job persistence.

use chrono::Utc;
use leadscout_shared::{JobId, JobStatus, LeadScoutError, ParseTier, ResearchJob, Result};
use libsql::params;

use crate::{Storage, db_err, is_unique_violation, opt_text, parse_timestamp};

const JOB_COLUMNS: &str = "id, locality_id, status, interaction_id, raw_result, result_json, \
     parse_tier, error, records_created, records_updated, created_at, updated_at, completed_at";

impl Storage {
    /// Insert a new job.
    ///
    /// The partial unique index on `(locality_id) WHERE status IN
    /// ('pending', 'running')` rejects a second in-flight job for the same
    /// locality; that rejection surfaces as [`LeadScoutError::Conflict`].
    pub async fn insert_job(&self, job: &ResearchJob) -> Result<()> {
        let result_json = encode_result(job)?;
        self.conn
            .execute(
                "INSERT INTO research_jobs (id, locality_id, status, interaction_id, raw_result,
                    result_json, parse_tier, error, records_created, records_updated,
                    created_at, updated_at, completed_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
                params![
                    job.id.to_string(),
                    job.locality_id.as_str(),
                    job.status.as_str(),
                    job.interaction_id.as_deref(),
                    job.raw_result.as_deref(),
                    result_json.as_deref(),
                    job.parse_tier.map(|t| t.as_str()),
                    job.error.as_deref(),
                    i64::from(job.records_created),
                    i64::from(job.records_updated),
                    job.created_at.to_rfc3339(),
                    job.updated_at.to_rfc3339(),
                    job.completed_at.map(|t| t.to_rfc3339()),
                ],
            )
            .await
            .map_err(|e| {
                if is_unique_violation(&e) {
                    LeadScoutError::conflict(format!(
                        "a research job is already pending or running for locality {}",
                        job.locality_id
                    ))
                } else {
                    db_err(e)
                }
            })?;
        Ok(())
    }

    /// Get a job by id.
    pub async fn get_job(&self, id: &JobId) -> Result<Option<ResearchJob>> {
        let mut rows = self
            .conn
            .query(
                &format!("SELECT {JOB_COLUMNS} FROM research_jobs WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(db_err)?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_job(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(db_err(e)),
        }
    }

    /// Jobs in `status`, oldest first. This is the poll loop's discovery query.
    pub async fn list_jobs_by_status(&self, status: JobStatus) -> Result<Vec<ResearchJob>> {
        let mut rows = self
            .conn
            .query(
                &format!(
                    "SELECT {JOB_COLUMNS} FROM research_jobs WHERE status = ?1
                     ORDER BY created_at ASC, id ASC"
                ),
                params![status.as_str()],
            )
            .await
            .map_err(db_err)?;

        collect_jobs(&mut rows).await
    }

    /// All jobs, newest first.
    pub async fn list_jobs(&self) -> Result<Vec<ResearchJob>> {
        let mut rows = self
            .conn
            .query(
                &format!("SELECT {JOB_COLUMNS} FROM research_jobs ORDER BY created_at DESC, id DESC"),
                params![],
            )
            .await
            .map_err(db_err)?;

        collect_jobs(&mut rows).await
    }

    /// Persist every mutable field of `job` in one statement, provided the
    /// stored status still equals `expected`.
    ///
    /// A mismatch means another actor moved the job first; the write is
    /// dropped and a conflict is returned.
    pub async fn update_job(&self, job: &ResearchJob, expected: JobStatus) -> Result<()> {
        let result_json = encode_result(job)?;
        let affected = self
            .conn
            .execute(
                "UPDATE research_jobs SET
                    status = ?1, interaction_id = ?2, raw_result = ?3, result_json = ?4,
                    parse_tier = ?5, error = ?6, records_created = ?7, records_updated = ?8,
                    updated_at = ?9, completed_at = ?10
                 WHERE id = ?11 AND status = ?12",
                params![
                    job.status.as_str(),
                    job.interaction_id.as_deref(),
                    job.raw_result.as_deref(),
                    result_json.as_deref(),
                    job.parse_tier.map(|t| t.as_str()),
                    job.error.as_deref(),
                    i64::from(job.records_created),
                    i64::from(job.records_updated),
                    Utc::now().to_rfc3339(),
                    job.completed_at.map(|t| t.to_rfc3339()),
                    job.id.to_string(),
                    expected.as_str(),
                ],
            )
            .await
            .map_err(|e| {
                if is_unique_violation(&e) {
                    LeadScoutError::conflict(format!(
                        "another job is already in flight for locality {}",
                        job.locality_id
                    ))
                } else {
                    db_err(e)
                }
            })?;

        if affected == 0 {
            return Err(LeadScoutError::conflict(format!(
                "job {} is no longer {expected}",
                job.id
            )));
        }
        Ok(())
    }

    /// Delete a terminal job.
    ///
    /// The status check and the delete are one statement, so a poll cycle
    /// can never lose a job it is working on.
    pub async fn delete_job(&self, id: &JobId) -> Result<()> {
        let affected = self
            .conn
            .execute(
                "DELETE FROM research_jobs
                 WHERE id = ?1 AND status NOT IN ('pending', 'running')",
                params![id.to_string()],
            )
            .await
            .map_err(db_err)?;

        if affected > 0 {
            return Ok(());
        }

        match self.get_job(id).await? {
            Some(job) => Err(LeadScoutError::conflict(format!(
                "job {id} is {} and cannot be deleted while in flight",
                job.status
            ))),
            None => Err(LeadScoutError::not_found(format!("job {id}"))),
        }
    }
}

fn encode_result(job: &ResearchJob) -> Result<Option<String>> {
    job.result
        .as_ref()
        .map(serde_json::to_string)
        .transpose()
        .map_err(|e| LeadScoutError::Storage(format!("failed to encode parse result: {e}")))
}

async fn collect_jobs(rows: &mut libsql::Rows) -> Result<Vec<ResearchJob>> {
    let mut results = Vec::new();
    while let Ok(Some(row)) = rows.next().await {
        results.push(row_to_job(&row)?);
    }
    Ok(results)
}

/// Convert a database row to a [`ResearchJob`].
fn row_to_job(row: &libsql::Row) -> Result<ResearchJob> {
    let id: String = row.get(0).map_err(db_err)?;
    let status: String = row.get(2).map_err(db_err)?;
    let created_at: String = row.get(10).map_err(db_err)?;
    let updated_at: String = row.get(11).map_err(db_err)?;

    Ok(ResearchJob {
        id: id
            .parse()
            .map_err(|e| LeadScoutError::Storage(format!("invalid job id '{id}': {e}")))?,
        locality_id: row.get::<String>(1).map_err(db_err)?,
        status: status.parse::<JobStatus>()?,
        interaction_id: opt_text(row, 3),
        raw_result: row.get::<String>(4).ok(),
        result: opt_text(row, 5)
            .map(|s| serde_json::from_str(&s))
            .transpose()
            .map_err(|e| LeadScoutError::Storage(format!("invalid result_json: {e}")))?,
        parse_tier: opt_text(row, 6)
            .map(|s| s.parse::<ParseTier>())
            .transpose()?,
        error: opt_text(row, 7),
        records_created: count_column(row, 8)?,
        records_updated: count_column(row, 9)?,
        created_at: parse_timestamp(&created_at)?,
        updated_at: parse_timestamp(&updated_at)?,
        completed_at: opt_text(row, 12)
            .map(|s| parse_timestamp(&s))
            .transpose()?,
    })
}

/// Read a non-negative counter column that fits in `u32`.
fn count_column(row: &libsql::Row, idx: i32) -> Result<u32> {
    let raw: i64 = row.get(idx).map_err(db_err)?;
    u32::try_from(raw)
        .map_err(|_| LeadScoutError::Storage(format!("count column {idx} out of range: {raw}")))
}
