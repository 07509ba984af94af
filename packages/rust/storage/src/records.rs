//! Persisted record reads and non-destructive writes.

use chrono::Utc;
use leadscout_shared::{PersistedRecord, Result, Temperature};
use libsql::{Connection, TransactionBehavior, params};

use crate::{Storage, db_err, opt_text, parse_timestamp};

/// Separator used by `GROUP_CONCAT` for tag names (ASCII unit separator).
const TAG_SEPARATOR: char = '\u{1f}';

const RECORD_SELECT: &str = "SELECT r.id, r.locality_id, r.name, r.company, r.record_type,
        r.email, r.phone, r.instagram, r.telegram, r.website, r.notes, r.temperature,
        r.source, r.created_at, r.updated_at,
        (SELECT GROUP_CONCAT(t.name, char(31))
           FROM record_tags rt JOIN tags t ON t.id = rt.tag_id
          WHERE rt.record_id = r.id) AS tags
   FROM records r";

impl Storage {
    /// All records attached to a locality, ordered by id.
    pub async fn list_records_by_locality(&self, locality_id: &str) -> Result<Vec<PersistedRecord>> {
        let mut rows = self
            .conn
            .query(
                &format!("{RECORD_SELECT} WHERE r.locality_id = ?1 ORDER BY r.id"),
                params![locality_id],
            )
            .await
            .map_err(db_err)?;

        let mut results = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            results.push(row_to_record(&row)?);
        }
        Ok(results)
    }

    /// Get a record by id.
    pub async fn get_record(&self, id: &str) -> Result<Option<PersistedRecord>> {
        let mut rows = self
            .conn
            .query(&format!("{RECORD_SELECT} WHERE r.id = ?1"), params![id])
            .await
            .map_err(db_err)?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_record(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(db_err(e)),
        }
    }

    /// Insert a brand-new record with its tags in one transaction.
    pub async fn insert_record(&self, record: &PersistedRecord) -> Result<()> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .await
            .map_err(db_err)?;

        match write_new_record(&tx, record).await {
            Ok(()) => tx.commit().await.map_err(db_err),
            Err(e) => {
                let _ = tx.rollback().await;
                Err(e)
            }
        }
    }

    /// Apply a merged record on top of `original` in one transaction.
    ///
    /// Scalar columns are only written where the stored value is still blank,
    /// so a concurrent writer that filled the same column first keeps its
    /// value. `incoming_notes` is appended to whatever notes are stored at
    /// write time unless they already contain it. Tags are added, never
    /// removed.
    pub async fn apply_record_merge(
        &self,
        original: &PersistedRecord,
        merged: &PersistedRecord,
        incoming_notes: Option<&str>,
    ) -> Result<()> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .await
            .map_err(db_err)?;

        match write_merge(&tx, original, merged, incoming_notes).await {
            Ok(()) => tx.commit().await.map_err(db_err),
            Err(e) => {
                let _ = tx.rollback().await;
                Err(e)
            }
        }
    }
}

async fn write_new_record(conn: &Connection, record: &PersistedRecord) -> Result<()> {
    conn.execute(
        "INSERT INTO records (id, locality_id, name, company, record_type, email, phone,
            instagram, telegram, website, notes, temperature, source, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
        params![
            record.id.as_str(),
            record.locality_id.as_deref(),
            record.name.as_str(),
            record.company.as_deref(),
            record.record_type.as_deref(),
            record.email.as_deref(),
            record.phone.as_deref(),
            record.instagram.as_deref(),
            record.telegram.as_deref(),
            record.website.as_deref(),
            record.notes.as_deref(),
            record.temperature.map(|t| t.as_str()),
            record.source.as_str(),
            record.created_at.to_rfc3339(),
            record.updated_at.to_rfc3339(),
        ],
    )
    .await
    .map_err(db_err)?;

    if let Some(record_type) = record.record_type.as_deref() {
        register_record_type(conn, record_type).await?;
    }
    add_tags(conn, &record.id, &record.tags).await
}

async fn write_merge(
    conn: &Connection,
    original: &PersistedRecord,
    merged: &PersistedRecord,
    incoming_notes: Option<&str>,
) -> Result<()> {
    let incoming_notes = incoming_notes.map(str::trim).filter(|n| !n.is_empty());

    conn.execute(
        "UPDATE records SET
            name        = CASE WHEN TRIM(name) = '' THEN ?2 ELSE name END,
            company     = CASE WHEN company IS NULL OR TRIM(company) = '' THEN ?3 ELSE company END,
            record_type = CASE WHEN record_type IS NULL OR TRIM(record_type) = '' THEN ?4 ELSE record_type END,
            email       = CASE WHEN email IS NULL OR TRIM(email) = '' THEN ?5 ELSE email END,
            phone       = CASE WHEN phone IS NULL OR TRIM(phone) = '' THEN ?6 ELSE phone END,
            instagram   = CASE WHEN instagram IS NULL OR TRIM(instagram) = '' THEN ?7 ELSE instagram END,
            telegram    = CASE WHEN telegram IS NULL OR TRIM(telegram) = '' THEN ?8 ELSE telegram END,
            website     = CASE WHEN website IS NULL OR TRIM(website) = '' THEN ?9 ELSE website END,
            temperature = COALESCE(temperature, ?10),
            notes       = CASE
                              WHEN ?11 IS NULL THEN notes
                              WHEN notes IS NULL OR TRIM(notes) = '' THEN ?11
                              WHEN INSTR(notes, ?11) > 0 THEN notes
                              ELSE RTRIM(notes, char(32, 9, 10, 13)) || char(10, 10) || ?11
                          END,
            updated_at  = ?12
         WHERE id = ?1",
        params![
            original.id.as_str(),
            merged.name.as_str(),
            merged.company.as_deref(),
            merged.record_type.as_deref(),
            merged.email.as_deref(),
            merged.phone.as_deref(),
            merged.instagram.as_deref(),
            merged.telegram.as_deref(),
            merged.website.as_deref(),
            merged.temperature.map(|t| t.as_str()),
            incoming_notes,
            Utc::now().to_rfc3339(),
        ],
    )
    .await
    .map_err(db_err)?;

    if let Some(record_type) = merged.record_type.as_deref() {
        register_record_type(conn, record_type).await?;
    }
    add_tags(conn, &original.id, &merged.tags).await
}

/// Insert-or-ignore each tag and link it to the record.
async fn add_tags(conn: &Connection, record_id: &str, tags: &[String]) -> Result<()> {
    for tag in tags {
        let tag = tag.trim();
        if tag.is_empty() {
            continue;
        }
        conn.execute(
            "INSERT INTO tags (name) VALUES (?1) ON CONFLICT(name) DO NOTHING",
            params![tag],
        )
        .await
        .map_err(db_err)?;
        conn.execute(
            "INSERT OR IGNORE INTO record_tags (record_id, tag_id)
             SELECT ?1, id FROM tags WHERE name = ?2",
            params![record_id, tag],
        )
        .await
        .map_err(db_err)?;
    }
    Ok(())
}

pub(crate) async fn register_record_type(conn: &Connection, name: &str) -> Result<()> {
    let name = name.trim();
    if name.is_empty() {
        return Ok(());
    }
    conn.execute(
        "INSERT INTO record_types (name) VALUES (?1) ON CONFLICT(name) DO NOTHING",
        params![name],
    )
    .await
    .map_err(db_err)?;
    Ok(())
}

/// Convert a database row to a [`PersistedRecord`].
fn row_to_record(row: &libsql::Row) -> Result<PersistedRecord> {
    let created_at: String = row.get(13).map_err(db_err)?;
    let updated_at: String = row.get(14).map_err(db_err)?;

    let mut tags: Vec<String> = opt_text(row, 15)
        .map(|joined| {
            joined
                .split(TAG_SEPARATOR)
                .filter(|t| !t.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();
    tags.sort_by_key(|t| t.to_lowercase());

    Ok(PersistedRecord {
        id: row.get::<String>(0).map_err(db_err)?,
        locality_id: opt_text(row, 1),
        name: row.get::<String>(2).unwrap_or_default(),
        company: opt_text(row, 3),
        record_type: opt_text(row, 4),
        email: opt_text(row, 5),
        phone: opt_text(row, 6),
        instagram: opt_text(row, 7),
        telegram: opt_text(row, 8),
        website: opt_text(row, 9),
        notes: opt_text(row, 10),
        temperature: opt_text(row, 11)
            .map(|t| t.parse::<Temperature>())
            .transpose()?,
        source: row.get::<String>(12).unwrap_or_default(),
        tags,
        created_at: parse_timestamp(&created_at)?,
        updated_at: parse_timestamp(&updated_at)?,
    })
}
