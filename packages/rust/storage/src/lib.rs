//! Turso Embedded / libSQL storage layer.
//!
//! The [`Storage`] struct wraps a libSQL database holding localities, the
//! record-type taxonomy, persisted records with their tags, and research jobs.
//!
//! **Guarantees the pipeline relies on:**
//! - at most one pending/running job per locality (partial unique index)
//! - status writes are conditional on the expected prior status
//! - record updates only ever fill blank columns

mod jobs;
mod migrations;
mod records;

use std::path::Path;

use leadscout_shared::{LeadScoutError, Locality, Result};
use libsql::{Connection, Database, params};
use uuid::Uuid;

/// Milliseconds a writer waits on a locked database before failing.
const BUSY_TIMEOUT_MS: u32 = 5_000;

/// Primary storage handle wrapping a libSQL database.
pub struct Storage {
    #[allow(dead_code)]
    db: Database,
    conn: Connection,
}

impl Storage {
    /// Open or create a database at `path` and apply pending migrations.
    pub async fn open(path: &Path) -> Result<Self> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| LeadScoutError::io(parent, e))?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(db_err)?;

        let conn = db.connect().map_err(db_err)?;

        let storage = Self { db, conn };
        storage.configure_connection().await?;
        storage.run_migrations().await?;
        Ok(storage)
    }

    /// Enable foreign keys and a busy timeout so concurrent processes queue
    /// on the write lock instead of erroring out.
    async fn configure_connection(&self) -> Result<()> {
        self.conn
            .execute("PRAGMA foreign_keys = ON", params![])
            .await
            .map_err(db_err)?;
        // PRAGMA busy_timeout echoes the new value as a row.
        self.conn
            .query(&format!("PRAGMA busy_timeout = {BUSY_TIMEOUT_MS}"), params![])
            .await
            .map_err(db_err)?;
        Ok(())
    }

    /// Run pending schema migrations.
    async fn run_migrations(&self) -> Result<()> {
        let current_version = self.get_schema_version().await;

        for migration in migrations::all_migrations() {
            if migration.version > current_version {
                tracing::info!(
                    version = migration.version,
                    description = migration.description,
                    "applying migration"
                );
                self.conn
                    .execute_batch(migration.sql)
                    .await
                    .map_err(|e| {
                        LeadScoutError::Storage(format!(
                            "migration v{} failed: {e}",
                            migration.version
                        ))
                    })?;
            }
        }
        Ok(())
    }

    /// Get the current schema version, or 0 if no migrations have been applied.
    async fn get_schema_version(&self) -> u32 {
        let result = self
            .conn
            .query("SELECT MAX(version) FROM schema_migrations", params![])
            .await;

        match result {
            Ok(mut rows) => {
                if let Ok(Some(row)) = rows.next().await {
                    row.get::<u32>(0).unwrap_or(0)
                } else {
                    0
                }
            }
            Err(_) => 0, // Table doesn't exist yet
        }
    }

    // -----------------------------------------------------------------------
    // Locality operations
    // -----------------------------------------------------------------------

    /// Insert a new locality. Fails with a conflict if the same
    /// (name, iso2) pair already exists.
    pub async fn insert_locality(&self, name: &str, country: &str, iso2: &str) -> Result<Locality> {
        let locality = Locality {
            id: Uuid::now_v7().to_string(),
            name: name.trim().to_string(),
            country: country.trim().to_string(),
            iso2: iso2.trim().to_ascii_uppercase(),
        };

        self.conn
            .execute(
                "INSERT INTO localities (id, name, country, iso2) VALUES (?1, ?2, ?3, ?4)",
                params![
                    locality.id.as_str(),
                    locality.name.as_str(),
                    locality.country.as_str(),
                    locality.iso2.as_str(),
                ],
            )
            .await
            .map_err(|e| {
                if is_unique_violation(&e) {
                    LeadScoutError::conflict(format!("locality '{locality}' already exists"))
                } else {
                    db_err(e)
                }
            })?;

        Ok(locality)
    }

    /// Get a locality by id.
    pub async fn get_locality(&self, id: &str) -> Result<Option<Locality>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, name, country, iso2 FROM localities WHERE id = ?1",
                params![id],
            )
            .await
            .map_err(db_err)?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_locality(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(db_err(e)),
        }
    }

    /// Resolve a locality by id, falling back to a case-insensitive name match.
    pub async fn find_locality(&self, reference: &str) -> Result<Option<Locality>> {
        let reference = reference.trim();
        if reference.is_empty() {
            return Ok(None);
        }
        if let Some(found) = self.get_locality(reference).await? {
            return Ok(Some(found));
        }

        let mut rows = self
            .conn
            .query(
                "SELECT id, name, country, iso2 FROM localities
                 WHERE name = ?1 ORDER BY id LIMIT 1",
                params![reference],
            )
            .await
            .map_err(db_err)?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_locality(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(db_err(e)),
        }
    }

    /// List all localities by name.
    pub async fn list_localities(&self) -> Result<Vec<Locality>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, name, country, iso2 FROM localities ORDER BY name, iso2",
                params![],
            )
            .await
            .map_err(db_err)?;

        let mut results = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            results.push(row_to_locality(&row)?);
        }
        Ok(results)
    }

    // -----------------------------------------------------------------------
    // Record type taxonomy
    // -----------------------------------------------------------------------

    /// Register a record type if no type with the same name (ignoring case) exists.
    pub async fn ensure_record_type(&self, name: &str) -> Result<()> {
        records::register_record_type(&self.conn, name).await
    }

    /// All known record type names, alphabetically.
    pub async fn list_record_types(&self) -> Result<Vec<String>> {
        let mut rows = self
            .conn
            .query("SELECT name FROM record_types ORDER BY name", params![])
            .await
            .map_err(db_err)?;

        let mut results = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            results.push(row.get::<String>(0).map_err(db_err)?);
        }
        Ok(results)
    }
}

/// Map a libSQL error into the storage variant.
pub(crate) fn db_err(e: libsql::Error) -> LeadScoutError {
    LeadScoutError::Storage(e.to_string())
}

/// Whether a libSQL error is a UNIQUE constraint violation.
pub(crate) fn is_unique_violation(e: &libsql::Error) -> bool {
    e.to_string().contains("UNIQUE constraint failed")
}

/// Read a nullable text column, treating empty strings as NULL.
pub(crate) fn opt_text(row: &libsql::Row, idx: i32) -> Option<String> {
    row.get::<String>(idx).ok().filter(|s| !s.is_empty())
}

/// Parse an RFC 3339 timestamp column.
pub(crate) fn parse_timestamp(s: &str) -> Result<chrono::DateTime<chrono::Utc>> {
    chrono::DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&chrono::Utc))
        .map_err(|e| LeadScoutError::Storage(format!("invalid date '{s}': {e}")))
}

/// Convert a database row to a [`Locality`].
fn row_to_locality(row: &libsql::Row) -> Result<Locality> {
    Ok(Locality {
        id: row.get::<String>(0).map_err(db_err)?,
        name: row.get::<String>(1).map_err(db_err)?,
        country: row.get::<String>(2).map_err(db_err)?,
        iso2: row.get::<String>(3).unwrap_or_default(),
    })
}
