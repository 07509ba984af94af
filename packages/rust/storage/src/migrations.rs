//! SQL migration definitions for the LeadScout database.
//!
//! Migrations are applied in order on database open. Each migration has a
//! version number and a batch of SQL statements.

/// A database migration with a version and SQL statements.
pub(crate) struct Migration {
    pub version: u32,
    pub description: &'static str,
    pub sql: &'static str,
}

/// All migrations, in ascending version order.
pub(crate) fn all_migrations() -> Vec<Migration> {
    vec![Migration {
        version: 1,
        description: "Initial schema: localities, record_types, tags, records, research_jobs",
        sql: r#"
-- Schema version tracking
CREATE TABLE IF NOT EXISTS schema_migrations (
    version   INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Research targets
CREATE TABLE IF NOT EXISTS localities (
    id      TEXT PRIMARY KEY,
    name    TEXT NOT NULL COLLATE NOCASE,
    country TEXT NOT NULL,
    iso2    TEXT NOT NULL DEFAULT '',
    UNIQUE(name, iso2)
);

CREATE INDEX IF NOT EXISTS idx_localities_name ON localities(name);

-- Record type taxonomy fed into the research prompt
CREATE TABLE IF NOT EXISTS record_types (
    id   INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE COLLATE NOCASE
);

-- Tags, unique by case-insensitive name
CREATE TABLE IF NOT EXISTS tags (
    id   INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE COLLATE NOCASE
);

-- Persisted records
CREATE TABLE IF NOT EXISTS records (
    id          TEXT PRIMARY KEY,
    locality_id TEXT REFERENCES localities(id) ON DELETE SET NULL,
    name        TEXT NOT NULL DEFAULT '',
    company     TEXT,
    record_type TEXT,
    email       TEXT,
    phone       TEXT,
    instagram   TEXT,
    telegram    TEXT,
    website     TEXT,
    notes       TEXT,
    temperature TEXT,
    source      TEXT NOT NULL DEFAULT '',
    created_at  TEXT NOT NULL,
    updated_at  TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_records_locality ON records(locality_id);
CREATE INDEX IF NOT EXISTS idx_records_email ON records(email);

CREATE TABLE IF NOT EXISTS record_tags (
    record_id TEXT NOT NULL REFERENCES records(id) ON DELETE CASCADE,
    tag_id    INTEGER NOT NULL REFERENCES tags(id) ON DELETE CASCADE,
    PRIMARY KEY (record_id, tag_id)
);

-- Research jobs
CREATE TABLE IF NOT EXISTS research_jobs (
    id              TEXT PRIMARY KEY,
    locality_id     TEXT NOT NULL REFERENCES localities(id) ON DELETE CASCADE,
    status          TEXT NOT NULL,
    interaction_id  TEXT,
    raw_result      TEXT,
    result_json     TEXT,
    parse_tier      TEXT,
    error           TEXT,
    records_created INTEGER NOT NULL DEFAULT 0,
    records_updated INTEGER NOT NULL DEFAULT 0,
    created_at      TEXT NOT NULL,
    updated_at      TEXT NOT NULL,
    completed_at    TEXT
);

CREATE INDEX IF NOT EXISTS idx_research_jobs_status ON research_jobs(status);

-- At most one in-flight job per locality
CREATE UNIQUE INDEX IF NOT EXISTS idx_research_jobs_active_locality
    ON research_jobs(locality_id)
    WHERE status IN ('pending', 'running');

INSERT INTO schema_migrations (version) VALUES (1);
"#,
    }]
}
