//! Database schema definitions

use rusqlite::Connection;
use tracing::info;

use crate::error::Result;

/// Current schema version for migrations
pub const SCHEMA_VERSION: i32 = 1;

/// Which side of the sync protocol a database belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreRole {
    Local,
    Server,
}

/// Initialize the database schema
pub fn init_schema(conn: &Connection, role: StoreRole) -> Result<()> {
    let current_version = get_schema_version(conn)?;

    if current_version == 0 {
        info!(?role, "Creating new database schema v{}", SCHEMA_VERSION);
        let ddl = match role {
            StoreRole::Local => LOCAL_SCHEMA,
            StoreRole::Server => SERVER_SCHEMA,
        };
        conn.execute_batch(ddl)?;
        set_schema_version(conn, SCHEMA_VERSION)?;
    } else if current_version < SCHEMA_VERSION {
        info!("Migrating schema from v{} to v{}", current_version, SCHEMA_VERSION);
        set_schema_version(conn, SCHEMA_VERSION)?;
    } else {
        info!(?role, "Database schema is up to date (v{})", current_version);
    }

    Ok(())
}

/// Get current schema version (0 if not initialized)
fn get_schema_version(conn: &Connection) -> Result<i32> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL)",
        [],
    )?;

    let version: Option<i32> = conn
        .query_row("SELECT version FROM schema_version LIMIT 1", [], |row| row.get(0))
        .map(Some)
        .or_else(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => Ok(None),
            other => Err(other),
        })?;

    Ok(version.unwrap_or(0))
}

fn set_schema_version(conn: &Connection, version: i32) -> Result<()> {
    conn.execute("DELETE FROM schema_version", [])?;
    conn.execute("INSERT INTO schema_version (version) VALUES (?)", [version])?;
    Ok(())
}

/// Field device schema
const LOCAL_SCHEMA: &str = r#"
-- Reference data pulled from the server
CREATE TABLE IF NOT EXISTS claims (
    id TEXT PRIMARY KEY NOT NULL,
    status TEXT NOT NULL,
    body TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS farms (
    id TEXT PRIMARY KEY NOT NULL,
    body TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS fields (
    id TEXT PRIMARY KEY NOT NULL,
    farm_id TEXT NOT NULL,
    body TEXT NOT NULL
);

-- Work captured on the device
CREATE TABLE IF NOT EXISTS sessions (
    id TEXT PRIMARY KEY NOT NULL,
    claim_id TEXT NOT NULL,
    status TEXT NOT NULL,
    body TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS samples (
    id TEXT PRIMARY KEY NOT NULL,
    session_id TEXT NOT NULL,
    sample_number INTEGER NOT NULL,
    body TEXT NOT NULL,
    UNIQUE (session_id, sample_number),
    FOREIGN KEY (session_id) REFERENCES sessions(id) ON DELETE CASCADE
);

-- Append-only log of writes awaiting server acknowledgment
CREATE TABLE IF NOT EXISTS pending_mutations (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    kind TEXT NOT NULL,
    entity_id TEXT NOT NULL,
    payload TEXT NOT NULL,
    enqueued_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS sync_state (
    key TEXT PRIMARY KEY NOT NULL,
    value TEXT
);

CREATE INDEX IF NOT EXISTS idx_sessions_claim ON sessions(claim_id);
CREATE INDEX IF NOT EXISTS idx_pending_entity ON pending_mutations(kind, entity_id);
"#;

/// Authoritative server schema. `modified_at` is microseconds on the server clock.
const SERVER_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS claims (
    id TEXT PRIMARY KEY NOT NULL,
    tenant_id TEXT NOT NULL,
    assigned_assessor_id TEXT,
    farm_id TEXT NOT NULL,
    field_id TEXT NOT NULL,
    status TEXT NOT NULL,
    body TEXT NOT NULL,
    modified_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS farms (
    id TEXT PRIMARY KEY NOT NULL,
    body TEXT NOT NULL,
    modified_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS fields (
    id TEXT PRIMARY KEY NOT NULL,
    farm_id TEXT NOT NULL,
    body TEXT NOT NULL,
    modified_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS sessions (
    id TEXT PRIMARY KEY NOT NULL,
    claim_id TEXT NOT NULL,
    assessor_id TEXT NOT NULL,
    status TEXT NOT NULL,
    status_rank INTEGER NOT NULL,
    body TEXT NOT NULL,
    modified_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS samples (
    id TEXT PRIMARY KEY NOT NULL,
    session_id TEXT NOT NULL,
    sample_number INTEGER NOT NULL,
    body TEXT NOT NULL,
    modified_at INTEGER NOT NULL,
    UNIQUE (session_id, sample_number)
);

CREATE INDEX IF NOT EXISTS idx_claims_assessor ON claims(tenant_id, assigned_assessor_id);
CREATE INDEX IF NOT EXISTS idx_claims_modified ON claims(modified_at);
CREATE INDEX IF NOT EXISTS idx_samples_session ON samples(session_id);
"#;
