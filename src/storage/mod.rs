//! SQLite persistence
//!
//! ## Stores
//!
//! - `local`  - the field device's store: claims, farms and fields pulled from
//!   the server, sessions and samples captured offline, the pending mutation
//!   log and the sync cursor
//! - `server` - the authoritative store with a monotonic modification clock
//!
//! Entities are kept as JSON bodies next to the columns that queries filter on.

pub mod local;
pub mod schema;
pub mod server;

pub use local::{LocalStats, LocalStore};
pub use server::{ServerClock, ServerStore};

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use rusqlite::Connection;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{Error, Result};
use schema::StoreRole;

/// Open a file-backed connection in WAL mode and bring its schema up to date.
fn open_file(path: &Path, role: StoreRole) -> Result<Connection> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    info!("Opening SQLite database at {:?}", path);

    let conn = Connection::open(path)?;
    conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL; PRAGMA foreign_keys=ON;")?;
    schema::init_schema(&conn, role)?;
    Ok(conn)
}

fn open_memory(role: StoreRole) -> Result<Connection> {
    debug!(?role, "Opening in-memory SQLite database");
    let conn = Connection::open_in_memory()?;
    conn.execute_batch("PRAGMA foreign_keys=ON;")?;
    schema::init_schema(&conn, role)?;
    Ok(conn)
}

fn lock(conn: &Mutex<Connection>) -> Result<MutexGuard<'_, Connection>> {
    conn.lock()
        .map_err(|e| Error::Internal(format!("Lock poisoned: {}", e)))
}

fn to_body<T: Serialize>(value: &T) -> Result<String> {
    Ok(serde_json::to_string(value)?)
}

fn from_body<T: DeserializeOwned>(body: &str) -> Result<T> {
    Ok(serde_json::from_str(body)?)
}

fn parse_id(raw: &str) -> Result<Uuid> {
    Uuid::parse_str(raw).map_err(|e| Error::Internal(format!("Corrupt id '{}': {}", raw, e)))
}
