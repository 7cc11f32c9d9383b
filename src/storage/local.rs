//! Field device store
//!
//! Local writes are synchronous and block only on this store. Each recorded
//! session or sample write appends its snapshot to `pending_mutations` in the
//! same transaction, so the log and the data never disagree.

use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use tracing::debug;
use uuid::Uuid;

use super::schema::StoreRole;
use super::{from_body, lock, open_file, open_memory, parse_id, to_body};
use crate::error::{Error, Result};
use crate::model::{AssessmentSession, Claim, Farm, Field, SamplePoint, SessionStatus};
use crate::session::SessionHandle;
use crate::sync::outbox::{MutationKind, PendingMutation};
use crate::sync::protocol::{SamplePayload, SessionPayload, SyncDownResponse};

const CURSOR_KEY: &str = "last_sync";

pub struct LocalStore {
    conn: Mutex<Connection>,
}

impl LocalStore {
    /// Open or create `field.db` under `data_dir`
    pub fn open(data_dir: &Path) -> Result<Self> {
        let conn = open_file(&data_dir.join("field.db"), StoreRole::Local)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self> {
        Ok(Self {
            conn: Mutex::new(open_memory(StoreRole::Local)?),
        })
    }

    pub fn with_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        let conn = lock(&self.conn)?;
        f(&conn)
    }

    fn with_tx<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        let mut conn = lock(&self.conn)?;
        let tx = conn.transaction()?;
        let value = f(&*tx)?;
        tx.commit()?;
        Ok(value)
    }

    // ---- reference data ----

    pub fn upsert_claim(&self, claim: &Claim) -> Result<()> {
        self.with_conn(|conn| put_claim(conn, claim))
    }

    pub fn claim(&self, id: Uuid) -> Result<Option<Claim>> {
        self.with_conn(|conn| get_claim(conn, id))
    }

    pub fn claims(&self) -> Result<Vec<Claim>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT body FROM claims ORDER BY id")?;
            let bodies = stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            bodies.iter().map(|b| from_body(b)).collect()
        })
    }

    pub fn farm(&self, id: Uuid) -> Result<Option<Farm>> {
        self.with_conn(|conn| get_body(conn, "SELECT body FROM farms WHERE id = ?1", id))
    }

    pub fn field(&self, id: Uuid) -> Result<Option<Field>> {
        self.with_conn(|conn| get_body(conn, "SELECT body FROM fields WHERE id = ?1", id))
    }

    /// Store the result of a successful pull and advance the cursor.
    ///
    /// A pulled claim never moves a locally-advanced claim status backwards.
    pub fn apply_pull(&self, response: &SyncDownResponse) -> Result<()> {
        self.with_tx(|conn| {
            for incoming in &response.claims {
                let mut claim = incoming.clone();
                if let Some(local) = get_claim(conn, claim.id)? {
                    if local.status > claim.status {
                        debug!(claim_id = %claim.id, local = %local.status, pulled = %claim.status, "Keeping local claim status");
                        claim.status = local.status;
                    }
                }
                put_claim(conn, &claim)?;
            }
            for farm in &response.farms {
                conn.execute(
                    "INSERT INTO farms (id, body) VALUES (?1, ?2)
                     ON CONFLICT(id) DO UPDATE SET body = excluded.body",
                    params![farm.id.to_string(), to_body(farm)?],
                )?;
            }
            for field in &response.fields {
                conn.execute(
                    "INSERT INTO fields (id, farm_id, body) VALUES (?1, ?2, ?3)
                     ON CONFLICT(id) DO UPDATE SET farm_id = excluded.farm_id, body = excluded.body",
                    params![field.id.to_string(), field.farm_id.to_string(), to_body(field)?],
                )?;
            }
            conn.execute(
                "INSERT INTO sync_state (key, value) VALUES (?1, ?2)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                params![CURSOR_KEY, response.timestamp.to_rfc3339()],
            )?;
            Ok(())
        })
    }

    /// Timestamp of the last successful pull; `None` requests a full sync.
    pub fn cursor(&self) -> Result<Option<DateTime<Utc>>> {
        self.with_conn(|conn| {
            let raw: Option<Option<String>> = conn
                .query_row(
                    "SELECT value FROM sync_state WHERE key = ?1",
                    [CURSOR_KEY],
                    |row| row.get(0),
                )
                .optional()?;
            match raw.flatten() {
                Some(s) => DateTime::parse_from_rfc3339(&s)
                    .map(|t| Some(t.with_timezone(&Utc)))
                    .map_err(|e| Error::Internal(format!("Corrupt sync cursor '{}': {}", s, e))),
                None => Ok(None),
            }
        })
    }

    // ---- sessions and samples ----

    pub fn load_session(&self, id: Uuid) -> Result<Option<SessionHandle>> {
        self.with_conn(|conn| {
            let session: Option<AssessmentSession> =
                get_body(conn, "SELECT body FROM sessions WHERE id = ?1", id)?;
            let Some(session) = session else {
                return Ok(None);
            };
            let mut stmt =
                conn.prepare("SELECT body FROM samples WHERE session_id = ?1 ORDER BY sample_number")?;
            let bodies = stmt
                .query_map([id.to_string()], |row| row.get::<_, String>(0))?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            let samples = bodies
                .iter()
                .map(|b| from_body(b))
                .collect::<Result<Vec<SamplePoint>>>()?;
            Ok(Some(SessionHandle::from_parts(session, samples)))
        })
    }

    pub fn sessions_for_claim(&self, claim_id: Uuid) -> Result<Vec<AssessmentSession>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT body FROM sessions WHERE claim_id = ?1")?;
            let bodies = stmt
                .query_map([claim_id.to_string()], |row| row.get::<_, String>(0))?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            let mut sessions = bodies
                .iter()
                .map(|b| from_body(b))
                .collect::<Result<Vec<AssessmentSession>>>()?;
            sessions.sort_by_key(|s| s.created_at);
            Ok(sessions)
        })
    }

    /// Persist a session (and the claim it touched) and queue its snapshot.
    pub fn record_session(&self, session: &AssessmentSession, claim: Option<&Claim>) -> Result<i64> {
        self.with_tx(|conn| {
            put_session(conn, session)?;
            if let Some(claim) = claim {
                put_claim(conn, claim)?;
            }
            enqueue(conn, MutationKind::SessionUpsert, session.id, &SessionPayload::from(session))
        })
    }

    /// Persist a new sample with its parent session and queue both snapshots.
    pub fn record_sample(&self, session: &AssessmentSession, sample: &SamplePoint) -> Result<i64> {
        self.with_tx(|conn| {
            put_session(conn, session)?;
            conn.execute(
                "INSERT INTO samples (id, session_id, sample_number, body) VALUES (?1, ?2, ?3, ?4)",
                params![
                    sample.id.to_string(),
                    sample.session_id.to_string(),
                    sample.sample_number,
                    to_body(sample)?
                ],
            )?;
            enqueue(conn, MutationKind::SessionUpsert, session.id, &SessionPayload::from(session))?;
            enqueue(conn, MutationKind::SampleUpsert, sample.id, &SamplePayload::from(sample))
        })
    }

    /// Move an acknowledged completed session to `synced`. No mutation is queued.
    pub fn mark_session_synced(&self, id: Uuid) -> Result<bool> {
        self.with_tx(|conn| {
            let session: Option<AssessmentSession> =
                get_body(conn, "SELECT body FROM sessions WHERE id = ?1", id)?;
            match session {
                Some(session) if session.status == SessionStatus::Completed => {
                    let mut handle = SessionHandle::from_parts(session, Vec::new());
                    handle.mark_synced()?;
                    put_session(conn, handle.session())?;
                    Ok(true)
                }
                _ => Ok(false),
            }
        })
    }

    // ---- pending mutation log ----

    /// Every queued mutation, oldest first
    pub fn pending(&self) -> Result<Vec<PendingMutation>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT seq, kind, entity_id, payload, enqueued_at FROM pending_mutations ORDER BY seq",
            )?;
            let rows = stmt
                .query_map([], |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                    ))
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            rows.into_iter()
                .map(|(seq, kind, entity_id, payload, enqueued_at)| {
                    Ok(PendingMutation {
                        seq,
                        kind: kind.parse()?,
                        entity_id: parse_id(&entity_id)?,
                        payload: serde_json::from_str(&payload)?,
                        enqueued_at: DateTime::parse_from_rfc3339(&enqueued_at)
                            .map(|t| t.with_timezone(&Utc))
                            .map_err(|e| Error::Internal(format!("Corrupt enqueue time: {}", e)))?,
                    })
                })
                .collect()
        })
    }

    pub fn pending_count(&self) -> Result<usize> {
        self.with_conn(|conn| {
            let n: i64 = conn.query_row("SELECT COUNT(*) FROM pending_mutations", [], |row| row.get(0))?;
            Ok(n as usize)
        })
    }

    /// Drop queued entries for one entity up to and including `up_to_seq`.
    pub fn acknowledge(&self, kind: MutationKind, entity_id: Uuid, up_to_seq: i64) -> Result<usize> {
        self.with_conn(|conn| {
            let removed = conn.execute(
                "DELETE FROM pending_mutations WHERE kind = ?1 AND entity_id = ?2 AND seq <= ?3",
                params![kind.as_str(), entity_id.to_string(), up_to_seq],
            )?;
            Ok(removed)
        })
    }

    pub fn stats(&self) -> Result<LocalStats> {
        self.with_conn(|conn| {
            let count = |sql: &str| -> Result<u64> {
                let n: i64 = conn.query_row(sql, [], |row| row.get(0))?;
                Ok(n as u64)
            };
            Ok(LocalStats {
                claims: count("SELECT COUNT(*) FROM claims")?,
                sessions: count("SELECT COUNT(*) FROM sessions")?,
                samples: count("SELECT COUNT(*) FROM samples")?,
                pending_mutations: count("SELECT COUNT(*) FROM pending_mutations")?,
            })
        })
    }
}

/// Local store statistics
#[derive(Debug, Clone, Serialize)]
pub struct LocalStats {
    pub claims: u64,
    pub sessions: u64,
    pub samples: u64,
    pub pending_mutations: u64,
}

fn get_body<T: serde::de::DeserializeOwned>(conn: &Connection, sql: &str, id: Uuid) -> Result<Option<T>> {
    let body: Option<String> = conn
        .query_row(sql, [id.to_string()], |row| row.get(0))
        .optional()?;
    body.map(|b| from_body(&b)).transpose()
}

fn get_claim(conn: &Connection, id: Uuid) -> Result<Option<Claim>> {
    get_body(conn, "SELECT body FROM claims WHERE id = ?1", id)
}

fn put_claim(conn: &Connection, claim: &Claim) -> Result<()> {
    conn.execute(
        "INSERT INTO claims (id, status, body) VALUES (?1, ?2, ?3)
         ON CONFLICT(id) DO UPDATE SET status = excluded.status, body = excluded.body",
        params![claim.id.to_string(), claim.status.as_str(), to_body(claim)?],
    )?;
    Ok(())
}

fn put_session(conn: &Connection, session: &AssessmentSession) -> Result<()> {
    conn.execute(
        "INSERT INTO sessions (id, claim_id, status, body) VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(id) DO UPDATE SET status = excluded.status, body = excluded.body",
        params![
            session.id.to_string(),
            session.claim_id.to_string(),
            session.status.as_str(),
            to_body(session)?
        ],
    )?;
    Ok(())
}

fn enqueue<T: Serialize>(conn: &Connection, kind: MutationKind, entity_id: Uuid, payload: &T) -> Result<i64> {
    conn.execute(
        "INSERT INTO pending_mutations (kind, entity_id, payload, enqueued_at) VALUES (?1, ?2, ?3, ?4)",
        params![
            kind.as_str(),
            entity_id.to_string(),
            to_body(payload)?,
            Utc::now().to_rfc3339()
        ],
    )?;
    let seq = conn.last_insert_rowid();
    debug!(seq, %kind, %entity_id, "Queued mutation");
    Ok(seq)
}
