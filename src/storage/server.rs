//! Authoritative server store
//!
//! Every write stamps `modified_at` from a `ServerClock`. The clock never
//! repeats or goes backwards, so "modified strictly after the cursor" is exact
//! even when two writes land in the same wall-clock microsecond.

use std::path::Path;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;

use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::de::DeserializeOwned;
use tracing::debug;
use uuid::Uuid;

use super::schema::StoreRole;
use super::{from_body, lock, open_file, open_memory, to_body};
use crate::error::{Error, Result};
use crate::model::{AssessmentSession, Claim, ClaimStatus, Farm, Field, SamplePoint};

/// Claim statuses an assessor still works on; only these are pulled.
const PULLED_CLAIM_STATUSES: [ClaimStatus; 3] =
    [ClaimStatus::Assigned, ClaimStatus::InProgress, ClaimStatus::Completed];

/// Strictly increasing microsecond clock.
#[derive(Debug, Default)]
pub struct ServerClock {
    last: AtomicI64,
}

impl ServerClock {
    pub fn starting_after(micros: i64) -> Self {
        Self {
            last: AtomicI64::new(micros),
        }
    }

    /// Next timestamp: wall-clock time, or one past the previous tick.
    pub fn tick(&self) -> i64 {
        let now = Utc::now().timestamp_micros();
        let mut next = now;
        let _ = self.last.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
            next = now.max(last + 1);
            Some(next)
        });
        next
    }
}

pub fn micros_to_datetime(micros: i64) -> Result<DateTime<Utc>> {
    let secs = micros.div_euclid(1_000_000);
    let nanos = (micros.rem_euclid(1_000_000) * 1_000) as u32;
    Utc.timestamp_opt(secs, nanos)
        .single()
        .ok_or_else(|| Error::Internal(format!("Timestamp out of range: {}", micros)))
}

pub struct ServerStore {
    conn: Mutex<Connection>,
    clock: ServerClock,
}

impl ServerStore {
    /// Open or create `server.db` under `data_dir`
    pub fn open(data_dir: &Path) -> Result<Self> {
        let conn = open_file(&data_dir.join("server.db"), StoreRole::Server)?;
        Self::with_connection(conn)
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self> {
        Self::with_connection(open_memory(StoreRole::Server)?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        let high_water: i64 = conn.query_row(
            "SELECT MAX(m) FROM (
                SELECT COALESCE(MAX(modified_at), 0) AS m FROM claims
                UNION ALL SELECT COALESCE(MAX(modified_at), 0) FROM farms
                UNION ALL SELECT COALESCE(MAX(modified_at), 0) FROM fields
                UNION ALL SELECT COALESCE(MAX(modified_at), 0) FROM sessions
                UNION ALL SELECT COALESCE(MAX(modified_at), 0) FROM samples
            )",
            [],
            |row| row.get(0),
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
            clock: ServerClock::starting_after(high_water),
        })
    }

    /// Run `f` in one transaction. Nothing is written if it fails.
    pub fn with_tx<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&ServerTx<'_>) -> Result<T>,
    {
        let mut conn = lock(&self.conn)?;
        let tx = conn.transaction()?;
        let value = f(&ServerTx {
            conn: &*tx,
            clock: &self.clock,
        })?;
        tx.commit()?;
        Ok(value)
    }

    pub fn upsert_claim(&self, claim: &Claim) -> Result<Claim> {
        self.with_tx(|tx| tx.put_claim(claim))
    }

    pub fn upsert_farm(&self, farm: &Farm) -> Result<Farm> {
        self.with_tx(|tx| tx.put_farm(farm))
    }

    pub fn upsert_field(&self, field: &Field) -> Result<Field> {
        self.with_tx(|tx| tx.put_field(field))
    }

    pub fn claim(&self, id: Uuid) -> Result<Option<Claim>> {
        self.with_tx(|tx| tx.claim(id))
    }

    pub fn session(&self, id: Uuid) -> Result<Option<AssessmentSession>> {
        self.with_tx(|tx| tx.session(id))
    }

    pub fn samples_for_session(&self, session_id: Uuid) -> Result<Vec<SamplePoint>> {
        self.with_tx(|tx| tx.samples_for_session(session_id))
    }
}

/// Transaction-scoped view of the server store.
pub struct ServerTx<'a> {
    conn: &'a Connection,
    clock: &'a ServerClock,
}

impl ServerTx<'_> {
    /// Reserve a point on the clock. Later writes are stamped strictly after it.
    pub fn reserve_timestamp(&self) -> Result<DateTime<Utc>> {
        micros_to_datetime(self.clock.tick())
    }

    pub fn claim(&self, id: Uuid) -> Result<Option<Claim>> {
        self.body("SELECT body FROM claims WHERE id = ?1", id)
    }

    pub fn put_claim(&self, claim: &Claim) -> Result<Claim> {
        let modified = self.clock.tick();
        let mut claim = claim.clone();
        claim.updated_at = micros_to_datetime(modified)?;
        self.conn.execute(
            "INSERT INTO claims (id, tenant_id, assigned_assessor_id, farm_id, field_id, status, body, modified_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(id) DO UPDATE SET
                tenant_id = excluded.tenant_id,
                assigned_assessor_id = excluded.assigned_assessor_id,
                farm_id = excluded.farm_id,
                field_id = excluded.field_id,
                status = excluded.status,
                body = excluded.body,
                modified_at = excluded.modified_at",
            params![
                claim.id.to_string(),
                claim.tenant_id.to_string(),
                claim.assigned_assessor_id.map(|a| a.to_string()),
                claim.farm_id.to_string(),
                claim.field_id.to_string(),
                claim.status.as_str(),
                to_body(&claim)?,
                modified
            ],
        )?;
        Ok(claim)
    }

    /// Move a claim's status forward. Returns whether anything changed.
    pub fn advance_claim(&self, id: Uuid, next: ClaimStatus) -> Result<bool> {
        let Some(mut claim) = self.claim(id)? else {
            return Err(Error::ClaimNotFound(id));
        };
        if !claim.advance_status(next) {
            return Ok(false);
        }
        self.put_claim(&claim)?;
        debug!(claim_id = %id, status = %next, "Claim status advanced");
        Ok(true)
    }

    pub fn put_farm(&self, farm: &Farm) -> Result<Farm> {
        let modified = self.clock.tick();
        let mut farm = farm.clone();
        farm.updated_at = micros_to_datetime(modified)?;
        self.conn.execute(
            "INSERT INTO farms (id, body, modified_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(id) DO UPDATE SET body = excluded.body, modified_at = excluded.modified_at",
            params![farm.id.to_string(), to_body(&farm)?, modified],
        )?;
        Ok(farm)
    }

    pub fn put_field(&self, field: &Field) -> Result<Field> {
        let modified = self.clock.tick();
        let mut field = field.clone();
        field.updated_at = micros_to_datetime(modified)?;
        self.conn.execute(
            "INSERT INTO fields (id, farm_id, body, modified_at) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(id) DO UPDATE SET
                farm_id = excluded.farm_id, body = excluded.body, modified_at = excluded.modified_at",
            params![field.id.to_string(), field.farm_id.to_string(), to_body(&field)?, modified],
        )?;
        Ok(field)
    }

    /// Claims assigned to `assessor_id` in `tenant_id`, modified after `since`.
    pub fn assigned_claims(
        &self,
        tenant_id: Uuid,
        assessor_id: Uuid,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<Claim>> {
        let sql = format!(
            "SELECT body FROM claims
             WHERE tenant_id = ?1 AND assigned_assessor_id = ?2
               AND status IN ({})
               AND modified_at > ?3
             ORDER BY modified_at",
            status_list()
        );
        self.bodies(&sql, params![tenant_id.to_string(), assessor_id.to_string(), since_micros(since)])
    }

    /// Farms of the assessor's claims where the farm or a referencing claim
    /// changed after `since`.
    pub fn related_farms(
        &self,
        tenant_id: Uuid,
        assessor_id: Uuid,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<Farm>> {
        let sql = format!(
            "SELECT r.body FROM farms r
             WHERE EXISTS (SELECT 1 FROM claims c
                           WHERE c.farm_id = r.id
                             AND c.tenant_id = ?1 AND c.assigned_assessor_id = ?2 AND c.status IN ({})
                             AND (c.modified_at > ?3 OR r.modified_at > ?3))
             ORDER BY r.modified_at",
            status_list()
        );
        self.bodies(&sql, params![tenant_id.to_string(), assessor_id.to_string(), since_micros(since)])
    }

    /// Fields of the assessor's claims where the field or a referencing claim
    /// changed after `since`.
    pub fn related_fields(
        &self,
        tenant_id: Uuid,
        assessor_id: Uuid,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<Field>> {
        let sql = format!(
            "SELECT r.body FROM fields r
             WHERE EXISTS (SELECT 1 FROM claims c
                           WHERE c.field_id = r.id
                             AND c.tenant_id = ?1 AND c.assigned_assessor_id = ?2 AND c.status IN ({})
                             AND (c.modified_at > ?3 OR r.modified_at > ?3))
             ORDER BY r.modified_at",
            status_list()
        );
        self.bodies(&sql, params![tenant_id.to_string(), assessor_id.to_string(), since_micros(since)])
    }

    pub fn session(&self, id: Uuid) -> Result<Option<AssessmentSession>> {
        self.body("SELECT body FROM sessions WHERE id = ?1", id)
    }

    pub fn put_session(&self, session: &AssessmentSession) -> Result<()> {
        self.conn.execute(
            "INSERT INTO sessions (id, claim_id, assessor_id, status, status_rank, body, modified_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(id) DO UPDATE SET
                claim_id = excluded.claim_id,
                assessor_id = excluded.assessor_id,
                status = excluded.status,
                status_rank = excluded.status_rank,
                body = excluded.body,
                modified_at = excluded.modified_at",
            params![
                session.id.to_string(),
                session.claim_id.to_string(),
                session.assessor_id.to_string(),
                session.status.as_str(),
                session.status.completion_rank(),
                to_body(session)?,
                self.clock.tick()
            ],
        )?;
        Ok(())
    }

    pub fn sample(&self, id: Uuid) -> Result<Option<SamplePoint>> {
        self.body("SELECT body FROM samples WHERE id = ?1", id)
    }

    pub fn sample_id_by_number(&self, session_id: Uuid, sample_number: u32) -> Result<Option<String>> {
        Ok(self
            .conn
            .query_row(
                "SELECT id FROM samples WHERE session_id = ?1 AND sample_number = ?2",
                params![session_id.to_string(), sample_number],
                |row| row.get(0),
            )
            .optional()?)
    }

    pub fn insert_sample(&self, sample: &SamplePoint) -> Result<()> {
        self.conn.execute(
            "INSERT INTO samples (id, session_id, sample_number, body, modified_at) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                sample.id.to_string(),
                sample.session_id.to_string(),
                sample.sample_number,
                to_body(sample)?,
                self.clock.tick()
            ],
        )?;
        Ok(())
    }

    pub fn samples_for_session(&self, session_id: Uuid) -> Result<Vec<SamplePoint>> {
        self.bodies(
            "SELECT body FROM samples WHERE session_id = ?1 ORDER BY sample_number",
            params![session_id.to_string()],
        )
    }

    fn body<T: DeserializeOwned>(&self, sql: &str, id: Uuid) -> Result<Option<T>> {
        let body: Option<String> = self
            .conn
            .query_row(sql, [id.to_string()], |row| row.get(0))
            .optional()?;
        body.map(|b| from_body(&b)).transpose()
    }

    fn bodies<T: DeserializeOwned>(&self, sql: &str, params: impl rusqlite::Params) -> Result<Vec<T>> {
        let mut stmt = self.conn.prepare(sql)?;
        let bodies = stmt
            .query_map(params, |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        bodies.iter().map(|b| from_body(b)).collect()
    }
}

fn status_list() -> String {
    PULLED_CLAIM_STATUSES
        .iter()
        .map(|s| format!("'{}'", s.as_str()))
        .collect::<Vec<_>>()
        .join(", ")
}

fn since_micros(since: Option<DateTime<Utc>>) -> i64 {
    since.map_or(i64::MIN, |t| t.timestamp_micros())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::PerilType;
    use tempfile::TempDir;

    fn claim(tenant: Uuid, assessor: Uuid) -> Claim {
        Claim {
            id: Uuid::new_v4(),
            claim_number: "CLM-9".into(),
            tenant_id: tenant,
            farm_id: Uuid::new_v4(),
            field_id: Uuid::new_v4(),
            peril_type: PerilType::Drought,
            date_of_loss: Utc::now(),
            assigned_assessor_id: Some(assessor),
            status: ClaimStatus::Assigned,
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_clock_is_strictly_increasing() {
        let clock = ServerClock::starting_after(i64::MAX / 2);
        let a = clock.tick();
        let b = clock.tick();
        assert_eq!(b, a + 1);
    }

    #[test]
    fn test_micros_round_trip() {
        let micros = 1_714_550_400_123_456;
        assert_eq!(micros_to_datetime(micros).unwrap().timestamp_micros(), micros);
    }

    #[test]
    fn test_clock_resumes_after_reopen() {
        let tmp = TempDir::new().unwrap();
        let c = claim(Uuid::new_v4(), Uuid::new_v4());
        let first = ServerStore::open(tmp.path()).unwrap().upsert_claim(&c).unwrap();

        let store = ServerStore::open(tmp.path()).unwrap();
        let stamp = store.with_tx(|tx| tx.reserve_timestamp()).unwrap();
        assert!(stamp > first.updated_at);
    }

    #[test]
    fn test_assigned_claims_scope() {
        let store = ServerStore::open_in_memory().unwrap();
        let tenant = Uuid::new_v4();
        let assessor = Uuid::new_v4();

        let mine = store.upsert_claim(&claim(tenant, assessor)).unwrap();
        store.upsert_claim(&claim(tenant, Uuid::new_v4())).unwrap();
        store.upsert_claim(&claim(Uuid::new_v4(), assessor)).unwrap();
        let mut closed = claim(tenant, assessor);
        closed.status = ClaimStatus::Approved;
        store.upsert_claim(&closed).unwrap();

        let claims = store
            .with_tx(|tx| tx.assigned_claims(tenant, assessor, None))
            .unwrap();
        assert_eq!(claims, vec![mine.clone()]);

        let later = store
            .with_tx(|tx| tx.assigned_claims(tenant, assessor, Some(mine.updated_at)))
            .unwrap();
        assert!(later.is_empty());
    }

    #[test]
    fn test_related_rows_follow_changed_claims() {
        let store = ServerStore::open_in_memory().unwrap();
        let tenant = Uuid::new_v4();
        let assessor = Uuid::new_v4();
        let farm = store
            .upsert_farm(&Farm {
                id: Uuid::new_v4(),
                farm_code: "FRM-3".into(),
                farm_name: "Old farm".into(),
                farmer_name: None,
                farm_location: None,
                updated_at: Utc::now(),
            })
            .unwrap();
        let cursor = store.with_tx(|tx| tx.reserve_timestamp()).unwrap();

        let mut c = claim(tenant, assessor);
        c.farm_id = farm.id;
        store.upsert_claim(&c).unwrap();

        let farms = store
            .with_tx(|tx| tx.related_farms(tenant, assessor, Some(cursor)))
            .unwrap();
        assert_eq!(farms, vec![farm]);

        let after = store.with_tx(|tx| tx.reserve_timestamp()).unwrap();
        let farms = store
            .with_tx(|tx| tx.related_farms(tenant, assessor, Some(after)))
            .unwrap();
        assert!(farms.is_empty());
    }

    #[test]
    fn test_advance_claim_is_forward_only() {
        let store = ServerStore::open_in_memory().unwrap();
        let mut c = claim(Uuid::new_v4(), Uuid::new_v4());
        c.status = ClaimStatus::Completed;
        let c = store.upsert_claim(&c).unwrap();

        assert!(!store.with_tx(|tx| tx.advance_claim(c.id, ClaimStatus::InProgress)).unwrap());
        assert_eq!(store.claim(c.id).unwrap().unwrap().updated_at, c.updated_at);
        assert!(matches!(
            store.with_tx(|tx| tx.advance_claim(Uuid::new_v4(), ClaimStatus::InProgress)),
            Err(Error::ClaimNotFound(_))
        ));
    }
}
