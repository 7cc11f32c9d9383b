//! Sync Server
//!
//! Stateless pull and push handlers over the authoritative store. Every
//! pushed item is applied in its own transaction, so one bad item never
//! takes the rest of the batch down with it.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::protocol::{
    PushFailure, PushFailureReason, SamplePayload, SessionPayload, SyncDownResponse, SyncUpRequest,
    SyncUpResponse, SyncedIds,
};
use crate::assess::MethodMeasurement;
use crate::error::{Error, Result};
use crate::model::{AssessmentSession, ClaimStatus, SessionStatus};
use crate::storage::server::ServerTx;
use crate::storage::ServerStore;

/// Who is calling. Established by the auth layer in front of the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssessorIdentity {
    pub assessor_id: Uuid,
    pub tenant_id: Uuid,
}

#[derive(Clone)]
pub struct SyncServer {
    store: Arc<ServerStore>,
}

impl SyncServer {
    pub fn new(store: Arc<ServerStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<ServerStore> {
        &self.store
    }

    /// Claims assigned to `identity` (plus their farms and fields) modified
    /// strictly after `since`; everything when `since` is `None`.
    pub fn pull(&self, identity: &AssessorIdentity, since: Option<DateTime<Utc>>) -> Result<SyncDownResponse> {
        let response = self.store.with_tx(|tx| {
            let timestamp = tx.reserve_timestamp()?;
            let claims = tx.assigned_claims(identity.tenant_id, identity.assessor_id, since)?;
            let farms = tx.related_farms(identity.tenant_id, identity.assessor_id, since)?;
            let fields = tx.related_fields(identity.tenant_id, identity.assessor_id, since)?;
            Ok(SyncDownResponse {
                timestamp,
                claims,
                farms,
                fields,
            })
        })?;

        info!(
            assessor_id = %identity.assessor_id,
            full = since.is_none(),
            claims = response.claims.len(),
            farms = response.farms.len(),
            fields = response.fields.len(),
            "Served pull"
        );
        Ok(response)
    }

    /// Apply pushed sessions, then pushed samples.
    pub fn push(&self, identity: &AssessorIdentity, request: SyncUpRequest) -> SyncUpResponse {
        let mut synced = SyncedIds::default();
        let mut failed = Vec::new();

        for payload in request.sessions {
            let id = payload.id;
            match self.store.with_tx(|tx| apply_session(tx, identity, payload)) {
                Ok(Ok(())) => synced.sessions.push(id),
                Ok(Err(failure)) => failed.push(failure),
                Err(e) => failed.push(storage_failure(id, &e)),
            }
        }

        for payload in request.samples {
            let id = payload.id;
            match self.store.with_tx(|tx| apply_sample(tx, identity, payload)) {
                Ok(Ok(())) => synced.samples.push(id),
                Ok(Err(failure)) => failed.push(failure),
                Err(e) => failed.push(storage_failure(id, &e)),
            }
        }

        info!(
            assessor_id = %identity.assessor_id,
            sessions = synced.sessions.len(),
            samples = synced.samples.len(),
            failed = failed.len(),
            "Applied push"
        );
        SyncUpResponse::new(synced, failed)
    }
}

/// Outcome of one pushed item. Refusals are decided before anything is
/// written; storage errors travel as `Err` on the outer `Result` and roll the
/// item's transaction back.
type Applied = std::result::Result<(), PushFailure>;

fn storage_failure(id: Uuid, e: &Error) -> PushFailure {
    warn!(%id, error = %e, "Push item failed in storage");
    PushFailure::new(id, PushFailureReason::StorageError).with_detail(e.to_string())
}

fn refuse(id: Uuid, reason: PushFailureReason, detail: impl Into<String>) -> Result<Applied> {
    Ok(Err(PushFailure::new(id, reason).with_detail(detail)))
}

fn apply_session(tx: &ServerTx<'_>, identity: &AssessorIdentity, payload: SessionPayload) -> Result<Applied> {
    let id = payload.id;

    let claim = match tx.claim(payload.claim_id)? {
        Some(claim) if claim.tenant_id == identity.tenant_id => claim,
        _ => {
            debug!(session_id = %id, claim_id = %payload.claim_id, "Session references unknown claim");
            return refuse(id, PushFailureReason::ClaimNotFound, payload.claim_id.to_string());
        }
    };

    let incoming = payload.effective_status();
    let completed_rank = SessionStatus::Completed.completion_rank();
    if incoming == SessionStatus::Draft {
        return refuse(id, PushFailureReason::InvalidPayload, "draft sessions are not synced");
    }
    if incoming.completion_rank() == completed_rank && payload.calculated_result.is_none() {
        return refuse(id, PushFailureReason::InvalidPayload, "completed session without a result");
    }

    let existing = tx.session(id)?;
    if let Some(existing) = &existing {
        if existing.claim_id != payload.claim_id {
            return refuse(id, PushFailureReason::InvalidPayload, "session moved to a different claim");
        }
        let stored_rank = existing.status.completion_rank();
        if stored_rank > incoming.completion_rank() {
            debug!(session_id = %id, stored = %existing.status, incoming = %incoming, "Ignoring stale session");
            return Ok(Ok(()));
        }
        // A completed result is frozen; a re-push carries nothing new.
        if stored_rank == completed_rank {
            return Ok(Ok(()));
        }
    }

    let mut session = payload.into_session(identity.assessor_id, Utc::now());
    if session.status == SessionStatus::Completed {
        session.status = SessionStatus::Synced;
    }
    if let Some(existing) = &existing {
        let unchanged = AssessmentSession {
            updated_at: existing.updated_at,
            ..session.clone()
        };
        if unchanged == *existing {
            debug!(session_id = %id, "Session unchanged");
            return Ok(Ok(()));
        }
    }
    tx.put_session(&session)?;

    let claim_status = if session.status.completion_rank() == completed_rank {
        ClaimStatus::Completed
    } else {
        ClaimStatus::InProgress
    };
    if claim.status < claim_status {
        tx.advance_claim(claim.id, claim_status)?;
    }
    Ok(Ok(()))
}

fn apply_sample(tx: &ServerTx<'_>, identity: &AssessorIdentity, payload: SamplePayload) -> Result<Applied> {
    let id = payload.id;

    let session = match tx.session(payload.session_id)? {
        Some(session) if session.assessor_id == identity.assessor_id => session,
        _ => return refuse(id, PushFailureReason::SessionNotFound, payload.session_id.to_string()),
    };

    // Samples are immutable; a repeat push of a stored id is a no-op.
    if let Some(existing) = tx.sample(id)? {
        if existing.session_id == payload.session_id && existing.sample_number == payload.sample_number {
            return Ok(Ok(()));
        }
        return refuse(id, PushFailureReason::InvalidPayload, "sample id already stored elsewhere");
    }

    let locked = session.status.completion_rank() == SessionStatus::Completed.completion_rank();
    if locked && !part_of_result(tx, &session, id)? {
        return refuse(
            id,
            PushFailureReason::SessionLocked,
            format!("session {} is {}", session.id, session.status),
        );
    }

    if payload.sample_number == 0 {
        return refuse(id, PushFailureReason::InvalidPayload, "sample numbers are 1-based");
    }
    if let Some(holder) = tx.sample_id_by_number(payload.session_id, payload.sample_number)? {
        return refuse(
            id,
            PushFailureReason::DuplicateSampleNumber,
            format!("sample {} holds number {}", holder, payload.sample_number),
        );
    }

    if let Err(e) = MethodMeasurement::parse(session.assessment_method, payload.sample_number, &payload.measurements) {
        return refuse(id, PushFailureReason::InvalidPayload, e.to_string());
    }

    tx.insert_sample(&payload.into_sample(Utc::now()))?;
    Ok(Ok(()))
}

/// Whether sample `id` may still be attached to the completed `session`: it
/// must be one of the samples its frozen result was calculated from. Without
/// an id list, only the result's sample count is known.
fn part_of_result(tx: &ServerTx<'_>, session: &AssessmentSession, id: Uuid) -> Result<bool> {
    if !session.sample_ids.is_empty() {
        return Ok(session.sample_ids.contains(&id));
    }
    let expected = session.calculated_result.as_ref().map_or(0, |r| r.sample_count);
    Ok(tx.samples_for_session(session.id)?.len() < expected)
}
