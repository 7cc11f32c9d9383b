//! Sync wire protocol
//!
//! JSON bodies exchanged over `GET /api/v1/sync/down` and `POST /api/v1/sync/up`.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::model::{
    AssessmentMethod, AssessmentSession, CalculatedResult, Claim, Farm, Field, GeoPoint, GrowthStage,
    MeasurementMap, SamplePoint, SessionStatus,
};

/// Session snapshot as pushed by a client.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionPayload {
    pub id: Uuid,
    pub claim_id: Uuid,
    pub assessment_method: AssessmentMethod,
    #[serde(default)]
    pub growth_stage: Option<GrowthStage>,
    /// Absent on older clients; inferred from the result
    #[serde(default)]
    pub status: Option<SessionStatus>,
    #[serde(default)]
    pub sample_ids: Vec<Uuid>,
    #[serde(default)]
    pub date_started: Option<DateTime<Utc>>,
    #[serde(default)]
    pub date_completed: Option<DateTime<Utc>>,
    #[serde(default)]
    pub calculated_result: Option<CalculatedResult>,
    pub created_at: DateTime<Utc>,
}

impl SessionPayload {
    pub fn effective_status(&self) -> SessionStatus {
        match self.status {
            Some(status) => status,
            None if self.calculated_result.is_some() => SessionStatus::Completed,
            None => SessionStatus::InProgress,
        }
    }

    /// Materialise the payload as a server-side session owned by `assessor_id`.
    pub fn into_session(self, assessor_id: Uuid, received_at: DateTime<Utc>) -> AssessmentSession {
        let status = self.effective_status();
        AssessmentSession {
            id: self.id,
            claim_id: self.claim_id,
            assessor_id,
            assessment_method: self.assessment_method,
            growth_stage: self.growth_stage,
            status,
            sample_ids: self.sample_ids,
            calculated_result: self.calculated_result,
            created_at: self.created_at,
            date_started: self.date_started,
            date_completed: self.date_completed,
            updated_at: received_at,
        }
    }
}

impl From<&AssessmentSession> for SessionPayload {
    fn from(session: &AssessmentSession) -> Self {
        Self {
            id: session.id,
            claim_id: session.claim_id,
            assessment_method: session.assessment_method,
            growth_stage: session.growth_stage.clone(),
            status: Some(session.status),
            sample_ids: session.sample_ids.clone(),
            date_started: session.date_started,
            date_completed: session.date_completed,
            calculated_result: session.calculated_result.clone(),
            created_at: session.created_at,
        }
    }
}

/// Sample snapshot as pushed by a client. Location is flattened on the wire.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SamplePayload {
    pub id: Uuid,
    pub session_id: Uuid,
    pub sample_number: u32,
    #[serde(default)]
    pub lat: Option<f64>,
    #[serde(default)]
    pub lng: Option<f64>,
    #[serde(default)]
    pub gps_accuracy_meters: Option<f64>,
    pub measurements: MeasurementMap,
    #[serde(default)]
    pub evidence_refs: Vec<String>,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub captured_at: Option<DateTime<Utc>>,
}

impl SamplePayload {
    pub fn into_sample(self, received_at: DateTime<Utc>) -> SamplePoint {
        let location = match (self.lat, self.lng) {
            (Some(lat), Some(lng)) => Some(GeoPoint {
                lat,
                lng,
                accuracy_meters: self.gps_accuracy_meters,
            }),
            _ => None,
        };
        SamplePoint {
            id: self.id,
            session_id: self.session_id,
            sample_number: self.sample_number,
            location,
            measurements: self.measurements,
            evidence_refs: self.evidence_refs,
            notes: self.notes,
            captured_at: self.captured_at.unwrap_or(received_at),
        }
    }
}

impl From<&SamplePoint> for SamplePayload {
    fn from(sample: &SamplePoint) -> Self {
        Self {
            id: sample.id,
            session_id: sample.session_id,
            sample_number: sample.sample_number,
            lat: sample.location.map(|l| l.lat),
            lng: sample.location.map(|l| l.lng),
            gps_accuracy_meters: sample.location.and_then(|l| l.accuracy_meters),
            measurements: sample.measurements.clone(),
            evidence_refs: sample.evidence_refs.clone(),
            notes: sample.notes.clone(),
            captured_at: Some(sample.captured_at),
        }
    }
}

/// Response to a pull. `timestamp` becomes the client's next cursor.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SyncDownResponse {
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub claims: Vec<Claim>,
    #[serde(default)]
    pub farms: Vec<Farm>,
    #[serde(default)]
    pub fields: Vec<Field>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SyncUpRequest {
    #[serde(default)]
    pub sessions: Vec<SessionPayload>,
    #[serde(default)]
    pub samples: Vec<SamplePayload>,
}

impl SyncUpRequest {
    pub fn len(&self) -> usize {
        self.sessions.len() + self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PushStatus {
    Success,
    Partial,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SyncedIds {
    #[serde(default)]
    pub sessions: Vec<Uuid>,
    #[serde(default)]
    pub samples: Vec<Uuid>,
}

/// Why the server refused one pushed item.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum PushFailureReason {
    ClaimNotFound,
    SessionNotFound,
    DuplicateSampleNumber,
    SessionLocked,
    InvalidPayload,
    StorageError,
}

impl fmt::Display for PushFailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PushFailureReason::ClaimNotFound => "ClaimNotFound",
            PushFailureReason::SessionNotFound => "SessionNotFound",
            PushFailureReason::DuplicateSampleNumber => "DuplicateSampleNumber",
            PushFailureReason::SessionLocked => "SessionLocked",
            PushFailureReason::InvalidPayload => "InvalidPayload",
            PushFailureReason::StorageError => "StorageError",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PushFailure {
    pub id: Uuid,
    pub reason: PushFailureReason,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl PushFailure {
    pub fn new(id: Uuid, reason: PushFailureReason) -> Self {
        Self { id, reason, detail: None }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SyncUpResponse {
    pub status: PushStatus,
    pub synced: SyncedIds,
    #[serde(default)]
    pub failed: Vec<PushFailure>,
}

impl SyncUpResponse {
    pub fn new(synced: SyncedIds, failed: Vec<PushFailure>) -> Self {
        let status = if failed.is_empty() {
            PushStatus::Success
        } else {
            PushStatus::Partial
        };
        Self { status, synced, failed }
    }
}
