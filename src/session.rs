//! Session State Machine
//!
//! ```text
//! draft ──create──▶ in_progress ──complete──▶ completed ──mark synced──▶ synced
//!                      │   ▲
//!                      └───┘ add sample
//! ```
//!
//! A `SessionHandle` owns one session and its samples. Callers thread the
//! handle explicitly through operations; there is no ambient current session,
//! so any number of sessions across claims can be open at once.

use chrono::{DateTime, Utc};
use tracing::{debug, info};
use uuid::Uuid;

use crate::assess::{LossCalculator, MethodMeasurement};
use crate::error::{Error, Result};
use crate::lookup::LookupSource;
use crate::model::{
    AssessmentMethod, AssessmentSession, CalculatedResult, Claim, ClaimStatus, GeoPoint, GrowthStage,
    MeasurementMap, SamplePoint, SessionStatus,
};

/// A field measurement about to be attached to a session.
#[derive(Debug, Clone, Default)]
pub struct NewSample {
    /// Assigned as `max + 1` when omitted
    pub sample_number: Option<u32>,
    pub location: Option<GeoPoint>,
    pub measurements: MeasurementMap,
    pub evidence_refs: Vec<String>,
    pub notes: Option<String>,
    pub captured_at: Option<DateTime<Utc>>,
}

impl NewSample {
    pub fn new(measurements: MeasurementMap) -> Self {
        Self {
            measurements,
            ..Default::default()
        }
    }

    pub fn numbered(sample_number: u32, measurements: MeasurementMap) -> Self {
        Self {
            sample_number: Some(sample_number),
            measurements,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SessionHandle {
    session: AssessmentSession,
    samples: Vec<SamplePoint>,
}

impl SessionHandle {
    /// Pre-creation client state. Nothing about a draft is persisted remotely.
    pub fn draft(
        claim_id: Uuid,
        assessor_id: Uuid,
        method: AssessmentMethod,
        growth_stage: Option<GrowthStage>,
    ) -> Self {
        let now = Utc::now();
        Self {
            session: AssessmentSession {
                id: Uuid::new_v4(),
                claim_id,
                assessor_id,
                assessment_method: method,
                growth_stage,
                status: SessionStatus::Draft,
                sample_ids: Vec::new(),
                calculated_result: None,
                created_at: now,
                date_started: None,
                date_completed: None,
                updated_at: now,
            },
            samples: Vec::new(),
        }
    }

    /// Draft and start a session against `claim` in one step.
    pub fn create(
        claim: &mut Claim,
        assessor_id: Uuid,
        method: AssessmentMethod,
        growth_stage: Option<GrowthStage>,
    ) -> Result<Self> {
        let mut handle = Self::draft(claim.id, assessor_id, method, growth_stage);
        handle.start(claim)?;
        Ok(handle)
    }

    /// Rebuild a handle from stored parts.
    pub fn from_parts(session: AssessmentSession, mut samples: Vec<SamplePoint>) -> Self {
        samples.sort_by_key(|s| s.sample_number);
        Self { session, samples }
    }

    pub fn into_parts(self) -> (AssessmentSession, Vec<SamplePoint>) {
        (self.session, self.samples)
    }

    pub fn id(&self) -> Uuid {
        self.session.id
    }

    pub fn status(&self) -> SessionStatus {
        self.session.status
    }

    pub fn session(&self) -> &AssessmentSession {
        &self.session
    }

    /// Samples ordered by sample number
    pub fn samples(&self) -> &[SamplePoint] {
        &self.samples
    }

    pub fn result(&self) -> Option<&CalculatedResult> {
        self.session.calculated_result.as_ref()
    }

    /// `draft -> in_progress`. Moves the owning claim to `in_progress`.
    pub fn start(&mut self, claim: &mut Claim) -> Result<()> {
        if self.session.status != SessionStatus::Draft {
            return Err(self.invalid_transition(SessionStatus::InProgress));
        }
        if claim.id != self.session.claim_id {
            return Err(Error::ClaimNotFound(self.session.claim_id));
        }
        if !claim.status.accepts_sessions() {
            return Err(Error::ClaimClosed {
                claim_id: claim.id,
                status: claim.status.to_string(),
            });
        }

        let now = Utc::now();
        self.session.status = SessionStatus::InProgress;
        self.session.date_started = Some(now);
        self.session.updated_at = now;

        if claim.advance_status(ClaimStatus::InProgress) {
            claim.updated_at = now;
        }

        info!(
            session_id = %self.session.id,
            claim_id = %claim.id,
            method = %self.session.assessment_method,
            "Session started"
        );
        Ok(())
    }

    pub fn set_growth_stage(&mut self, stage: GrowthStage) -> Result<()> {
        self.ensure_open(SessionStatus::InProgress)?;
        self.session.growth_stage = Some(stage);
        self.session.updated_at = Utc::now();
        Ok(())
    }

    /// Append a sample. Legal only while `in_progress`; status is unchanged.
    pub fn add_sample(&mut self, new: NewSample) -> Result<&SamplePoint> {
        self.ensure_open(SessionStatus::InProgress)?;

        let sample_number = match new.sample_number {
            Some(0) => return Err(Error::InvalidSampleNumber(0)),
            Some(n) => n,
            None => match self.samples.last() {
                Some(last) => last
                    .sample_number
                    .checked_add(1)
                    .ok_or(Error::InvalidSampleNumber(u32::MAX))?,
                None => 1,
            },
        };
        if self.samples.iter().any(|s| s.sample_number == sample_number) {
            return Err(Error::DuplicateSampleNumber {
                session_id: self.session.id,
                sample_number,
            });
        }
        MethodMeasurement::parse(self.session.assessment_method, sample_number, &new.measurements)?;

        let now = Utc::now();
        let sample = SamplePoint {
            id: Uuid::new_v4(),
            session_id: self.session.id,
            sample_number,
            location: new.location,
            measurements: new.measurements,
            evidence_refs: new.evidence_refs,
            notes: new.notes,
            captured_at: new.captured_at.unwrap_or(now),
        };

        self.session.sample_ids.push(sample.id);
        self.session.updated_at = now;

        let idx = self.samples.partition_point(|s| s.sample_number < sample_number);
        self.samples.insert(idx, sample);

        debug!(session_id = %self.session.id, sample_number, "Sample added");
        Ok(&self.samples[idx])
    }

    /// `in_progress -> completed`. Runs the loss calculation and freezes the result.
    ///
    /// On any failure the session is left exactly as it was.
    pub fn complete<L: LookupSource + ?Sized>(&mut self, lookup: &L) -> Result<&CalculatedResult> {
        self.complete_for_field(lookup, None)
    }

    /// Same as `complete`, also checking sampling density against the field area.
    pub fn complete_for_field<L: LookupSource + ?Sized>(
        &mut self,
        lookup: &L,
        field_area_ha: Option<f64>,
    ) -> Result<&CalculatedResult> {
        match self.session.status {
            SessionStatus::InProgress => {}
            SessionStatus::Synced => return Err(self.locked()),
            _ => return Err(self.invalid_transition(SessionStatus::Completed)),
        }
        if self.samples.is_empty() {
            return Err(Error::EmptySampleSet);
        }

        let result = LossCalculator::new(lookup)
            .with_field_area(field_area_ha)
            .calculate(&self.session, &self.samples)?;

        let now = Utc::now();
        self.session.status = SessionStatus::Completed;
        self.session.date_completed = Some(now);
        self.session.updated_at = now;

        info!(
            session_id = %self.session.id,
            loss_pct = result.loss_percentage,
            "Session completed"
        );
        Ok(self.session.calculated_result.insert(result))
    }

    /// `completed -> synced`, after the server acknowledged the completed session.
    pub fn mark_synced(&mut self) -> Result<()> {
        if self.session.status != SessionStatus::Completed {
            return Err(self.invalid_transition(SessionStatus::Synced));
        }
        self.session.status = SessionStatus::Synced;
        self.session.updated_at = Utc::now();
        debug!(session_id = %self.session.id, "Session marked synced");
        Ok(())
    }

    fn ensure_open(&self, requested: SessionStatus) -> Result<()> {
        match self.session.status {
            SessionStatus::InProgress => Ok(()),
            SessionStatus::Completed | SessionStatus::Synced => Err(self.locked()),
            SessionStatus::Draft => Err(self.invalid_transition(requested)),
        }
    }

    fn locked(&self) -> Error {
        Error::SessionLocked {
            session_id: self.session.id,
            status: self.session.status,
        }
    }

    fn invalid_transition(&self, requested: SessionStatus) -> Error {
        Error::InvalidStateTransition {
            current: self.session.status,
            requested,
        }
    }
}
