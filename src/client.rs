//! Field client
//!
//! Runs session operations against the local store. Every operation is
//! synchronous, works offline and queues its snapshot for the next push.
//! A handle is only updated after its change has been persisted.

use std::sync::Arc;

use tracing::info;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::lookup::LookupSource;
use crate::model::{AssessmentMethod, AssessmentSession, CalculatedResult, ClaimStatus, GrowthStage, SamplePoint};
use crate::session::{NewSample, SessionHandle};
use crate::storage::LocalStore;

pub struct FieldClient {
    store: Arc<LocalStore>,
    lookup: Arc<dyn LookupSource>,
    assessor_id: Uuid,
}

impl FieldClient {
    pub fn new(store: Arc<LocalStore>, lookup: Arc<dyn LookupSource>, assessor_id: Uuid) -> Self {
        Self {
            store,
            lookup,
            assessor_id,
        }
    }

    pub fn store(&self) -> &Arc<LocalStore> {
        &self.store
    }

    /// Open a new session against a claim held in the local store.
    pub fn start_session(
        &self,
        claim_id: Uuid,
        method: AssessmentMethod,
        growth_stage: Option<&str>,
    ) -> Result<SessionHandle> {
        let mut claim = self.store.claim(claim_id)?.ok_or(Error::ClaimNotFound(claim_id))?;
        let growth_stage = growth_stage.map(GrowthStage::parse).transpose()?;

        let handle = SessionHandle::create(&mut claim, self.assessor_id, method, growth_stage)?;
        self.store.record_session(handle.session(), Some(&claim))?;

        info!(session_id = %handle.id(), %claim_id, method = %method, "Started session");
        Ok(handle)
    }

    /// Reopen a stored session.
    pub fn open_session(&self, session_id: Uuid) -> Result<SessionHandle> {
        self.store
            .load_session(session_id)?
            .ok_or(Error::SessionNotFound(session_id))
    }

    pub fn sessions_for_claim(&self, claim_id: Uuid) -> Result<Vec<AssessmentSession>> {
        self.store.sessions_for_claim(claim_id)
    }

    pub fn add_sample(&self, handle: &mut SessionHandle, sample: NewSample) -> Result<SamplePoint> {
        let mut next = handle.clone();
        let sample = next.add_sample(sample)?.clone();
        self.store.record_sample(next.session(), &sample)?;
        *handle = next;
        Ok(sample)
    }

    pub fn set_growth_stage(&self, handle: &mut SessionHandle, growth_stage: &str) -> Result<()> {
        let stage = GrowthStage::parse(growth_stage)?;
        let mut next = handle.clone();
        next.set_growth_stage(stage)?;
        self.store.record_session(next.session(), None)?;
        *handle = next;
        Ok(())
    }

    /// Calculate and freeze the session's result; the claim moves to `completed`.
    pub fn complete_session(&self, handle: &mut SessionHandle) -> Result<CalculatedResult> {
        let mut claim = self.store.claim(handle.session().claim_id)?;
        let field_area = match &claim {
            Some(claim) => self.store.field(claim.field_id)?.and_then(|f| f.area_hectares),
            None => None,
        };

        let mut next = handle.clone();
        let result = next.complete_for_field(self.lookup.as_ref(), field_area)?.clone();

        if let Some(claim) = claim.as_mut() {
            claim.advance_status(ClaimStatus::Completed);
        }
        self.store.record_session(next.session(), claim.as_ref())?;
        *handle = next;

        info!(
            session_id = %handle.id(),
            loss_pct = result.loss_percentage,
            potential_pct = result.average_potential_yield_pct,
            "Completed session"
        );
        Ok(result)
    }
}
