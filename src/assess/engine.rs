//! Loss Calculation Engine

use tracing::{info, warn};

use super::aggregate::aggregate;
use super::quality::{check_density, check_samples};
use crate::error::{Error, Result};
use crate::lookup::LookupSource;
use crate::model::{AssessmentSession, CalculatedResult, CalculationBreakdown, SamplePoint};

/// Turns a session's samples into a frozen loss figure.
pub struct LossCalculator<'a, L: LookupSource + ?Sized> {
    lookup: &'a L,
    field_area_ha: Option<f64>,
}

impl<'a, L: LookupSource + ?Sized> LossCalculator<'a, L> {
    pub fn new(lookup: &'a L) -> Self {
        Self {
            lookup,
            field_area_ha: None,
        }
    }

    /// Area of the assessed field, enabling the sampling-density flag.
    pub fn with_field_area(mut self, area_hectares: Option<f64>) -> Self {
        self.field_area_ha = area_hectares;
        self
    }

    /// Calculate the result for `session` from `samples`.
    ///
    /// Fails when the growth stage is missing, the samples do not validate, or
    /// the method's table has no curve for the growth stage. There is no
    /// fallback curve: a missing curve never turns into a default loss.
    pub fn calculate(&self, session: &AssessmentSession, samples: &[SamplePoint]) -> Result<CalculatedResult> {
        let growth_stage = session
            .growth_stage
            .clone()
            .ok_or(Error::MissingGrowthStage(session.id))?;
        let method = session.assessment_method;

        let input = aggregate(method, samples)?;

        let table = method.table_name();
        let potential = match self.lookup.interpolate(table, growth_stage.as_str(), input.stress_pct) {
            Ok(value) => value,
            Err(e) => {
                warn!(session_id = %session.id, table, growth_stage = %growth_stage, error = %e, "Lookup failed");
                return Err(e);
            }
        };
        let potential = potential.clamp(0.0, 100.0);
        let loss = (100.0 - potential).clamp(0.0, 100.0);

        let mut flags = check_samples(&input.per_sample);
        if let Some(flag) = self
            .field_area_ha
            .and_then(|area| check_density(input.sample_count, area))
        {
            flags.push(flag);
        }

        info!(
            session_id = %session.id,
            method = %method,
            growth_stage = %growth_stage,
            samples = input.sample_count,
            stress_pct = input.stress_pct,
            loss_pct = loss,
            flags = flags.len(),
            "Calculated loss"
        );

        Ok(CalculatedResult {
            average_potential_yield_pct: round2(potential),
            loss_percentage: round2(loss),
            sample_count: input.sample_count,
            method: Some(method),
            breakdown: Some(CalculationBreakdown {
                growth_stage,
                table_used: table.to_string(),
                stress_pct: input.stress_pct,
                mean_reduction_pct: input.mean_reduction_pct,
                mean_direct_damage_pct: input.mean_direct_damage_pct,
                flags,
            }),
        })
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
