//! Sample Aggregator - folds a session's samples into one calculation input

use tracing::debug;

use super::measurement::{Measurement, MethodMeasurement};
use crate::error::{Error, Result};
use crate::model::{AssessmentMethod, SamplePoint};

/// Stress of a single sample, kept for quality checks.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SampleStress {
    pub sample_number: u32,
    pub stress_pct: f64,
}

/// Aggregate input for the loss calculation. Percentages are 0-100.
#[derive(Debug, Clone, PartialEq)]
pub struct AggregateInput {
    pub method: AssessmentMethod,
    pub sample_count: usize,
    pub mean_reduction_pct: f64,
    pub mean_direct_damage_pct: Option<f64>,
    /// Combined stress fed into the lookup curve
    pub stress_pct: f64,
    /// Ordered by sample number
    pub per_sample: Vec<SampleStress>,
}

/// Validate and fold `samples` for `method`.
///
/// Summation always runs in ascending sample-number order, so the result does
/// not depend on the order the samples were collected or stored in.
pub fn aggregate(method: AssessmentMethod, samples: &[SamplePoint]) -> Result<AggregateInput> {
    if samples.is_empty() {
        return Err(Error::EmptySampleSet);
    }

    let mut ordered: Vec<&SamplePoint> = samples.iter().collect();
    ordered.sort_by_key(|s| s.sample_number);

    if let Some(pair) = ordered
        .windows(2)
        .find(|pair| pair[0].sample_number == pair[1].sample_number)
    {
        return Err(Error::DuplicateSampleNumber {
            session_id: pair[1].session_id,
            sample_number: pair[1].sample_number,
        });
    }

    let mut reduction_sum = 0.0;
    let mut direct_sum = 0.0;
    let mut per_sample = Vec::with_capacity(ordered.len());

    for sample in &ordered {
        let measurement = MethodMeasurement::parse(method, sample.sample_number, &sample.measurements)?;
        let contribution = measurement.stress_contribution();

        reduction_sum += contribution.reduction;
        let sample_stress = match contribution.direct_damage {
            Some(direct) => {
                direct_sum += direct;
                compound(contribution.reduction, direct)
            }
            None => contribution.reduction,
        };
        per_sample.push(SampleStress {
            sample_number: sample.sample_number,
            stress_pct: sample_stress * 100.0,
        });
    }

    let n = ordered.len() as f64;
    let mean_reduction = reduction_sum / n;
    let (mean_direct, stress) = if method.has_direct_damage() {
        let mean_direct = direct_sum / n;
        (Some(mean_direct), compound(mean_reduction, mean_direct))
    } else {
        (None, mean_reduction)
    };

    let input = AggregateInput {
        method,
        sample_count: ordered.len(),
        mean_reduction_pct: mean_reduction * 100.0,
        mean_direct_damage_pct: mean_direct.map(|d| d * 100.0),
        stress_pct: stress * 100.0,
        per_sample,
    };

    debug!(
        method = %method,
        samples = input.sample_count,
        stress_pct = input.stress_pct,
        "Aggregated samples"
    );
    Ok(input)
}

/// Damages compound on what remains rather than adding, so the total never exceeds 1.
fn compound(reduction: f64, direct: f64) -> f64 {
    1.0 - (1.0 - reduction) * (1.0 - direct)
}
