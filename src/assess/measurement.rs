//! Typed per-method measurements
//!
//! Samples arrive with a schema-free key/value payload. Before anything is
//! computed the payload is lifted into the measurement type of the session's
//! assessment method.

use serde_json::Value;

use crate::error::{Error, Result};
use crate::model::{AssessmentMethod, MeasurementMap};

pub const ORIGINAL_STAND_COUNT: &str = "original_stand_count";
pub const DESTROYED_PLANT_COUNT: &str = "destroyed_plant_count";
pub const DIRECT_DAMAGE_PCT: &str = "direct_damage_pct";

/// What one sample contributes to the aggregate stress. Fractions in [0, 1].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StressContribution {
    pub reduction: f64,
    pub direct_damage: Option<f64>,
}

/// Common interface of every method's measurement.
pub trait Measurement {
    /// Check value ranges; `sample_number` is used for error reporting.
    fn validate(&self, sample_number: u32) -> Result<()>;

    fn stress_contribution(&self) -> StressContribution;
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StandReductionMeasurement {
    pub original_stand_count: f64,
    pub destroyed_plant_count: f64,
}

impl StandReductionMeasurement {
    fn from_map(sample_number: u32, map: &MeasurementMap) -> Result<Self> {
        Ok(Self {
            original_stand_count: required_number(sample_number, map, ORIGINAL_STAND_COUNT)?,
            destroyed_plant_count: required_number(sample_number, map, DESTROYED_PLANT_COUNT)?,
        })
    }

    pub fn into_map(self) -> MeasurementMap {
        let mut map = MeasurementMap::new();
        map.insert(ORIGINAL_STAND_COUNT.into(), number(self.original_stand_count));
        map.insert(DESTROYED_PLANT_COUNT.into(), number(self.destroyed_plant_count));
        map
    }
}

impl Measurement for StandReductionMeasurement {
    fn validate(&self, sample_number: u32) -> Result<()> {
        if self.original_stand_count <= 0.0 {
            return Err(invalid(sample_number, ORIGINAL_STAND_COUNT, "must be greater than zero"));
        }
        if self.destroyed_plant_count < 0.0 {
            return Err(invalid(sample_number, DESTROYED_PLANT_COUNT, "must not be negative"));
        }
        Ok(())
    }

    fn stress_contribution(&self) -> StressContribution {
        StressContribution {
            reduction: (self.destroyed_plant_count / self.original_stand_count).clamp(0.0, 1.0),
            direct_damage: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HailDamageMeasurement {
    pub stand: StandReductionMeasurement,
    /// Crippled plants, stalk and ear damage, in percent
    pub direct_damage_pct: f64,
}

impl HailDamageMeasurement {
    fn from_map(sample_number: u32, map: &MeasurementMap) -> Result<Self> {
        Ok(Self {
            stand: StandReductionMeasurement::from_map(sample_number, map)?,
            direct_damage_pct: required_number(sample_number, map, DIRECT_DAMAGE_PCT)?,
        })
    }

    pub fn into_map(self) -> MeasurementMap {
        let mut map = self.stand.into_map();
        map.insert(DIRECT_DAMAGE_PCT.into(), number(self.direct_damage_pct));
        map
    }
}

impl Measurement for HailDamageMeasurement {
    fn validate(&self, sample_number: u32) -> Result<()> {
        self.stand.validate(sample_number)?;
        if !(0.0..=100.0).contains(&self.direct_damage_pct) {
            return Err(invalid(sample_number, DIRECT_DAMAGE_PCT, "must be between 0 and 100"));
        }
        Ok(())
    }

    fn stress_contribution(&self) -> StressContribution {
        StressContribution {
            reduction: self.stand.stress_contribution().reduction,
            direct_damage: Some(self.direct_damage_pct / 100.0),
        }
    }
}

/// A sample's measurement, typed by the session's method.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MethodMeasurement {
    StandReduction(StandReductionMeasurement),
    HailDamage(HailDamageMeasurement),
}

impl MethodMeasurement {
    /// Parse and validate the wire payload of one sample.
    pub fn parse(method: AssessmentMethod, sample_number: u32, map: &MeasurementMap) -> Result<Self> {
        let measurement = match method {
            AssessmentMethod::StandReduction => {
                MethodMeasurement::StandReduction(StandReductionMeasurement::from_map(sample_number, map)?)
            }
            AssessmentMethod::HailDamage => {
                MethodMeasurement::HailDamage(HailDamageMeasurement::from_map(sample_number, map)?)
            }
        };
        measurement.validate(sample_number)?;
        Ok(measurement)
    }
}

impl Measurement for MethodMeasurement {
    fn validate(&self, sample_number: u32) -> Result<()> {
        match self {
            MethodMeasurement::StandReduction(m) => m.validate(sample_number),
            MethodMeasurement::HailDamage(m) => m.validate(sample_number),
        }
    }

    fn stress_contribution(&self) -> StressContribution {
        match self {
            MethodMeasurement::StandReduction(m) => m.stress_contribution(),
            MethodMeasurement::HailDamage(m) => m.stress_contribution(),
        }
    }
}

fn required_number(sample_number: u32, map: &MeasurementMap, key: &str) -> Result<f64> {
    match map.get(key) {
        None | Some(Value::Null) => Err(invalid(sample_number, key, "missing")),
        Some(value) => match value.as_f64() {
            Some(n) if n.is_finite() => Ok(n),
            _ => Err(invalid(sample_number, key, "not a number")),
        },
    }
}

fn invalid(sample_number: u32, key: &str, reason: &str) -> Error {
    Error::InvalidMeasurement {
        sample_number,
        key: key.to_string(),
        reason: reason.to_string(),
    }
}

fn number(n: f64) -> Value {
    serde_json::Number::from_f64(n)
        .map(Value::Number)
        .unwrap_or(Value::Null)
}
