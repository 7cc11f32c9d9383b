//! Assessment calculation
//!
//! - `measurement` - typed per-method sample payloads
//! - `aggregate`   - Sample Aggregator (samples -> stress percentage)
//! - `engine`      - Loss Calculation Engine (stress -> lookup -> loss)
//! - `quality`     - advisory sampling-quality flags

pub mod aggregate;
pub mod engine;
pub mod measurement;
pub mod quality;

pub use aggregate::{aggregate, AggregateInput, SampleStress};
pub use engine::LossCalculator;
pub use measurement::{
    HailDamageMeasurement, Measurement, MethodMeasurement, StandReductionMeasurement, StressContribution,
};
