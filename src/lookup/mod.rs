//! Lookup Table Store - piecewise-linear reference curves
//!
//! Each curve is keyed by `(table_name, condition)` and maps a stress
//! percentage to a residual-capacity percentage. Queries between calibration
//! points interpolate linearly; queries outside the calibrated range clamp to
//! the nearest boundary output.

pub mod seed;

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Error, Result};

/// One calibration point of a named reference curve.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LookupTableEntry {
    pub table_name: String,
    pub input_value: f64,
    pub condition: String,
    pub output_value: f64,
}

/// Read access to reference curves, as needed by the calculation engine.
pub trait LookupSource: Send + Sync {
    /// Fetch the curve for a `(table_name, condition)` pair.
    fn curve(&self, table_name: &str, condition: &str) -> Result<Curve>;

    fn interpolate(&self, table_name: &str, condition: &str, input_value: f64) -> Result<f64> {
        self.curve(table_name, condition)?.interpolate(input_value)
    }
}

/// Calibration points of one curve, sorted ascending by input and never empty.
#[derive(Debug, Clone, PartialEq)]
pub struct Curve {
    points: Vec<(f64, f64)>,
}

impl Curve {
    pub fn points(&self) -> &[(f64, f64)] {
        &self.points
    }

    /// Evaluate the curve at `x`.
    pub fn interpolate(&self, x: f64) -> Result<f64> {
        if x.is_nan() {
            return Err(Error::InvalidStressInput(x));
        }

        let (first, last) = match (self.points.first(), self.points.last()) {
            (Some(first), Some(last)) => (*first, *last),
            _ => return Err(Error::Internal("empty lookup curve".to_string())),
        };

        if x <= first.0 {
            return Ok(first.1);
        }
        if x >= last.0 {
            return Ok(last.1);
        }

        // First point with input >= x; guaranteed to exist and to be > 0 after the clamps above
        let upper = self.points.partition_point(|(input, _)| *input < x);
        let (x1, y1) = self.points[upper];
        if x1 == x {
            return Ok(y1);
        }
        let (x0, y0) = self.points[upper - 1];

        Ok(y0 + (x - x0) * (y1 - y0) / (x1 - x0))
    }
}

/// In-memory store of all reference curves.
#[derive(Debug, Clone, Default)]
pub struct LookupTableStore {
    tables: BTreeMap<(String, String), Vec<(f64, f64)>>,
}

impl LookupTableStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store seeded with the built-in charts.
    pub fn with_builtin_seed() -> Result<Self> {
        let mut store = Self::new();
        store.extend(seed::builtin_entries())?;
        debug!(curves = store.curve_count(), "Loaded built-in lookup tables");
        Ok(store)
    }

    /// Load entries from a JSON seed file (`[{table_name, input_value, condition, output_value}]`).
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let entries: Vec<LookupTableEntry> = serde_json::from_str(&content)?;

        let mut store = Self::new();
        let count = entries.len();
        store.extend(entries)?;

        info!(path = %path.display(), entries = count, curves = store.curve_count(), "Loaded lookup tables");
        Ok(store)
    }

    /// Insert or replace a calibration point. Returns the replaced output, if any.
    pub fn insert(&mut self, entry: LookupTableEntry) -> Result<Option<f64>> {
        if !entry.input_value.is_finite() {
            return Err(Error::InvalidStressInput(entry.input_value));
        }
        if !entry.output_value.is_finite() {
            return Err(Error::InvalidStressInput(entry.output_value));
        }

        let points = self
            .tables
            .entry((entry.table_name, entry.condition))
            .or_default();

        match points.binary_search_by(|(input, _)| input.total_cmp(&entry.input_value)) {
            Ok(idx) => {
                let previous = points[idx].1;
                points[idx].1 = entry.output_value;
                Ok(Some(previous))
            }
            Err(idx) => {
                points.insert(idx, (entry.input_value, entry.output_value));
                Ok(None)
            }
        }
    }

    pub fn extend<I>(&mut self, entries: I) -> Result<()>
    where
        I: IntoIterator<Item = LookupTableEntry>,
    {
        for entry in entries {
            self.insert(entry)?;
        }
        Ok(())
    }

    pub fn curve_count(&self) -> usize {
        self.tables.len()
    }

    /// Conditions that have a curve under `table_name`.
    pub fn conditions(&self, table_name: &str) -> Vec<&str> {
        self.tables
            .keys()
            .filter(|(table, _)| table == table_name)
            .map(|(_, condition)| condition.as_str())
            .collect()
    }

    /// Flatten back into entries, ordered by table, condition and input.
    pub fn entries(&self) -> Vec<LookupTableEntry> {
        self.tables
            .iter()
            .flat_map(|((table, condition), points)| {
                points.iter().map(move |(input, output)| LookupTableEntry {
                    table_name: table.clone(),
                    input_value: *input,
                    condition: condition.clone(),
                    output_value: *output,
                })
            })
            .collect()
    }
}

impl LookupSource for LookupTableStore {
    fn curve(&self, table_name: &str, condition: &str) -> Result<Curve> {
        match self
            .tables
            .get(&(table_name.to_string(), condition.to_string()))
        {
            Some(points) if !points.is_empty() => {
                debug!(table_name, condition, points = points.len(), "Resolved lookup curve");
                Ok(Curve {
                    points: points.clone(),
                })
            }
            _ => Err(Error::UnknownCondition {
                table: table_name.to_string(),
                condition: condition.to_string(),
            }),
        }
    }
}
