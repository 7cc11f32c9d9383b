//! Built-in reference charts
//!
//! Maize stand-reduction and hail charts, restated as
//! `stress % -> potential yield %` so both methods share one curve shape.

use super::LookupTableEntry;
use crate::model::AssessmentMethod;

/// Stand reduction chart. Columns are growth stages, rows are percent of the
/// original stand destroyed.
const STAND_REDUCTION_STAGES: [&str; 6] = ["VE", "V2", "V4", "V6", "V8", "V10"];
const STAND_REDUCTION_ROWS: [(f64, [f64; 6]); 7] = [
    (0.0, [100.0, 100.0, 100.0, 100.0, 100.0, 100.0]),
    (10.0, [90.0, 92.0, 94.0, 96.0, 97.0, 98.0]),
    (20.0, [80.0, 84.0, 88.0, 92.0, 94.0, 96.0]),
    (30.0, [70.0, 76.0, 82.0, 88.0, 91.0, 94.0]),
    (40.0, [60.0, 68.0, 76.0, 84.0, 88.0, 92.0]),
    (50.0, [50.0, 60.0, 70.0, 80.0, 85.0, 90.0]),
    (100.0, [0.0, 0.0, 0.0, 0.0, 0.0, 0.0]),
];

/// Hail stand damage: mid-vegetative plants partly recover, later stages
/// lose close to one-for-one.
const HAIL_EARLY_STAGES: [&str; 4] = ["V7", "V8", "V9", "V10"];
const HAIL_EARLY_ROWS: [(f64, f64); 4] = [(0.0, 100.0), (10.0, 97.0), (50.0, 52.0), (100.0, 0.0)];
const HAIL_LATE_STAGES: [&str; 3] = ["V11", "V15", "VT"];
const HAIL_LATE_ROWS: [(f64, f64); 4] = [(0.0, 100.0), (10.0, 91.0), (50.0, 50.0), (100.0, 0.0)];

pub fn builtin_entries() -> Vec<LookupTableEntry> {
    let mut entries = Vec::new();

    let stand_table = AssessmentMethod::StandReduction.table_name();
    for (input, outputs) in STAND_REDUCTION_ROWS {
        for (stage, output) in STAND_REDUCTION_STAGES.iter().zip(outputs) {
            entries.push(LookupTableEntry {
                table_name: stand_table.to_string(),
                input_value: input,
                condition: stage.to_string(),
                output_value: output,
            });
        }
    }

    let hail_table = AssessmentMethod::HailDamage.table_name();
    for (stages, rows) in [
        (&HAIL_EARLY_STAGES[..], HAIL_EARLY_ROWS),
        (&HAIL_LATE_STAGES[..], HAIL_LATE_ROWS),
    ] {
        for stage in stages {
            for (input, output) in rows {
                entries.push(LookupTableEntry {
                    table_name: hail_table.to_string(),
                    input_value: input,
                    condition: stage.to_string(),
                    output_value: output,
                });
            }
        }
    }

    entries
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lookup::{LookupSource, LookupTableStore};

    #[test]
    fn test_builtin_seed_covers_both_methods() {
        let store = LookupTableStore::with_builtin_seed().unwrap();
        assert_eq!(
            store.conditions(AssessmentMethod::StandReduction.table_name()).len(),
            STAND_REDUCTION_STAGES.len()
        );
        assert_eq!(
            store.conditions(AssessmentMethod::HailDamage.table_name()).len(),
            HAIL_EARLY_STAGES.len() + HAIL_LATE_STAGES.len()
        );
    }

    #[test]
    fn test_builtin_stand_curve_values() {
        let store = LookupTableStore::with_builtin_seed().unwrap();
        let table = AssessmentMethod::StandReduction.table_name();
        assert_eq!(store.interpolate(table, "V6", 30.0).unwrap(), 88.0);
        assert_eq!(store.interpolate(table, "V6", 35.0).unwrap(), 86.0);
        assert_eq!(store.interpolate(table, "VE", 75.0).unwrap(), 25.0);
    }

    #[test]
    fn test_builtin_curves_are_monotonic_non_increasing() {
        let store = LookupTableStore::with_builtin_seed().unwrap();
        for method in [AssessmentMethod::StandReduction, AssessmentMethod::HailDamage] {
            for condition in store.conditions(method.table_name()) {
                let curve = store.curve(method.table_name(), condition).unwrap();
                for pair in curve.points().windows(2) {
                    assert!(pair[0].1 >= pair[1].1, "{} {} not monotonic", method, condition);
                }
            }
        }
    }
}
