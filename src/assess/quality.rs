//! Advisory sampling-quality checks
//!
//! Flags never block completion; they are attached to the frozen result so a
//! reviewer can see why a figure may need a second look.

use super::aggregate::SampleStress;
use crate::model::{FlagSeverity, QualityFlag};

pub const MIN_SAMPLES: usize = 3;
const UNIFORM_CV: f64 = 0.05;
const UNIFORM_MIN_SAMPLES: usize = 5;
const HIGH_CV: f64 = 0.40;
const OUTLIER_Z: f64 = 2.5;
/// One sample per two hectares.
pub const MIN_SAMPLES_PER_HECTARE: f64 = 0.5;

pub fn check_samples(per_sample: &[SampleStress]) -> Vec<QualityFlag> {
    let mut flags = Vec::new();

    if per_sample.len() < MIN_SAMPLES {
        flags.push(QualityFlag {
            check: "insufficient_samples".to_string(),
            severity: FlagSeverity::Fail,
            message: format!(
                "Insufficient samples ({}). Minimum recommended is {}.",
                per_sample.len(),
                MIN_SAMPLES
            ),
            sample_number: None,
        });
        return flags;
    }

    let n = per_sample.len() as f64;
    let mean = per_sample.iter().map(|s| s.stress_pct).sum::<f64>() / n;
    if mean == 0.0 {
        return flags;
    }
    let variance = per_sample
        .iter()
        .map(|s| (s.stress_pct - mean).powi(2))
        .sum::<f64>()
        / n;
    let std_dev = variance.sqrt();
    let cv = std_dev / mean;

    if cv < UNIFORM_CV && per_sample.len() > UNIFORM_MIN_SAMPLES {
        flags.push(QualityFlag {
            check: "suspiciously_uniform".to_string(),
            severity: FlagSeverity::Warning,
            message: format!("Samples are unusually uniform (CV {:.1}%).", cv * 100.0),
            sample_number: None,
        });
    }
    if cv > HIGH_CV {
        flags.push(QualityFlag {
            check: "high_variance".to_string(),
            severity: FlagSeverity::Warning,
            message: format!("High variance across samples (CV {:.0}%). Verify damaged patches.", cv * 100.0),
            sample_number: None,
        });
    }

    if std_dev > 0.0 {
        for sample in per_sample {
            let z = (sample.stress_pct - mean).abs() / std_dev;
            if z > OUTLIER_Z {
                flags.push(QualityFlag {
                    check: "outlier".to_string(),
                    severity: FlagSeverity::Fail,
                    message: format!(
                        "Sample #{} is a statistical outlier (z={:.1}, stress {:.1}%).",
                        sample.sample_number, z, sample.stress_pct
                    ),
                    sample_number: Some(sample.sample_number),
                });
            }
        }
    }

    flags
}

/// Warn when fewer samples were taken than the field's area calls for.
/// Sessions already below `MIN_SAMPLES` carry the stronger flag instead.
pub fn check_density(sample_count: usize, area_hectares: f64) -> Option<QualityFlag> {
    if sample_count < MIN_SAMPLES || !area_hectares.is_finite() || area_hectares <= 0.0 {
        return None;
    }
    let density = sample_count as f64 / area_hectares;
    if density >= MIN_SAMPLES_PER_HECTARE {
        return None;
    }
    let required = (area_hectares * MIN_SAMPLES_PER_HECTARE).ceil() as usize;
    Some(QualityFlag {
        check: "low_sampling_density".to_string(),
        severity: FlagSeverity::Warning,
        message: format!(
            "Sampling density low ({} for {}ha). Recommended: {} points.",
            sample_count, area_hectares, required
        ),
        sample_number: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stresses(values: &[f64]) -> Vec<SampleStress> {
        values
            .iter()
            .enumerate()
            .map(|(i, v)| SampleStress {
                sample_number: i as u32 + 1,
                stress_pct: *v,
            })
            .collect()
    }

    fn checks(flags: &[QualityFlag]) -> Vec<&str> {
        flags.iter().map(|f| f.check.as_str()).collect()
    }

    #[test]
    fn test_too_few_samples() {
        let flags = check_samples(&stresses(&[10.0, 20.0]));
        assert_eq!(checks(&flags), vec!["insufficient_samples"]);
    }

    #[test]
    fn test_consistent_samples_have_no_flags() {
        let flags = check_samples(&stresses(&[20.0, 25.0, 22.0, 18.0]));
        assert!(flags.is_empty(), "{:?}", flags);
    }

    #[test]
    fn test_uniform_samples_flagged() {
        let flags = check_samples(&stresses(&[20.0, 20.1, 20.0, 19.9, 20.0, 20.1]));
        assert_eq!(checks(&flags), vec!["suspiciously_uniform"]);
    }

    #[test]
    fn test_outlier_flagged_with_sample_number() {
        let mut values = vec![10.0; 11];
        values.push(90.0);
        let flags = check_samples(&stresses(&values));
        let outlier = flags.iter().find(|f| f.check == "outlier").unwrap();
        assert_eq!(outlier.sample_number, Some(12));
        assert!(checks(&flags).contains(&"high_variance"));
    }

    #[test]
    fn test_density_against_field_area() {
        let flag = check_density(3, 10.0).unwrap();
        assert_eq!(flag.check, "low_sampling_density");
        assert_eq!(flag.severity, FlagSeverity::Warning);
        assert!(flag.message.contains("Recommended: 5 points"));

        assert!(check_density(5, 10.0).is_none());
        assert!(check_density(2, 100.0).is_none());
        assert!(check_density(3, 0.0).is_none());
    }

    #[test]
    fn test_zero_stress_field_is_not_flagged() {
        assert!(check_samples(&stresses(&[0.0, 0.0, 0.0])).is_empty());
    }
}
