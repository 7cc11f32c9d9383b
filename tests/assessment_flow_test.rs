//! End-to-end assessment flow: claim -> session -> samples -> frozen result

use std::sync::Arc;

use chrono::Utc;
use uuid::Uuid;

use verisca_sync::assess::{HailDamageMeasurement, StandReductionMeasurement};
use verisca_sync::lookup::{LookupSource, LookupTableEntry, LookupTableStore};
use verisca_sync::model::{AssessmentMethod, Claim, ClaimStatus, PerilType, SessionStatus};
use verisca_sync::{Error, FieldClient, LocalStore, NewSample};

fn claim() -> Claim {
    Claim {
        id: Uuid::new_v4(),
        claim_number: "CLM-2024-0007".into(),
        tenant_id: Uuid::new_v4(),
        farm_id: Uuid::new_v4(),
        field_id: Uuid::new_v4(),
        peril_type: PerilType::Drought,
        date_of_loss: Utc::now(),
        assigned_assessor_id: None,
        status: ClaimStatus::Assigned,
        updated_at: Utc::now(),
    }
}

/// Three-point stand reduction curve for V6: 0 -> 100, 50 -> 70, 100 -> 0
fn v6_table() -> LookupTableStore {
    let mut store = LookupTableStore::new();
    store
        .extend([(0.0, 100.0), (50.0, 70.0), (100.0, 0.0)].map(|(input, output)| LookupTableEntry {
            table_name: "stand_reduction_potential".into(),
            input_value: input,
            condition: "V6".into(),
            output_value: output,
        }))
        .unwrap();
    store
}

fn stand(original: f64, destroyed: f64) -> NewSample {
    NewSample::new(
        StandReductionMeasurement {
            original_stand_count: original,
            destroyed_plant_count: destroyed,
        }
        .into_map(),
    )
}

fn setup(lookup: LookupTableStore) -> (FieldClient, Claim) {
    let store = Arc::new(LocalStore::open_in_memory().unwrap());
    let claim = claim();
    store.upsert_claim(&claim).unwrap();
    (FieldClient::new(store, Arc::new(lookup), Uuid::new_v4()), claim)
}

#[test]
fn test_interpolation_reference_points() {
    let table = v6_table();
    let at = |x: f64| table.interpolate("stand_reduction_potential", "V6", x).unwrap();

    assert_eq!(at(25.0), 85.0);
    assert_eq!(at(50.0), 70.0);
    assert_eq!(at(150.0), 0.0);
    assert_eq!(at(-10.0), 100.0);
    assert!(matches!(
        table.interpolate("stand_reduction_potential", "V12", 10.0),
        Err(Error::UnknownCondition { .. })
    ));
}

#[test]
fn test_thirty_percent_stand_loss() {
    let (client, claim) = setup(v6_table());
    let mut handle = client
        .start_session(claim.id, AssessmentMethod::StandReduction, Some("V6"))
        .unwrap();
    for _ in 0..3 {
        client.add_sample(&mut handle, stand(30.0, 9.0)).unwrap();
    }

    let result = client.complete_session(&mut handle).unwrap();
    assert_eq!(result.average_potential_yield_pct, 82.0);
    assert_eq!(result.loss_percentage, 18.0);
    assert_eq!(result.sample_count, 3);
    assert_eq!(handle.status(), SessionStatus::Completed);
    assert!(handle.session().date_completed.is_some());

    let stored_claim = client.store().claim(claim.id).unwrap().unwrap();
    assert_eq!(stored_claim.status, ClaimStatus::Completed);
}

#[test]
fn test_aggregation_is_order_independent() {
    let destroyed = [2.0, 7.0, 4.0, 0.0, 5.0];

    let run = |order: &[usize]| {
        let (client, claim) = setup(v6_table());
        let mut handle = client
            .start_session(claim.id, AssessmentMethod::StandReduction, Some("V6"))
            .unwrap();
        for &i in order {
            let sample = NewSample {
                sample_number: Some(i as u32 + 1),
                ..stand(30.0, destroyed[i])
            };
            client.add_sample(&mut handle, sample).unwrap();
        }
        client.complete_session(&mut handle).unwrap()
    };

    let forward = run(&[0, 1, 2, 3, 4]);
    let shuffled = run(&[3, 0, 4, 2, 1]);
    assert_eq!(forward, shuffled);
}

#[test]
fn test_sample_numbers_unique_within_session() {
    let (client, claim) = setup(v6_table());
    let mut handle = client
        .start_session(claim.id, AssessmentMethod::StandReduction, Some("V6"))
        .unwrap();

    let numbered = |n| NewSample {
        sample_number: Some(n),
        ..stand(30.0, 3.0)
    };
    client.add_sample(&mut handle, numbered(1)).unwrap();
    client.add_sample(&mut handle, numbered(3)).unwrap();
    assert!(matches!(
        client.add_sample(&mut handle, numbered(3)),
        Err(Error::DuplicateSampleNumber { sample_number: 3, .. })
    ));

    let reopened = client.open_session(handle.id()).unwrap();
    let numbers: Vec<u32> = reopened.samples().iter().map(|s| s.sample_number).collect();
    assert_eq!(numbers, vec![1, 3]);
}

#[test]
fn test_completed_session_rejects_further_work() {
    let (client, claim) = setup(v6_table());
    let mut handle = client
        .start_session(claim.id, AssessmentMethod::StandReduction, Some("V6"))
        .unwrap();
    client.add_sample(&mut handle, stand(30.0, 9.0)).unwrap();
    let result = client.complete_session(&mut handle).unwrap();
    let queued = client.store().pending_count().unwrap();

    assert!(matches!(
        client.add_sample(&mut handle, stand(30.0, 30.0)),
        Err(Error::SessionLocked { .. })
    ));
    assert!(matches!(
        client.complete_session(&mut handle),
        Err(Error::InvalidStateTransition { .. })
    ));

    let reopened = client.open_session(handle.id()).unwrap();
    assert_eq!(reopened.result(), Some(&result));
    assert_eq!(reopened.samples().len(), 1);
    assert_eq!(client.store().pending_count().unwrap(), queued);
}

#[test]
fn test_missing_curve_blocks_completion() {
    let (client, claim) = setup(v6_table());
    let mut handle = client
        .start_session(claim.id, AssessmentMethod::StandReduction, Some("V12"))
        .unwrap();
    client.add_sample(&mut handle, stand(30.0, 9.0)).unwrap();

    assert!(matches!(
        client.complete_session(&mut handle),
        Err(Error::UnknownCondition { .. })
    ));
    assert_eq!(handle.status(), SessionStatus::InProgress);
    assert!(handle.result().is_none());
}

#[test]
fn test_hail_damage_with_builtin_curves() {
    let (client, claim) = setup(LookupTableStore::with_builtin_seed().unwrap());
    let mut handle = client
        .start_session(claim.id, AssessmentMethod::HailDamage, Some("V11"))
        .unwrap();

    // 25% stand reduction and 20% direct damage compound to 40% stress.
    for _ in 0..3 {
        let sample = NewSample::new(
            HailDamageMeasurement {
                stand: StandReductionMeasurement {
                    original_stand_count: 20.0,
                    destroyed_plant_count: 5.0,
                },
                direct_damage_pct: 20.0,
            }
            .into_map(),
        );
        client.add_sample(&mut handle, sample).unwrap();
    }

    let result = client.complete_session(&mut handle).unwrap();
    let breakdown = result.breakdown.unwrap();
    assert!((breakdown.stress_pct - 40.0).abs() < 1e-9);
    assert_eq!(breakdown.table_used, "hail_damage_potential");
    // V11 curve: 10 -> 91, 50 -> 50; at 40 -> 60.25
    assert_eq!(result.average_potential_yield_pct, 60.25);
    assert_eq!(result.loss_percentage, 39.75);
}

#[test]
fn test_measurement_validation_names_key() {
    let (client, claim) = setup(v6_table());
    let mut handle = client
        .start_session(claim.id, AssessmentMethod::StandReduction, Some("V6"))
        .unwrap();

    let err = client.add_sample(&mut handle, stand(0.0, 1.0)).unwrap_err();
    match err {
        Error::InvalidMeasurement { key, sample_number, .. } => {
            assert_eq!(key, "original_stand_count");
            assert_eq!(sample_number, 1);
        }
        other => panic!("unexpected error: {other}"),
    }
}
