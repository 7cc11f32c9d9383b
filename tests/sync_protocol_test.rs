//! Sync protocol tests: a field client and an in-process server

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use verisca_sync::assess::StandReductionMeasurement;
use verisca_sync::config::SyncConfig;
use verisca_sync::model::{AssessmentMethod, Claim, ClaimStatus, Farm, Field, PerilType, SessionStatus};
use verisca_sync::sync::{
    LoopbackTransport, PullOutcome, PushFailureReason, PushOutcome, PushStatus, SamplePayload, SessionPayload,
    SyncDownResponse, SyncTransport, SyncUpRequest, SyncUpResponse,
};
use verisca_sync::{
    AssessorIdentity, FieldClient, LocalStore, LookupTableStore, NewSample, ServerStore, SessionHandle, SyncCoordinator,
    SyncError, SyncServer,
};

struct Harness {
    server: SyncServer,
    identity: AssessorIdentity,
    claim: Claim,
    transport: Arc<LoopbackTransport>,
    client: FieldClient,
    coordinator: SyncCoordinator,
}

fn sync_config(max_batch: usize) -> SyncConfig {
    SyncConfig {
        sync_interval_ms: 60_000,
        request_timeout_ms: 2_000,
        max_batch,
    }
}

fn seed_server(store: &ServerStore, identity: &AssessorIdentity) -> Claim {
    let farm = store
        .upsert_farm(&Farm {
            id: Uuid::new_v4(),
            farm_code: "FRM-001".into(),
            farm_name: "Kamau Farm".into(),
            farmer_name: Some("J. Kamau".into()),
            farm_location: Some("POINT(36.82 -1.28)".into()),
            updated_at: Utc::now(),
        })
        .unwrap();
    let field = store
        .upsert_field(&Field {
            id: Uuid::new_v4(),
            farm_id: farm.id,
            field_code: "F-01".into(),
            field_name: "North block".into(),
            area_hectares: Some(4.2),
            field_boundary: None,
            updated_at: Utc::now(),
        })
        .unwrap();
    store
        .upsert_claim(&Claim {
            id: Uuid::new_v4(),
            claim_number: "CLM-2024-0042".into(),
            tenant_id: identity.tenant_id,
            farm_id: farm.id,
            field_id: field.id,
            peril_type: PerilType::Drought,
            date_of_loss: Utc::now(),
            assigned_assessor_id: Some(identity.assessor_id),
            status: ClaimStatus::Assigned,
            updated_at: Utc::now(),
        })
        .unwrap()
}

fn harness(max_batch: usize) -> Harness {
    let server_store = Arc::new(ServerStore::open_in_memory().unwrap());
    let identity = AssessorIdentity {
        assessor_id: Uuid::new_v4(),
        tenant_id: Uuid::new_v4(),
    };
    let claim = seed_server(&server_store, &identity);
    let server = SyncServer::new(server_store);

    let local = Arc::new(LocalStore::open_in_memory().unwrap());
    let transport = Arc::new(LoopbackTransport::new(server.clone(), identity));
    let client = FieldClient::new(
        local.clone(),
        Arc::new(LookupTableStore::with_builtin_seed().unwrap()),
        identity.assessor_id,
    );
    let coordinator = SyncCoordinator::new(local, transport.clone(), sync_config(max_batch));

    Harness {
        server,
        identity,
        claim,
        transport,
        client,
        coordinator,
    }
}

fn stand(destroyed: f64) -> NewSample {
    NewSample::new(
        StandReductionMeasurement {
            original_stand_count: 30.0,
            destroyed_plant_count: destroyed,
        }
        .into_map(),
    )
}

fn pushed(outcome: PushOutcome) -> verisca_sync::sync::PushReport {
    match outcome {
        PushOutcome::Pushed(report) => report,
        PushOutcome::Deferred => panic!("push was deferred"),
    }
}

/// Pull the claim down and record a completed three-sample session offline.
async fn completed_session(h: &Harness) -> SessionHandle {
    h.coordinator.pull().await.unwrap();
    let mut handle = h
        .client
        .start_session(h.claim.id, AssessmentMethod::StandReduction, Some("V4"))
        .unwrap();
    for _ in 0..3 {
        h.client.add_sample(&mut handle, stand(9.0)).unwrap();
    }
    h.client.complete_session(&mut handle).unwrap();
    handle
}

#[tokio::test]
async fn test_full_pull_then_offline_session_syncs() {
    let h = harness(200);

    let PullOutcome::Pulled(report) = h.coordinator.pull().await.unwrap() else {
        panic!("pull deferred");
    };
    assert_eq!((report.claims, report.farms, report.fields), (1, 1, 1));
    assert!(h.client.store().farm(h.claim.farm_id).unwrap().is_some());
    assert!(h.client.store().field(h.claim.field_id).unwrap().is_some());

    let handle = completed_session(&h).await;
    assert!(h.client.store().pending_count().unwrap() > 0);

    let report = pushed(h.coordinator.push().await.unwrap());
    assert!(report.failed.is_empty(), "{:?}", report.failed);
    assert_eq!(report.sessions, vec![handle.id()]);
    assert_eq!(report.samples.len(), 3);
    assert_eq!(report.remaining, 0);

    let local = h.client.open_session(handle.id()).unwrap();
    assert_eq!(local.status(), SessionStatus::Synced);

    let remote = h.server.store().session(handle.id()).unwrap().unwrap();
    assert_eq!(remote.status, SessionStatus::Synced);
    assert_eq!(remote.calculated_result.unwrap().loss_percentage, 18.0);
    assert_eq!(remote.assessor_id, h.identity.assessor_id);
    assert_eq!(h.server.store().samples_for_session(handle.id()).unwrap().len(), 3);
    assert_eq!(
        h.server.store().claim(h.claim.id).unwrap().unwrap().status,
        ClaimStatus::Completed
    );
}

#[tokio::test]
async fn test_repeated_push_is_idempotent() {
    let h = harness(200);
    let handle = completed_session(&h).await;

    let request = SyncUpRequest {
        sessions: vec![SessionPayload::from(handle.session())],
        samples: handle.samples().iter().map(SamplePayload::from).collect(),
    };

    let first = h.server.push(&h.identity, request.clone());
    let session_after_first = h.server.store().session(handle.id()).unwrap();
    let samples_after_first = h.server.store().samples_for_session(handle.id()).unwrap();

    let second = h.server.push(&h.identity, request);
    assert_eq!(first, second);
    assert_eq!(second.status, PushStatus::Success);
    assert_eq!(h.server.store().session(handle.id()).unwrap(), session_after_first);
    assert_eq!(
        h.server.store().samples_for_session(handle.id()).unwrap(),
        samples_after_first
    );
}

#[tokio::test]
async fn test_partial_push_keeps_failed_item_queued() {
    let h = harness(200);
    let handle = completed_session(&h).await;

    // A session recorded against a claim the server has never seen.
    let orphan_claim = Claim {
        id: Uuid::new_v4(),
        ..h.claim.clone()
    };
    h.client.store().upsert_claim(&orphan_claim).unwrap();
    let orphan = h
        .client
        .start_session(orphan_claim.id, AssessmentMethod::StandReduction, Some("V4"))
        .unwrap();

    let report = pushed(h.coordinator.push().await.unwrap());
    assert!(report.sessions.contains(&handle.id()));
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].id, orphan.id());
    assert_eq!(report.failed[0].reason, PushFailureReason::ClaimNotFound);

    let pending = h.client.store().pending().unwrap();
    assert!(!pending.is_empty());
    assert!(pending.iter().all(|m| m.entity_id == orphan.id()));
    assert_eq!(report.remaining, pending.len());

    assert_eq!(
        h.client.open_session(handle.id()).unwrap().status(),
        SessionStatus::Synced
    );
}

#[tokio::test]
async fn test_connectivity_loss_leaves_queue_intact() {
    let h = harness(200);
    completed_session(&h).await;
    let queued = h.client.store().pending().unwrap();

    h.transport.set_online(false);
    let err = h.coordinator.push().await.unwrap_err();
    assert!(matches!(err, SyncError::Connection(_)));
    assert_eq!(h.client.store().pending().unwrap(), queued);

    let cursor_before = h.client.store().cursor().unwrap();
    assert!(h.coordinator.pull().await.is_err());
    assert_eq!(h.client.store().cursor().unwrap(), cursor_before);

    h.transport.set_online(true);
    let report = pushed(h.coordinator.push().await.unwrap());
    assert!(report.failed.is_empty());
    assert_eq!(h.client.store().pending_count().unwrap(), 0);
}

#[tokio::test]
async fn test_incremental_pull_returns_only_changes() {
    let h = harness(200);

    h.coordinator.pull().await.unwrap();
    let first_cursor = h.client.store().cursor().unwrap().unwrap();

    let PullOutcome::Pulled(quiet) = h.coordinator.pull().await.unwrap() else {
        panic!("pull deferred");
    };
    assert_eq!((quiet.claims, quiet.farms, quiet.fields), (0, 0, 0));
    assert!(quiet.cursor > first_cursor);

    let mut renamed = h.server.store().claim(h.claim.id).unwrap().unwrap();
    renamed.claim_number = "CLM-2024-0042-R".into();
    h.server.store().upsert_claim(&renamed).unwrap();

    let PullOutcome::Pulled(changed) = h.coordinator.pull().await.unwrap() else {
        panic!("pull deferred");
    };
    assert_eq!(changed.claims, 1);
    assert_eq!(changed.farms, 0);
    assert_eq!(
        h.client.store().claim(h.claim.id).unwrap().unwrap().claim_number,
        "CLM-2024-0042-R"
    );
}

#[tokio::test]
async fn test_pull_does_not_regress_local_claim() {
    let h = harness(200);
    completed_session(&h).await;
    assert_eq!(
        h.client.store().claim(h.claim.id).unwrap().unwrap().status,
        ClaimStatus::Completed
    );

    // Server still says assigned until the push lands.
    let mut touched = h.server.store().claim(h.claim.id).unwrap().unwrap();
    touched.claim_number = "CLM-2024-0042-B".into();
    h.server.store().upsert_claim(&touched).unwrap();
    h.coordinator.pull().await.unwrap();

    let local = h.client.store().claim(h.claim.id).unwrap().unwrap();
    assert_eq!(local.status, ClaimStatus::Completed);
    assert_eq!(local.claim_number, "CLM-2024-0042-B");
}

#[tokio::test]
async fn test_queue_coalesces_and_respects_batch_size() {
    let h = harness(2);
    let handle = completed_session(&h).await;

    // 1 session + 3 samples after coalescing, two per request
    let report = pushed(h.coordinator.push().await.unwrap());
    assert_eq!(report.requests, 2);
    assert_eq!(h.transport.push_count(), 2);
    assert_eq!(report.sessions, vec![handle.id()]);
    assert_eq!(report.samples.len(), 3);
    assert_eq!(report.remaining, 0);

    let again = pushed(h.coordinator.push().await.unwrap());
    assert_eq!(again.requests, 0);
}

#[tokio::test]
async fn test_pull_for_other_assessor_is_empty() {
    let h = harness(200);
    let stranger = AssessorIdentity {
        assessor_id: Uuid::new_v4(),
        tenant_id: h.identity.tenant_id,
    };
    let response = h.server.pull(&stranger, None).unwrap();
    assert!(response.claims.is_empty());
    assert!(response.farms.is_empty());
}

/// Delays every call so overlapping sync attempts can be observed.
struct SlowTransport {
    inner: Arc<LoopbackTransport>,
    delay: Duration,
}

#[async_trait::async_trait]
impl SyncTransport for SlowTransport {
    async fn pull(&self, since: Option<DateTime<Utc>>) -> Result<SyncDownResponse, SyncError> {
        tokio::time::sleep(self.delay).await;
        self.inner.pull(since).await
    }

    async fn push(&self, request: &SyncUpRequest) -> Result<SyncUpResponse, SyncError> {
        tokio::time::sleep(self.delay).await;
        self.inner.push(request).await
    }
}

#[tokio::test]
async fn test_overlapping_push_is_coalesced() {
    let h = harness(200);
    completed_session(&h).await;

    let slow = Arc::new(SlowTransport {
        inner: h.transport.clone(),
        delay: Duration::from_millis(50),
    });
    let coordinator = SyncCoordinator::new(h.client.store().clone(), slow, sync_config(200));

    let (a, b) = tokio::join!(coordinator.push(), coordinator.push());
    let outcomes = [a.unwrap(), b.unwrap()];
    assert_eq!(
        outcomes.iter().filter(|o| matches!(o, PushOutcome::Deferred)).count(),
        1
    );
    assert_eq!(h.transport.push_count(), 1);
    assert_eq!(h.client.store().pending_count().unwrap(), 0);
}

#[tokio::test]
async fn test_slow_server_times_out_and_keeps_queue() {
    let h = harness(200);
    completed_session(&h).await;
    let queued = h.client.store().pending_count().unwrap();

    let slow = Arc::new(SlowTransport {
        inner: h.transport.clone(),
        delay: Duration::from_millis(500),
    });
    let config = SyncConfig {
        request_timeout_ms: 20,
        ..sync_config(200)
    };
    let coordinator = SyncCoordinator::new(h.client.store().clone(), slow, config);

    let err = coordinator.push().await.unwrap_err();
    assert!(matches!(err, SyncError::Timeout(_)));
    assert_eq!(h.client.store().pending_count().unwrap(), queued);
    assert_eq!(h.transport.push_count(), 0);
}

#[tokio::test]
async fn test_background_loop_syncs_on_trigger_and_stops() {
    let h = harness(200);
    completed_session(&h).await;

    let Harness {
        coordinator, client, ..
    } = h;
    let coordinator = Arc::new(coordinator);
    let (trigger_tx, trigger_rx) = tokio::sync::mpsc::channel(4);
    let task = tokio::spawn(coordinator.clone().run(trigger_rx));

    trigger_tx.send(verisca_sync::sync::SyncTrigger::Push).await.unwrap();
    for _ in 0..100 {
        if client.store().pending_count().unwrap() == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(client.store().pending_count().unwrap(), 0);

    drop(trigger_tx);
    tokio::time::timeout(Duration::from_secs(2), task)
        .await
        .expect("loop did not stop")
        .unwrap();
}

#[tokio::test]
async fn test_newly_assigned_claim_brings_its_farm_and_field() {
    let h = harness(200);
    h.coordinator.pull().await.unwrap();

    // Reference data created before any claim points at it.
    let store = h.server.store();
    let farm = store
        .upsert_farm(&Farm {
            id: Uuid::new_v4(),
            farm_code: "FRM-002".into(),
            farm_name: "Otieno Farm".into(),
            farmer_name: None,
            farm_location: None,
            updated_at: Utc::now(),
        })
        .unwrap();
    let field = store
        .upsert_field(&Field {
            id: Uuid::new_v4(),
            farm_id: farm.id,
            field_code: "F-02".into(),
            field_name: "Hill block".into(),
            area_hectares: Some(2.0),
            field_boundary: None,
            updated_at: Utc::now(),
        })
        .unwrap();

    let PullOutcome::Pulled(unrelated) = h.coordinator.pull().await.unwrap() else {
        panic!("pull deferred");
    };
    assert_eq!((unrelated.claims, unrelated.farms, unrelated.fields), (0, 0, 0));

    store
        .upsert_claim(&Claim {
            id: Uuid::new_v4(),
            claim_number: "CLM-2024-0043".into(),
            farm_id: farm.id,
            field_id: field.id,
            ..h.claim.clone()
        })
        .unwrap();

    let PullOutcome::Pulled(assigned) = h.coordinator.pull().await.unwrap() else {
        panic!("pull deferred");
    };
    assert_eq!((assigned.claims, assigned.farms, assigned.fields), (1, 1, 1));
    assert!(h.client.store().farm(farm.id).unwrap().is_some());
    assert!(h.client.store().field(field.id).unwrap().is_some());
}

#[tokio::test]
async fn test_repeated_in_progress_push_is_idempotent() {
    let h = harness(200);
    h.coordinator.pull().await.unwrap();
    let mut handle = h
        .client
        .start_session(h.claim.id, AssessmentMethod::StandReduction, Some("V4"))
        .unwrap();
    h.client.add_sample(&mut handle, stand(9.0)).unwrap();

    let request = SyncUpRequest {
        sessions: vec![SessionPayload::from(handle.session())],
        samples: handle.samples().iter().map(SamplePayload::from).collect(),
    };
    let first = h.server.push(&h.identity, request.clone());
    let stored = h.server.store().session(handle.id()).unwrap().unwrap();
    assert_eq!(stored.status, SessionStatus::InProgress);

    let second = h.server.push(&h.identity, request);
    assert_eq!(first, second);
    assert_eq!(h.server.store().session(handle.id()).unwrap().unwrap(), stored);
    assert_eq!(h.server.store().samples_for_session(handle.id()).unwrap().len(), 1);
}

#[tokio::test]
async fn test_completed_push_without_sample_ids_locks_session() {
    let h = harness(200);
    let handle = completed_session(&h).await;

    let mut payload = SessionPayload::from(handle.session());
    payload.status = None;
    payload.sample_ids.clear();
    let request = SyncUpRequest {
        sessions: vec![payload],
        samples: handle.samples().iter().map(SamplePayload::from).collect(),
    };
    let response = h.server.push(&h.identity, request);
    assert_eq!(response.status, PushStatus::Success);

    let mut late = SamplePayload::from(&handle.samples()[0]);
    late.id = Uuid::new_v4();
    late.sample_number = 9;
    let response = h.server.push(
        &h.identity,
        SyncUpRequest {
            sessions: vec![],
            samples: vec![late.clone()],
        },
    );
    assert_eq!(response.status, PushStatus::Partial);
    assert_eq!(response.failed[0].id, late.id);
    assert_eq!(response.failed[0].reason, PushFailureReason::SessionLocked);
    assert_eq!(h.server.store().samples_for_session(handle.id()).unwrap().len(), 3);
}
