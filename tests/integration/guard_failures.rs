use std::sync::atomic::Ordering;
use std::time::Duration;

use evidence_vault::config::StorageKind;
use evidence_vault::guard::BreakerState;
use evidence_vault::{EvidenceError, EvidenceFilter, UploadRequest};

use crate::common::{chunked, Harness};

fn case_upload() -> UploadRequest {
    UploadRequest::new("u1", "trace.log", "text/plain").with_case("c1")
}

#[tokio::test]
async fn test_case_service_down_blocks_upload_without_side_effects() {
    for kind in [StorageKind::Local, StorageKind::Memory] {
        let harness = Harness::new(kind);
        harness.directory.grant("u1", "c1");
        harness.directory.set_case_reachable(false);

        let err = harness
            .engine
            .coordinator()
            .upload(case_upload(), chunked(b"payload", 3))
            .await
            .err()
            .expect("upload must fail closed");

        assert!(err.is_denial(), "unexpected error {:?}", err);
        assert!(harness.engine.storage().list().await.expect("list").is_empty());
        assert!(harness
            .engine
            .repository()
            .list_evidence(&EvidenceFilter::default())
            .expect("rows")
            .is_empty());
        assert_eq!(harness.engine.repository().outbox_stats().expect("stats").pending, 0);
    }
}

#[tokio::test]
async fn test_breaker_short_circuits_then_recovers() {
    let harness = Harness::with_settings(StorageKind::Memory, |settings| {
        settings.breaker.cooldown_ms = 50;
    });
    harness.directory.grant("u1", "c1");
    harness.directory.set_case_reachable(false);
    let coordinator = harness.engine.coordinator();

    for _ in 0..2 {
        let err = coordinator
            .upload(case_upload(), chunked(b"x", 1))
            .await
            .err()
            .expect("failure");
        assert!(matches!(err, EvidenceError::DependencyUnavailable { .. }));
    }
    let breaker = &harness.engine.guard().breakers().case;
    assert_eq!(breaker.state(), BreakerState::Open);

    let err = coordinator
        .upload(case_upload(), chunked(b"x", 1))
        .await
        .err()
        .expect("short circuit");
    assert!(err.is_denial());
    assert_eq!(harness.directory.case_calls.load(Ordering::SeqCst), 2);

    tokio::time::sleep(Duration::from_millis(80)).await;
    harness.directory.set_case_reachable(true);

    coordinator
        .upload(case_upload(), chunked(b"x", 1))
        .await
        .expect("probe succeeds");
    assert_eq!(breaker.state(), BreakerState::Closed);
    assert_eq!(breaker.snapshot().consecutive_failures, 0);
}

#[tokio::test]
async fn test_explicit_denial_is_forbidden_and_keeps_breaker_closed() {
    let harness = Harness::new(StorageKind::Local);

    let err = harness
        .engine
        .coordinator()
        .upload(case_upload(), chunked(b"x", 1))
        .await
        .err()
        .expect("denied");

    assert!(matches!(err, EvidenceError::Forbidden(_)));
    assert_eq!(
        harness.engine.guard().breakers().case.state(),
        BreakerState::Closed
    );
}
