use serde_json::json;

use evidence_vault::config::StorageKind;
use evidence_vault::inbox::{InboundEvent, InboxOutcome, CASE_DELETED};
use evidence_vault::outbox::EVIDENCE_DELETED;
use evidence_vault::{EvidenceFilter, UploadRequest};

use crate::common::{chunked, Harness};

#[tokio::test]
async fn test_duplicate_case_deleted_cascades_once() {
    let harness = Harness::new(StorageKind::Local);
    harness.directory.grant("u1", "c1");
    harness.directory.grant("u1", "c2");
    let coordinator = harness.engine.coordinator();

    let mut in_c1 = Vec::new();
    for name in ["a.log", "b.log"] {
        let evidence = coordinator
            .upload(
                UploadRequest::new("u1", name, "text/plain").with_case("c1"),
                chunked(b"line\n", 2),
            )
            .await
            .expect("upload");
        in_c1.push(evidence);
    }
    let survivor = coordinator
        .upload(
            UploadRequest::new("u1", "c.log", "text/plain").with_case("c2"),
            chunked(b"line\n", 2),
        )
        .await
        .expect("upload");

    let event = InboundEvent::new("case-evt-1", CASE_DELETED, json!({ "case_id": "c1" }));
    let inbox = harness.engine.inbox();
    assert_eq!(
        inbox.consume(&event).expect("first delivery"),
        InboxOutcome::Processed { affected: 2 }
    );
    assert_eq!(
        inbox.consume(&event).expect("second delivery"),
        InboxOutcome::Duplicate
    );

    let repo = harness.engine.repository();
    assert!(repo.inbox_record("case-evt-1").expect("inbox").is_some());
    let live = repo.list_evidence(&EvidenceFilter::default()).expect("rows");
    assert_eq!(live.len(), 1);
    assert_eq!(live[0].evidence_id, survivor.evidence_id);

    for evidence in &in_c1 {
        let deletions: Vec<_> = repo
            .events_for_aggregate(&evidence.evidence_id)
            .expect("events")
            .into_iter()
            .filter(|event| event.event_name == EVIDENCE_DELETED)
            .collect();
        assert_eq!(deletions.len(), 1, "exactly one deletion event per row");
    }

    let purged = harness.engine.reaper().purge_once().await.expect("purge");
    assert_eq!(purged.purged, 2);
    for evidence in &in_c1 {
        assert!(!harness
            .engine
            .storage()
            .exists(&evidence.storage_path)
            .await
            .expect("exists"));
    }
    assert!(harness
        .engine
        .storage()
        .exists(&survivor.storage_path)
        .await
        .expect("exists"));
}
