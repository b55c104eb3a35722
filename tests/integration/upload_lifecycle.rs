//! Upload, download, delete and purge through the public API, on both backends.

use evidence_vault::config::StorageKind;
use evidence_vault::outbox::{EVIDENCE_DELETED, EVIDENCE_LINKED, EVIDENCE_UPLOADED};
use evidence_vault::storage::collect_stream;
use evidence_vault::{EvidenceError, EvidenceFilter, EvidenceType, UploadRequest};

use crate::common::{chunked, patterned, Harness};

const TEN_MIB: usize = 10 * 1024 * 1024;

async fn ten_mib_lifecycle(kind: StorageKind) {
    let harness = Harness::new(kind);
    harness.directory.grant("u1", "c1");
    let coordinator = harness.engine.coordinator();
    let data = patterned(TEN_MIB);

    let request = UploadRequest::new("u1", "capture.log", "text/plain")
        .with_case("c1")
        .with_declared_size(TEN_MIB as u64);
    let evidence = coordinator
        .upload(request, chunked(&data, 64 * 1024))
        .await
        .expect("upload");

    assert_eq!(evidence.size_bytes, TEN_MIB as u64);
    assert_eq!(evidence.case_id.as_deref(), Some("c1"));
    assert_eq!(evidence.evidence_type, EvidenceType::Log);

    let (_, stream) = coordinator
        .download(&evidence.evidence_id, "u1")
        .await
        .expect("download");
    let downloaded = collect_stream(stream).await.expect("read back");
    assert_eq!(downloaded.len(), data.len());
    assert!(downloaded == data, "downloaded bytes differ from upload");

    let deleted = coordinator
        .delete(&evidence.evidence_id, "u1")
        .await
        .expect("delete");
    assert!(deleted.deleted);

    let report = harness.engine.reaper().purge_once().await.expect("purge");
    assert_eq!(report.purged, 1);
    assert!(!harness
        .engine
        .storage()
        .exists(&evidence.storage_path)
        .await
        .expect("exists"));

    let err = coordinator
        .download(&evidence.evidence_id, "u1")
        .await
        .err()
        .expect("download after delete must fail");
    assert!(matches!(err, EvidenceError::NotFound(_)));

    assert_eq!(harness.drain_outbox().await, 2);
    assert_eq!(
        harness.publisher.names_for(&evidence.evidence_id),
        vec![EVIDENCE_UPLOADED, EVIDENCE_DELETED]
    );
}

#[tokio::test]
async fn test_ten_mib_lifecycle_local() {
    ten_mib_lifecycle(StorageKind::Local).await;
}

#[tokio::test]
async fn test_ten_mib_lifecycle_object_store() {
    ten_mib_lifecycle(StorageKind::Memory).await;
}

#[tokio::test]
async fn test_oversized_stream_leaves_no_trace() {
    let harness = Harness::with_settings(StorageKind::Local, |settings| {
        settings.upload.max_file_size_mb = 1;
    });

    let err = harness
        .engine
        .coordinator()
        .upload(
            UploadRequest::new("u1", "huge.bin", "application/octet-stream"),
            chunked(&patterned(2 * 1024 * 1024), 128 * 1024),
        )
        .await
        .err()
        .expect("oversized upload must fail");

    assert!(matches!(err, EvidenceError::SizeLimitExceeded { .. }));
    assert!(harness.engine.storage().list().await.expect("list").is_empty());
    assert!(harness
        .engine
        .repository()
        .list_evidence(&EvidenceFilter::default())
        .expect("rows")
        .is_empty());
}

#[tokio::test]
async fn test_link_keeps_object_and_orders_events() {
    let harness = Harness::new(StorageKind::Memory);
    harness.directory.grant("u1", "c7");
    let coordinator = harness.engine.coordinator();

    let evidence = coordinator
        .upload(
            UploadRequest::new("u1", "screen.png", "image/png"),
            chunked(b"not really a png", 4),
        )
        .await
        .expect("upload");
    assert_eq!(evidence.evidence_type, EvidenceType::Screenshot);

    let linked = coordinator
        .link_to_case(&evidence.evidence_id, "u1", "c7")
        .await
        .expect("link");
    assert_eq!(linked.case_id.as_deref(), Some("c7"));

    let (_, stream) = coordinator
        .download(&evidence.evidence_id, "u1")
        .await
        .expect("download");
    assert_eq!(collect_stream(stream).await.expect("read"), b"not really a png");

    let listed = coordinator
        .list("u1", EvidenceFilter::default().with_case("c7"))
        .await
        .expect("list");
    assert_eq!(listed.len(), 1);

    assert_eq!(harness.drain_outbox().await, 2);
    assert_eq!(
        harness.publisher.names_for(&evidence.evidence_id),
        vec![EVIDENCE_UPLOADED, EVIDENCE_LINKED]
    );
}
