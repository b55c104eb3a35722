use evidence_vault::config::StorageKind;
use evidence_vault::storage::{stream_from_bytes, PutOptions};
use evidence_vault::UploadRequest;

use crate::common::{chunked, Harness};

async fn locators(harness: &Harness) -> Vec<String> {
    harness
        .engine
        .storage()
        .list()
        .await
        .expect("list")
        .into_iter()
        .map(|object| object.locator)
        .collect()
}

#[tokio::test]
async fn test_sweep_reclaims_orphans_and_is_idempotent() {
    for kind in [StorageKind::Local, StorageKind::Memory] {
        let harness = Harness::with_settings(kind, |settings| {
            settings.reconcile.grace_secs = 0;
        });
        let evidence = harness
            .engine
            .coordinator()
            .upload(
                UploadRequest::new("u1", "kept.txt", "text/plain"),
                chunked(b"tracked", 3),
            )
            .await
            .expect("upload");
        harness
            .engine
            .storage()
            .put(
                "u1/unlinked/ghost_orphan.txt",
                stream_from_bytes(b"orphan".to_vec()),
                PutOptions::new(1024),
            )
            .await
            .expect("orphan write");

        let sweep = harness.engine.reconciler();
        let first = sweep.sweep(false).await.expect("first sweep");
        assert_eq!(first.orphans_removed, 1);
        assert!(first.dangling_records.is_empty());
        assert_eq!(locators(&harness).await, vec![evidence.storage_path.clone()]);

        let before = locators(&harness).await;
        let second = sweep.sweep(false).await.expect("second sweep");
        assert!(second.is_clean(), "second sweep changed something: {:?}", second);
        assert_eq!(locators(&harness).await, before);
    }
}
