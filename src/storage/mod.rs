//! Content storage backends.
//!
//! A backend only knows locators and bytes. Metadata and events live in
//! [`crate::metadata`]; the [`crate::coordinator`] keeps the two consistent.
//!
//! Every backend honors the same contract:
//! - `put` either commits the full object with the expected size or leaves
//!   nothing behind (including when the caller drops the future mid-stream).
//! - `get` on a missing locator fails with `NotFound`.
//! - `delete` on a missing locator reports [`DeleteOutcome::NotFound`].

pub mod local;
pub mod memory;
pub mod object_store;
pub mod s3;

use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{self, BoxStream, StreamExt};
use sha2::{Digest, Sha256};

use crate::config::{StorageKind, StorageSettings};
use crate::error::{EvidenceError, EvidenceResult};

pub use local::LocalBackend;
pub use memory::MemoryObjectClient;
pub use object_store::{CompletedPart, ObjectClient, ObjectInfo, ObjectStoreBackend};
pub use s3::{S3Client, S3Credentials};

/// Chunk size used when turning in-memory buffers and files into streams.
pub const STREAM_CHUNK_SIZE: usize = 64 * 1024;

/// Byte stream flowing into or out of a backend.
pub type ByteStream = BoxStream<'static, io::Result<Vec<u8>>>;

/// Wrap an in-memory buffer as a chunked [`ByteStream`].
pub fn stream_from_bytes(data: Vec<u8>) -> ByteStream {
    let chunks: Vec<io::Result<Vec<u8>>> = data
        .chunks(STREAM_CHUNK_SIZE)
        .map(|chunk| Ok(chunk.to_vec()))
        .collect();
    stream::iter(chunks).boxed()
}

/// Drain a [`ByteStream`] into memory.
pub async fn collect_stream(mut stream: ByteStream) -> io::Result<Vec<u8>> {
    let mut data = Vec::new();
    while let Some(chunk) = stream.next().await {
        data.extend_from_slice(&chunk?);
    }
    Ok(data)
}

/// Limits applied to a single `put`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PutOptions {
    /// Size the caller declared, if any.
    pub expected_size: Option<u64>,
    /// Hard upper bound; the write aborts as soon as it is crossed.
    pub max_size: u64,
}

impl PutOptions {
    pub fn new(max_size: u64) -> Self {
        Self {
            expected_size: None,
            max_size,
        }
    }

    pub fn with_expected_size(mut self, size: Option<u64>) -> Self {
        self.expected_size = size;
        self
    }
}

/// What a successful `put` committed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PutReceipt {
    pub committed_size: u64,
    pub checksum_sha256: String,
}

/// Result of an idempotent delete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted,
    NotFound,
}

/// An object found while listing a backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject {
    pub locator: String,
    pub size: u64,
    pub last_modified: DateTime<Utc>,
}

/// Capability set shared by the local filesystem and object store backends.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Short backend name for logs.
    fn kind(&self) -> &'static str;

    async fn put(
        &self,
        locator: &str,
        body: ByteStream,
        options: PutOptions,
    ) -> EvidenceResult<PutReceipt>;

    async fn get(&self, locator: &str) -> EvidenceResult<ByteStream>;

    async fn exists(&self, locator: &str) -> EvidenceResult<bool>;

    async fn delete(&self, locator: &str) -> EvidenceResult<DeleteOutcome>;

    /// Every committed object, used by the reconciliation sweep.
    async fn list(&self) -> EvidenceResult<Vec<StoredObject>>;

    /// Remove abandoned partial writes older than `older_than`.
    async fn sweep_staging(&self, _older_than: DateTime<Utc>) -> EvidenceResult<usize> {
        Ok(0)
    }

    async fn health_check(&self) -> bool;
}

/// Running size/checksum accounting for a streamed write.
#[derive(Debug)]
pub(crate) struct WriteTally {
    limit: u64,
    written: u64,
    hasher: Sha256,
}

impl WriteTally {
    pub(crate) fn new(limit: u64) -> Self {
        Self {
            limit,
            written: 0,
            hasher: Sha256::new(),
        }
    }

    /// Account for one chunk; fails once the limit is crossed.
    pub(crate) fn observe(&mut self, chunk: &[u8]) -> EvidenceResult<()> {
        self.written = self.written.saturating_add(chunk.len() as u64);
        if self.written > self.limit {
            return Err(EvidenceError::SizeLimitExceeded { limit: self.limit });
        }
        self.hasher.update(chunk);
        Ok(())
    }

    /// Close the tally, checking the declared size.
    pub(crate) fn finish(self, expected: Option<u64>) -> EvidenceResult<PutReceipt> {
        if let Some(expected) = expected {
            if expected != self.written {
                return Err(EvidenceError::Corruption {
                    expected,
                    actual: self.written,
                });
            }
        }
        Ok(PutReceipt {
            committed_size: self.written,
            checksum_sha256: hex::encode(self.hasher.finalize()),
        })
    }
}

/// Build the backend selected in settings.
pub fn build_backend(settings: &StorageSettings) -> EvidenceResult<Arc<dyn StorageBackend>> {
    match settings.kind {
        StorageKind::Local => Ok(Arc::new(LocalBackend::new(&settings.local_root)?)),
        StorageKind::Memory => Ok(Arc::new(ObjectStoreBackend::new(
            Arc::new(MemoryObjectClient::new()),
            settings.object_prefix.clone(),
        ))),
        StorageKind::S3 => {
            let client = S3Client::from_settings(&settings.s3)?;
            Ok(Arc::new(
                ObjectStoreBackend::new(Arc::new(client), settings.object_prefix.clone())
                    .with_multipart_threshold(settings.s3.multipart_threshold_bytes)
                    .with_part_size(settings.s3.part_size_bytes),
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tally_rejects_oversize() {
        let mut tally = WriteTally::new(4);
        tally.observe(b"abc").expect("within limit");
        let err = tally.observe(b"de").unwrap_err();
        assert!(matches!(err, EvidenceError::SizeLimitExceeded { limit: 4 }));
    }

    #[test]
    fn test_tally_detects_declared_size_mismatch() {
        let mut tally = WriteTally::new(100);
        tally.observe(b"hello").expect("observe");
        let err = tally.finish(Some(6)).unwrap_err();
        assert!(matches!(
            err,
            EvidenceError::Corruption {
                expected: 6,
                actual: 5
            }
        ));
    }

    #[test]
    fn test_tally_checksum() {
        let mut tally = WriteTally::new(100);
        tally.observe(b"abc").expect("observe");
        let receipt = tally.finish(Some(3)).expect("finish");
        assert_eq!(receipt.committed_size, 3);
        assert_eq!(
            receipt.checksum_sha256,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[tokio::test]
    async fn test_stream_round_trip_preserves_bytes() {
        let data: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        let collected = collect_stream(stream_from_bytes(data.clone()))
            .await
            .expect("collect");
        assert_eq!(collected, data);
    }
}
