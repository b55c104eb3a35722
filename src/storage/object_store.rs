use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use tracing::{debug, error, warn};

use crate::error::{EvidenceError, EvidenceResult};
use crate::storage::{
    ByteStream, DeleteOutcome, PutOptions, PutReceipt, StorageBackend, StoredObject, WriteTally,
};

/// Uploads at or above this size switch to multipart.
pub const DEFAULT_MULTIPART_THRESHOLD: usize = 8 * 1024 * 1024;
/// Size of each multipart part.
pub const DEFAULT_PART_SIZE: usize = 8 * 1024 * 1024;

const HEALTH_KEY: &str = ".health_check";

/// Metadata about a stored object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectInfo {
    pub key: String,
    pub size: u64,
    pub last_modified: DateTime<Utc>,
}

/// A part acknowledged by the object store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedPart {
    pub part_number: u32,
    pub etag: String,
}

/// Minimal object-store API needed by [`ObjectStoreBackend`].
///
/// Objects only become visible once `put_object` or
/// `complete_multipart_upload` returns.
#[async_trait]
pub trait ObjectClient: Send + Sync {
    fn name(&self) -> &'static str;

    async fn put_object(&self, key: &str, body: Vec<u8>) -> EvidenceResult<()>;

    async fn create_multipart_upload(&self, key: &str) -> EvidenceResult<String>;

    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: u32,
        body: Vec<u8>,
    ) -> EvidenceResult<String>;

    async fn complete_multipart_upload(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> EvidenceResult<()>;

    async fn abort_multipart_upload(&self, key: &str, upload_id: &str) -> EvidenceResult<()>;

    /// `None` when the key does not exist.
    async fn get_object(&self, key: &str) -> EvidenceResult<Option<ByteStream>>;

    async fn head_object(&self, key: &str) -> EvidenceResult<Option<ObjectInfo>>;

    async fn delete_object(&self, key: &str) -> EvidenceResult<()>;

    async fn list_objects(&self, prefix: &str) -> EvidenceResult<Vec<ObjectInfo>>;
}

/// In-flight multipart upload; aborted on drop unless completed.
struct MultipartUpload {
    client: Arc<dyn ObjectClient>,
    key: String,
    upload_id: String,
    parts: Vec<CompletedPart>,
    finished: bool,
}

impl MultipartUpload {
    async fn start(client: Arc<dyn ObjectClient>, key: &str) -> EvidenceResult<Self> {
        let upload_id = client.create_multipart_upload(key).await?;
        debug!(key, upload_id = %upload_id, "started multipart upload");
        Ok(Self {
            client,
            key: key.to_string(),
            upload_id,
            parts: Vec::new(),
            finished: false,
        })
    }

    async fn send_part(&mut self, body: Vec<u8>) -> EvidenceResult<()> {
        let part_number = self.parts.len() as u32 + 1;
        let etag = self
            .client
            .upload_part(&self.key, &self.upload_id, part_number, body)
            .await?;
        self.parts.push(CompletedPart { part_number, etag });
        Ok(())
    }

    async fn complete(mut self) -> EvidenceResult<()> {
        self.client
            .complete_multipart_upload(&self.key, &self.upload_id, &self.parts)
            .await?;
        self.finished = true;
        Ok(())
    }
}

impl Drop for MultipartUpload {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!(key = %self.key, upload_id = %self.upload_id, "no runtime to abort multipart upload");
            return;
        };
        let client = Arc::clone(&self.client);
        let key = std::mem::take(&mut self.key);
        let upload_id = std::mem::take(&mut self.upload_id);
        handle.spawn(async move {
            match client.abort_multipart_upload(&key, &upload_id).await {
                Ok(()) => debug!(key = %key, upload_id = %upload_id, "aborted multipart upload"),
                Err(err) => warn!(
                    key = %key,
                    upload_id = %upload_id,
                    error = %err,
                    "failed to abort multipart upload"
                ),
            }
        });
    }
}

/// [`StorageBackend`] over any [`ObjectClient`], with the object key as locator.
#[derive(Clone)]
pub struct ObjectStoreBackend {
    client: Arc<dyn ObjectClient>,
    prefix: String,
    multipart_threshold: usize,
    part_size: usize,
}

impl ObjectStoreBackend {
    pub fn new(client: Arc<dyn ObjectClient>, prefix: impl Into<String>) -> Self {
        Self {
            client,
            prefix: prefix.into().trim_matches('/').to_string(),
            multipart_threshold: DEFAULT_MULTIPART_THRESHOLD,
            part_size: DEFAULT_PART_SIZE,
        }
    }

    pub fn with_multipart_threshold(mut self, bytes: usize) -> Self {
        self.multipart_threshold = bytes.max(1);
        self
    }

    pub fn with_part_size(mut self, bytes: usize) -> Self {
        self.part_size = bytes.max(1);
        self
    }

    fn key_for(&self, locator: &str) -> String {
        if self.prefix.is_empty() {
            locator.to_string()
        } else {
            format!("{}/{}", self.prefix, locator)
        }
    }

    fn locator_for(&self, key: &str) -> Option<String> {
        if self.prefix.is_empty() {
            return Some(key.to_string());
        }
        key.strip_prefix(&self.prefix)
            .and_then(|rest| rest.strip_prefix('/'))
            .map(str::to_string)
    }

    fn list_prefix(&self) -> String {
        if self.prefix.is_empty() {
            String::new()
        } else {
            format!("{}/", self.prefix)
        }
    }
}

#[async_trait]
impl StorageBackend for ObjectStoreBackend {
    fn kind(&self) -> &'static str {
        self.client.name()
    }

    async fn put(
        &self,
        locator: &str,
        mut body: ByteStream,
        options: PutOptions,
    ) -> EvidenceResult<PutReceipt> {
        if locator.is_empty() || locator.split('/').any(|segment| segment == "..") {
            return Err(EvidenceError::InvalidInput(format!(
                "invalid locator: {}",
                locator
            )));
        }
        let key = self.key_for(locator);
        if self.client.head_object(&key).await?.is_some() {
            return Err(EvidenceError::Conflict(format!(
                "locator already exists: {}",
                locator
            )));
        }

        let mut tally = WriteTally::new(options.max_size);
        let mut buffer: Vec<u8> = Vec::new();
        let mut upload: Option<MultipartUpload> = None;

        while let Some(chunk) = body.next().await {
            let chunk = chunk?;
            tally.observe(&chunk)?;
            buffer.extend_from_slice(&chunk);

            if upload.is_none() && buffer.len() >= self.multipart_threshold {
                upload = Some(MultipartUpload::start(Arc::clone(&self.client), &key).await?);
            }
            if let Some(upload) = upload.as_mut() {
                while buffer.len() >= self.part_size {
                    let rest = buffer.split_off(self.part_size);
                    let part = std::mem::replace(&mut buffer, rest);
                    upload.send_part(part).await?;
                }
            }
        }

        let receipt = tally.finish(options.expected_size)?;
        match upload {
            Some(mut upload) => {
                if !buffer.is_empty() || upload.parts.is_empty() {
                    upload.send_part(std::mem::take(&mut buffer)).await?;
                }
                let parts = upload.parts.len();
                upload.complete().await?;
                debug!(locator, parts, size = receipt.committed_size, "completed multipart object");
            }
            None => {
                self.client.put_object(&key, buffer).await?;
                debug!(locator, size = receipt.committed_size, "stored object");
            }
        }
        Ok(receipt)
    }

    async fn get(&self, locator: &str) -> EvidenceResult<ByteStream> {
        self.client
            .get_object(&self.key_for(locator))
            .await?
            .ok_or_else(|| EvidenceError::NotFound(locator.to_string()))
    }

    async fn exists(&self, locator: &str) -> EvidenceResult<bool> {
        Ok(self.client.head_object(&self.key_for(locator)).await?.is_some())
    }

    async fn delete(&self, locator: &str) -> EvidenceResult<DeleteOutcome> {
        let key = self.key_for(locator);
        if self.client.head_object(&key).await?.is_none() {
            return Ok(DeleteOutcome::NotFound);
        }
        self.client.delete_object(&key).await?;
        debug!(locator, "deleted object");
        Ok(DeleteOutcome::Deleted)
    }

    async fn list(&self) -> EvidenceResult<Vec<StoredObject>> {
        let mut objects: Vec<StoredObject> = self
            .client
            .list_objects(&self.list_prefix())
            .await?
            .into_iter()
            .filter_map(|info| {
                let locator = self.locator_for(&info.key)?;
                (locator != HEALTH_KEY).then_some(StoredObject {
                    locator,
                    size: info.size,
                    last_modified: info.last_modified,
                })
            })
            .collect();
        objects.sort_by(|a, b| a.locator.cmp(&b.locator));
        Ok(objects)
    }

    async fn health_check(&self) -> bool {
        match self.client.head_object(&self.key_for(HEALTH_KEY)).await {
            Ok(_) => true,
            Err(err) => {
                error!(backend = self.client.name(), error = %err, "object store health check failed");
                false
            }
        }
    }
}
