use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};

use crate::error::{EvidenceError, EvidenceResult};
use crate::storage::object_store::{CompletedPart, ObjectClient, ObjectInfo};
use crate::storage::{stream_from_bytes, ByteStream};

#[derive(Debug, Clone)]
struct MemoryObject {
    data: Vec<u8>,
    last_modified: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct PendingUpload {
    key: String,
    parts: BTreeMap<u32, (String, Vec<u8>)>,
}

#[derive(Debug, Default)]
struct MemoryState {
    objects: BTreeMap<String, MemoryObject>,
    uploads: HashMap<String, PendingUpload>,
    next_upload: u64,
    completed_multipart: usize,
}

/// Object store kept in process memory.
///
/// Follows the same visibility rules as a real object store: multipart data
/// stays invisible until completed. Used for tests and `storage.kind = "memory"`.
#[derive(Debug, Default)]
pub struct MemoryObjectClient {
    state: Mutex<MemoryState>,
    unavailable: AtomicBool,
}

impl MemoryObjectClient {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> EvidenceResult<MutexGuard<'_, MemoryState>> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(EvidenceError::storage("object store unavailable"));
        }
        self.state
            .lock()
            .map_err(|_| EvidenceError::Internal("memory object store lock poisoned".to_string()))
    }

    /// Make every subsequent call fail with a storage error.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Place an object directly, bypassing the upload path.
    pub fn insert_object(&self, key: &str, data: Vec<u8>, last_modified: DateTime<Utc>) {
        if let Ok(mut state) = self.state.lock() {
            state.objects.insert(
                key.to_string(),
                MemoryObject {
                    data,
                    last_modified,
                },
            );
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.state
            .lock()
            .map(|state| state.objects.contains_key(key))
            .unwrap_or(false)
    }

    pub fn object_count(&self) -> usize {
        self.state
            .lock()
            .map(|state| state.objects.len())
            .unwrap_or(0)
    }

    /// Multipart uploads started but neither completed nor aborted.
    pub fn pending_uploads(&self) -> usize {
        self.state
            .lock()
            .map(|state| state.uploads.len())
            .unwrap_or(0)
    }

    pub fn completed_multipart_uploads(&self) -> usize {
        self.state
            .lock()
            .map(|state| state.completed_multipart)
            .unwrap_or(0)
    }
}

fn unknown_upload(upload_id: &str) -> EvidenceError {
    EvidenceError::storage(format!("unknown multipart upload: {}", upload_id))
}

#[async_trait]
impl ObjectClient for MemoryObjectClient {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn put_object(&self, key: &str, body: Vec<u8>) -> EvidenceResult<()> {
        let mut state = self.lock()?;
        state.objects.insert(
            key.to_string(),
            MemoryObject {
                data: body,
                last_modified: Utc::now(),
            },
        );
        Ok(())
    }

    async fn create_multipart_upload(&self, key: &str) -> EvidenceResult<String> {
        let mut state = self.lock()?;
        state.next_upload += 1;
        let upload_id = format!("upload-{}", state.next_upload);
        state.uploads.insert(
            upload_id.clone(),
            PendingUpload {
                key: key.to_string(),
                parts: BTreeMap::new(),
            },
        );
        Ok(upload_id)
    }

    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: u32,
        body: Vec<u8>,
    ) -> EvidenceResult<String> {
        let mut state = self.lock()?;
        let upload = state
            .uploads
            .get_mut(upload_id)
            .filter(|upload| upload.key == key)
            .ok_or_else(|| unknown_upload(upload_id))?;
        let etag = hex::encode(Sha256::digest(&body));
        upload.parts.insert(part_number, (etag.clone(), body));
        Ok(etag)
    }

    async fn complete_multipart_upload(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> EvidenceResult<()> {
        let mut state = self.lock()?;
        let upload = state
            .uploads
            .get(upload_id)
            .filter(|upload| upload.key == key)
            .ok_or_else(|| unknown_upload(upload_id))?;

        let mut data = Vec::new();
        for part in parts {
            match upload.parts.get(&part.part_number) {
                Some((etag, body)) if *etag == part.etag => data.extend_from_slice(body),
                _ => {
                    return Err(EvidenceError::storage(format!(
                        "invalid part {} for upload {}",
                        part.part_number, upload_id
                    )))
                }
            }
        }

        state.uploads.remove(upload_id);
        state.objects.insert(
            key.to_string(),
            MemoryObject {
                data,
                last_modified: Utc::now(),
            },
        );
        state.completed_multipart += 1;
        Ok(())
    }

    async fn abort_multipart_upload(&self, _key: &str, upload_id: &str) -> EvidenceResult<()> {
        let mut state = self.lock()?;
        state.uploads.remove(upload_id);
        Ok(())
    }

    async fn get_object(&self, key: &str) -> EvidenceResult<Option<ByteStream>> {
        let state = self.lock()?;
        Ok(state
            .objects
            .get(key)
            .map(|object| stream_from_bytes(object.data.clone())))
    }

    async fn head_object(&self, key: &str) -> EvidenceResult<Option<ObjectInfo>> {
        let state = self.lock()?;
        Ok(state.objects.get(key).map(|object| ObjectInfo {
            key: key.to_string(),
            size: object.data.len() as u64,
            last_modified: object.last_modified,
        }))
    }

    async fn delete_object(&self, key: &str) -> EvidenceResult<()> {
        let mut state = self.lock()?;
        state.objects.remove(key);
        Ok(())
    }

    async fn list_objects(&self, prefix: &str) -> EvidenceResult<Vec<ObjectInfo>> {
        let state = self.lock()?;
        Ok(state
            .objects
            .iter()
            .filter(|(key, _)| key.starts_with(prefix))
            .map(|(key, object)| ObjectInfo {
                key: key.clone(),
                size: object.data.len() as u64,
                last_modified: object.last_modified,
            })
            .collect())
    }
}
