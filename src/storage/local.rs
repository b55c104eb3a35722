use std::io;
use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::error::{EvidenceError, EvidenceResult};
use crate::storage::{
    ByteStream, DeleteOutcome, PutOptions, PutReceipt, StorageBackend, StoredObject, WriteTally,
    STREAM_CHUNK_SIZE,
};

const STAGING_DIR_NAME: &str = ".staging";
const STAGING_SUFFIX: &str = ".part";
const HEALTH_FILE_NAME: &str = ".health_check";
/// Commit attempts when a concurrent delete prunes the target directory.
const COMMIT_ATTEMPTS: u32 = 5;

/// Evidence storage backed by the local filesystem.
///
/// Writes land in a staging directory under the root and are renamed into
/// place only after the full stream was written and synced, so a reader never
/// observes a partially written object.
#[derive(Debug, Clone)]
pub struct LocalBackend {
    root_dir: PathBuf,
    staging_dir: PathBuf,
}

/// Temporary file removed on drop unless it was committed or discarded.
struct StagedFile {
    path: PathBuf,
    armed: bool,
}

impl StagedFile {
    fn new(path: PathBuf) -> Self {
        Self { path, armed: true }
    }

    fn disarm(mut self) {
        self.armed = false;
    }

    async fn discard(mut self) {
        self.armed = false;
        log_staged_removal(&self.path, fs::remove_file(&self.path).await);
    }
}

impl Drop for StagedFile {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        // Only reached when the put future is dropped before it finishes.
        let path = std::mem::take(&mut self.path);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(move || {
                    log_staged_removal(&path, std::fs::remove_file(&path));
                });
            }
            Err(_) => log_staged_removal(&path, std::fs::remove_file(&path)),
        }
    }
}

fn log_staged_removal(path: &Path, result: io::Result<()>) {
    match result {
        Ok(()) => debug!(path = %path.display(), "removed partial upload"),
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => warn!(
            path = %path.display(),
            error = %err,
            "failed to remove partial upload"
        ),
    }
}

impl LocalBackend {
    /// Create a backend rooted at the given directory.
    pub fn new(root_dir: impl Into<PathBuf>) -> EvidenceResult<Self> {
        let root_dir = root_dir.into();
        let staging_dir = root_dir.join(STAGING_DIR_NAME);
        std::fs::create_dir_all(&staging_dir)?;
        Ok(Self {
            root_dir,
            staging_dir,
        })
    }

    pub fn root_dir(&self) -> &Path {
        &self.root_dir
    }

    fn resolve(&self, locator: &str) -> EvidenceResult<PathBuf> {
        let relative = Path::new(locator);
        let well_formed = !locator.is_empty()
            && relative
                .components()
                .all(|component| matches!(component, Component::Normal(_)));
        if !well_formed || relative.starts_with(STAGING_DIR_NAME) {
            return Err(EvidenceError::InvalidInput(format!(
                "invalid locator: {}",
                locator
            )));
        }
        Ok(self.root_dir.join(relative))
    }

    async fn prune_empty_dirs(&self, path: &Path) {
        let mut current = path.parent();
        while let Some(dir) = current {
            if dir == self.root_dir || fs::remove_dir(dir).await.is_err() {
                break;
            }
            current = dir.parent();
        }
    }

    async fn write_staged(
        &self,
        staged: &Path,
        body: &mut ByteStream,
        options: &PutOptions,
    ) -> EvidenceResult<PutReceipt> {
        let mut file = fs::File::create(staged).await?;
        let mut tally = WriteTally::new(options.max_size);

        while let Some(chunk) = body.next().await {
            let chunk = chunk?;
            tally.observe(&chunk)?;
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        file.sync_all().await?;
        drop(file);

        tally.finish(options.expected_size)
    }

    /// Link the staged file at `target`. Never replaces an existing object.
    async fn commit_staged(
        &self,
        staged: &Path,
        target: &Path,
        locator: &str,
    ) -> EvidenceResult<()> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let linked: io::Result<()> = async {
                if let Some(parent) = target.parent() {
                    fs::create_dir_all(parent).await?;
                }
                fs::hard_link(staged, target).await
            }
            .await;

            match linked {
                Ok(()) => break,
                Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                    return Err(EvidenceError::Conflict(format!(
                        "locator already exists: {}",
                        locator
                    )));
                }
                Err(err) if err.kind() == io::ErrorKind::NotFound && attempt < COMMIT_ATTEMPTS => {
                    debug!(locator, attempt, "target directory pruned during commit, retrying");
                }
                Err(err) => return Err(err.into()),
            }
        }

        if let Err(err) = fs::remove_file(staged).await {
            warn!(locator, error = %err, "committed object but staged copy remains");
        }
        Ok(())
    }
}

fn file_stream(file: fs::File) -> ByteStream {
    stream::unfold(Some(file), |state| async move {
        let mut file = state?;
        let mut buf = vec![0u8; STREAM_CHUNK_SIZE];
        match file.read(&mut buf).await {
            Ok(0) => None,
            Ok(read) => {
                buf.truncate(read);
                Some((Ok(buf), Some(file)))
            }
            Err(err) => Some((Err(err), None)),
        }
    })
    .boxed()
}

fn walk_objects(root: &Path) -> EvidenceResult<Vec<StoredObject>> {
    let mut objects = Vec::new();
    let mut pending = vec![root.to_path_buf()];

    while let Some(dir) = pending.pop() {
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => continue,
            Err(err) => return Err(err.into()),
        };
        for entry in entries {
            let entry = entry?;
            let at_root = dir == root;
            let name = entry.file_name();
            let file_type = entry.file_type()?;

            if file_type.is_dir() {
                if !(at_root && name == STAGING_DIR_NAME) {
                    pending.push(entry.path());
                }
                continue;
            }
            if !file_type.is_file() || (at_root && name == HEALTH_FILE_NAME) {
                continue;
            }

            let metadata = match entry.metadata() {
                Ok(metadata) => metadata,
                Err(err) if err.kind() == io::ErrorKind::NotFound => continue,
                Err(err) => return Err(err.into()),
            };
            let path = entry.path();
            let relative = path
                .strip_prefix(root)
                .map_err(|err| EvidenceError::Internal(err.to_string()))?;
            let locator = relative
                .components()
                .map(|component| component.as_os_str().to_string_lossy().into_owned())
                .collect::<Vec<_>>()
                .join("/");
            let last_modified = metadata
                .modified()
                .map(DateTime::<Utc>::from)
                .unwrap_or_else(|_| Utc::now());

            objects.push(StoredObject {
                locator,
                size: metadata.len(),
                last_modified,
            });
        }
    }

    objects.sort_by(|a, b| a.locator.cmp(&b.locator));
    Ok(objects)
}

#[async_trait]
impl StorageBackend for LocalBackend {
    fn kind(&self) -> &'static str {
        "local"
    }

    async fn put(
        &self,
        locator: &str,
        mut body: ByteStream,
        options: PutOptions,
    ) -> EvidenceResult<PutReceipt> {
        let target = self.resolve(locator)?;
        if fs::try_exists(&target).await? {
            return Err(EvidenceError::Conflict(format!(
                "locator already exists: {}",
                locator
            )));
        }

        let staged = StagedFile::new(
            self.staging_dir
                .join(format!("{}{}", Uuid::new_v4(), STAGING_SUFFIX)),
        );
        let committed = match self.write_staged(&staged.path, &mut body, &options).await {
            Ok(receipt) => self
                .commit_staged(&staged.path, &target, locator)
                .await
                .map(|()| receipt),
            Err(err) => Err(err),
        };

        match committed {
            Ok(receipt) => {
                staged.disarm();
                debug!(
                    locator,
                    size = receipt.committed_size,
                    "committed local object"
                );
                Ok(receipt)
            }
            Err(err) => {
                staged.discard().await;
                Err(err)
            }
        }
    }

    async fn get(&self, locator: &str) -> EvidenceResult<ByteStream> {
        let path = self.resolve(locator)?;
        match fs::metadata(&path).await {
            Ok(metadata) if metadata.is_file() => {}
            Ok(_) => return Err(EvidenceError::NotFound(locator.to_string())),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Err(EvidenceError::NotFound(locator.to_string()))
            }
            Err(err) => return Err(err.into()),
        }
        let file = fs::File::open(&path).await.map_err(|err| match err.kind() {
            io::ErrorKind::NotFound => EvidenceError::NotFound(locator.to_string()),
            _ => EvidenceError::StorageIo(err),
        })?;
        Ok(file_stream(file))
    }

    async fn exists(&self, locator: &str) -> EvidenceResult<bool> {
        let path = self.resolve(locator)?;
        match fs::metadata(&path).await {
            Ok(metadata) => Ok(metadata.is_file()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    async fn delete(&self, locator: &str) -> EvidenceResult<DeleteOutcome> {
        let path = self.resolve(locator)?;
        match fs::remove_file(&path).await {
            Ok(()) => {
                self.prune_empty_dirs(&path).await;
                debug!(locator, "deleted local object");
                Ok(DeleteOutcome::Deleted)
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(DeleteOutcome::NotFound),
            Err(err) => Err(err.into()),
        }
    }

    async fn list(&self) -> EvidenceResult<Vec<StoredObject>> {
        let root = self.root_dir.clone();
        tokio::task::spawn_blocking(move || walk_objects(&root))
            .await
            .map_err(|err| EvidenceError::Internal(format!("listing task failed: {}", err)))?
    }

    async fn sweep_staging(&self, older_than: DateTime<Utc>) -> EvidenceResult<usize> {
        let mut entries = match fs::read_dir(&self.staging_dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(0),
            Err(err) => return Err(err.into()),
        };

        let mut removed = 0;
        while let Some(entry) = entries.next_entry().await? {
            let Ok(metadata) = entry.metadata().await else {
                continue;
            };
            let modified = metadata
                .modified()
                .map(DateTime::<Utc>::from)
                .unwrap_or_else(|_| Utc::now());
            if metadata.is_file() && modified < older_than {
                match fs::remove_file(entry.path()).await {
                    Ok(()) => removed += 1,
                    Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                    Err(err) => return Err(err.into()),
                }
            }
        }
        Ok(removed)
    }

    async fn health_check(&self) -> bool {
        let probe = self.root_dir.join(HEALTH_FILE_NAME);
        let result = async {
            fs::write(&probe, b"ok").await?;
            fs::remove_file(&probe).await
        }
        .await;
        match result {
            Ok(()) => true,
            Err(err) => {
                error!(root = %self.root_dir.display(), error = %err, "local storage health check failed");
                false
            }
        }
    }
}
