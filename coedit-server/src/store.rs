//! Persistence adapter: document snapshots and version history.
//!
//! The engine talks to storage through the [`DocumentStore`] contract and
//! never waits for it on the hot path; writes go through a [`Spooler`] that
//! retries with backoff and surfaces exhaustion as an observability event
//! instead of an error to any client.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use rand::random;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};

use crate::Identifier;
use crate::ot::Operation;

/// Metadata stored alongside a document's content.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentMeta {
    /// Principal that created the document, when known.
    pub owner: Option<String>,
    /// Language tag for editor syntax highlighting.
    pub language: String,
    /// Version the persisted content is at.
    pub version: u64,
}

impl Default for DocumentMeta {
    fn default() -> Self {
        Self {
            owner: None,
            language: "plaintext".to_string(),
            version: 0,
        }
    }
}

/// A document snapshot as loaded from or saved to storage.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct PersistedDocument {
    /// Full text content.
    pub content: String,
    /// Metadata, including the snapshot version.
    pub meta: DocumentMeta,
}

/// One immutable history entry: the operation that produced a version.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionRecord {
    /// The version this operation produced.
    pub version: u64,
    /// The operation as applied.
    pub op: Operation,
    /// Principal that authored it.
    pub author: String,
    /// Milliseconds since the Unix epoch at acceptance.
    pub created_at: i64,
}

/// Storage failures.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// No document with the requested id.
    #[error("document not found")]
    NotFound,
    /// Underlying I/O failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),
    /// Corrupt or unwritable record encoding.
    #[error(transparent)]
    Encoding(#[from] serde_json::Error),
}

/// Contract the engine persists through. Implementations must be safe to
/// call from many engines concurrently.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Load a document's latest snapshot.
    async fn load_document(&self, id: &Identifier) -> Result<PersistedDocument, StoreError>;
    /// Upsert a document snapshot; idempotent on version.
    async fn save_document(
        &self,
        id: &Identifier,
        document: &PersistedDocument,
    ) -> Result<(), StoreError>;
    /// Append one version record; at most once per `(id, version)` even
    /// under retries.
    async fn append_version(
        &self,
        id: &Identifier,
        record: &VersionRecord,
    ) -> Result<(), StoreError>;
    /// The most recent `limit` version records, oldest first.
    async fn list_versions(
        &self,
        id: &Identifier,
        limit: usize,
    ) -> Result<Vec<VersionRecord>, StoreError>;
}

/// File-backed store: per-document content file plus a JSON metadata
/// sidecar under `docs/`, and an append-only `.versions.jsonl` history.
#[derive(Debug)]
pub struct FileStore {
    storage: PathBuf,
    /// Highest version appended per document this process lifetime; the
    /// guard that keeps spooler retries from duplicating history entries.
    appended: DashMap<Identifier, u64>,
    /// Highest snapshot version written per document, so a queued autosave
    /// that lands late cannot clobber a newer snapshot.
    saved: DashMap<Identifier, u64>,
}

impl FileStore {
    /// Open (or create) a store rooted at `storage`.
    pub async fn new(storage: PathBuf) -> Result<Self> {
        let this = Self {
            storage,
            appended: DashMap::new(),
            saved: DashMap::new(),
        };
        fs::create_dir_all(this.document_dir())
            .await
            .context("creating document storage directory")?;
        Ok(this)
    }

    /// A store in a temporary directory for testing.
    pub async fn temporary() -> Result<Self> {
        let storage = std::env::temp_dir().join(format!("coedit_{:x}", random::<u64>()));
        Self::new(storage).await
    }

    fn document_dir(&self) -> PathBuf {
        self.storage.join("docs")
    }
    fn content_path(&self, id: &Identifier) -> PathBuf {
        self.document_dir().join(id.as_ref())
    }
    fn meta_path(&self, id: &Identifier) -> PathBuf {
        self.content_path(id).with_extension("json")
    }
    fn versions_path(&self, id: &Identifier) -> PathBuf {
        self.content_path(id).with_extension("versions.jsonl")
    }
}

#[async_trait]
impl DocumentStore for FileStore {
    async fn load_document(&self, id: &Identifier) -> Result<PersistedDocument, StoreError> {
        let meta_path = self.meta_path(id);
        if !meta_path.exists() {
            return Err(StoreError::NotFound);
        }
        let meta: DocumentMeta = serde_json::from_str(&fs::read_to_string(meta_path).await?)?;
        let content = fs::read_to_string(self.content_path(id)).await?;
        Ok(PersistedDocument { content, meta })
    }

    async fn save_document(
        &self,
        id: &Identifier,
        document: &PersistedDocument,
    ) -> Result<(), StoreError> {
        let current = match self.saved.get(id) {
            Some(version) => *version,
            None => self
                .load_document(id)
                .await
                .map(|doc| doc.meta.version)
                .unwrap_or(0),
        };
        if document.meta.version < current {
            return Ok(()); // stale snapshot overtaken by a newer save
        }
        fs::write(self.content_path(id), &document.content).await?;
        fs::write(
            self.meta_path(id),
            serde_json::to_string_pretty(&document.meta)?,
        )
        .await?;
        self.saved.insert(id.clone(), document.meta.version);
        Ok(())
    }

    async fn append_version(
        &self,
        id: &Identifier,
        record: &VersionRecord,
    ) -> Result<(), StoreError> {
        if let Some(last) = self.appended.get(id)
            && record.version <= *last
        {
            return Ok(());
        }
        let mut line = serde_json::to_string(record)?;
        line.push('\n');
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.versions_path(id))
            .await?;
        file.write_all(line.as_bytes()).await?;
        self.appended.insert(id.clone(), record.version);
        Ok(())
    }

    async fn list_versions(
        &self,
        id: &Identifier,
        limit: usize,
    ) -> Result<Vec<VersionRecord>, StoreError> {
        let path = self.versions_path(id);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let raw = fs::read_to_string(path).await?;
        let mut records = Vec::new();
        for line in raw.lines().filter(|l| !l.trim().is_empty()) {
            records.push(serde_json::from_str(line)?);
        }
        if records.len() > limit {
            records.drain(..records.len() - limit);
        }
        Ok(records)
    }
}

#[cfg(test)]
impl Drop for FileStore {
    fn drop(&mut self) {
        // Clean up temporary storage directories on drop.
        if self.storage.parent() == Some(std::env::temp_dir().as_path()) {
            let _ = std::fs::remove_dir_all(&self.storage);
        }
    }
}

/// One queued persistence job.
#[derive(Clone, Debug)]
pub enum PersistJob {
    /// Upsert a snapshot.
    Save {
        /// Document id.
        id: Identifier,
        /// Snapshot to store.
        document: PersistedDocument,
    },
    /// Append a history record.
    Append {
        /// Document id.
        id: Identifier,
        /// Record to append.
        record: VersionRecord,
    },
}

impl PersistJob {
    fn describe(&self) -> (&'static str, &Identifier, u64) {
        match self {
            PersistJob::Save { id, document } => ("save", id, document.meta.version),
            PersistJob::Append { id, record } => ("append", id, record.version),
        }
    }
}

const SPOOL_CAPACITY: usize = 256;
const RETRY_LIMIT: u32 = 4;
const RETRY_BASE: Duration = Duration::from_millis(250);

/// Fire-and-forget submission queue in front of a [`DocumentStore`].
///
/// The engine hands jobs to `submit` and moves on; a drainer task delivers
/// them with jittered exponential backoff. A full queue or exhausted
/// retries degrade persistence without touching in-memory correctness.
#[derive(Clone, Debug)]
pub struct Spooler {
    tx: mpsc::Sender<PersistJob>,
}

impl Spooler {
    /// Start a drainer over `store` on `tracker`. `cancel` stops retries;
    /// jobs already queued are still flushed with a single attempt each.
    pub fn start(
        store: Arc<dyn DocumentStore>,
        cancel: CancellationToken,
        tracker: &TaskTracker,
    ) -> Self {
        let (tx, rx) = mpsc::channel(SPOOL_CAPACITY);
        tracker.spawn(drain(store, rx, cancel));
        Self { tx }
    }

    /// Enqueue `job` without waiting. Overflow is reported, not propagated.
    pub fn submit(&self, job: PersistJob) {
        if let Err(err) = self.tx.try_send(job) {
            let (what, id, version) = match err {
                mpsc::error::TrySendError::Full(ref job)
                | mpsc::error::TrySendError::Closed(ref job) => job.describe(),
            };
            warn!(%id, version, job = what, "persistence degraded: spool queue unavailable");
        }
    }
}

async fn drain(
    store: Arc<dyn DocumentStore>,
    mut rx: mpsc::Receiver<PersistJob>,
    cancel: CancellationToken,
) {
    loop {
        let job = tokio::select! {
            _ = cancel.cancelled() => break,
            job = rx.recv() => match job {
                Some(job) => job,
                None => break,
            },
        };
        deliver(&*store, job, &cancel).await;
    }
    // Flush whatever is already queued; cancellation only stops retries.
    rx.close();
    while let Some(job) = rx.recv().await {
        deliver(&*store, job, &cancel).await;
    }
    info!("persistence spooler stopped");
}

async fn deliver(store: &dyn DocumentStore, job: PersistJob, cancel: &CancellationToken) {
    for attempt in 0..=RETRY_LIMIT {
        let result = match &job {
            PersistJob::Save { id, document } => store.save_document(id, document).await,
            PersistJob::Append { id, record } => store.append_version(id, record).await,
        };
        match result {
            Ok(()) => return,
            Err(err) => {
                let (what, id, version) = job.describe();
                if attempt == RETRY_LIMIT {
                    warn!(%id, version, job = what, %err, "persistence degraded: retries exhausted");
                    return;
                }
                let backoff = RETRY_BASE * 2u32.pow(attempt)
                    + Duration::from_millis(rand::random_range(0..100));
                warn!(%id, version, job = what, %err, ?backoff, "persistence attempt failed");
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(backoff) => {}
                }
            }
        }
    }
}
