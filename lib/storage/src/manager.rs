use crate::snapshot::{SnapshotDescription, SnapshotManager, StoreSnapshotData};
use crate::wal::WriteAheadLog;
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use personlink_core::store::{BatchOperation, BatchResponse, DocumentStore, FindResult, PutResult};
use personlink_core::store::{doc_id, doc_rev};
use personlink_core::{Error, MemoryStore, Query, Result};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{error, info, warn};

const WAL_FILE: &str = "wal.log";
const SNAPSHOT_DIR: &str = "snapshots";
const DEFAULT_KEEP_SNAPSHOTS: usize = 3;

/// A [`MemoryStore`] made durable by a write-ahead log and periodic snapshots.
///
/// On open the newest intact snapshot is loaded and the log replayed on
/// top of it. A save writes a snapshot and then truncates the log; writes
/// are held off for the duration so none can fall between the two.
pub struct StorageManager {
    store: MemoryStore,
    wal: Arc<WriteAheadLog>,
    snapshots: Arc<SnapshotManager>,
    data_dir: PathBuf,
    persist_lock: RwLock<()>,
    last_save_time: AtomicI64,
    keep_snapshots: usize,
    shutdown: AtomicBool,
}

impl StorageManager {
    pub fn open<P: AsRef<Path>>(data_dir: P) -> Result<Self> {
        let data_dir = data_dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&data_dir)?;

        let snapshots = Arc::new(
            SnapshotManager::new(data_dir.join(SNAPSHOT_DIR))
                .map_err(|e| Error::Storage(e.to_string()))?,
        );
        let store = MemoryStore::new();

        if let Some(snapshot) = snapshots
            .load_latest()
            .map_err(|e| Error::Persistence(e.to_string()))?
        {
            info!(
                "Loading snapshot from {} ({} documents)",
                snapshot.created_at,
                snapshot.documents.len()
            );
            restore_all(&store, snapshot.documents);
            store.restore_rev(snapshot.last_rev);
        }

        let wal_path = data_dir.join(WAL_FILE);
        let replay = WriteAheadLog::replay(&wal_path)
            .map_err(|e| Error::Persistence(format!("{:#}", e)))?;
        WriteAheadLog::discard_torn_tail(&wal_path, replay.valid_len)
            .map_err(|e| Error::Persistence(e.to_string()))?;
        if !replay.documents.is_empty() {
            info!("Replaying {} WAL records", replay.documents.len());
            restore_all(&store, replay.documents);
        }

        let wal = Arc::new(
            WriteAheadLog::new(&wal_path).map_err(|e| Error::Storage(e.to_string()))?,
        );

        info!(
            "Storage opened at {}: {} documents, revision {}",
            data_dir.display(),
            store.count(),
            store.current_rev()
        );

        Ok(Self {
            store,
            wal,
            snapshots,
            data_dir,
            persist_lock: RwLock::new(()),
            last_save_time: AtomicI64::new(0),
            keep_snapshots: DEFAULT_KEEP_SNAPSHOTS,
            shutdown: AtomicBool::new(false),
        })
    }

    #[inline]
    #[must_use]
    pub fn with_keep_snapshots(mut self, keep: usize) -> Self {
        self.keep_snapshots = keep.max(1);
        self
    }

    #[inline]
    pub fn memory(&self) -> &MemoryStore {
        &self.store
    }

    #[inline]
    #[must_use]
    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Unix time of the last successful save, 0 if none
    pub fn last_save_time(&self) -> i64 {
        self.last_save_time.load(Ordering::Acquire)
    }

    /// Snapshot the store, then truncate the log and prune old snapshots.
    pub fn save(&self) -> Result<SnapshotDescription> {
        let _exclusive = self.persist_lock.write();
        let data = StoreSnapshotData {
            last_rev: self.store.current_rev(),
            documents: self.store.documents(),
            created_at: Utc::now(),
        };
        let description = self
            .snapshots
            .create_snapshot(&data)
            .map_err(|e| Error::Persistence(e.to_string()))?;
        self.wal
            .truncate()
            .map_err(|e| Error::Persistence(e.to_string()))?;
        self.last_save_time
            .store(data.created_at.timestamp(), Ordering::Release);

        match self.snapshots.prune(self.keep_snapshots) {
            Ok(0) => {}
            Ok(removed) => info!("Pruned {} old snapshots", removed),
            Err(e) => warn!("Failed to prune snapshots: {}", e),
        }
        Ok(description)
    }

    pub fn list_snapshots(&self) -> Result<Vec<SnapshotDescription>> {
        self.snapshots
            .list_snapshots()
            .map_err(|e| Error::Storage(e.to_string()))
    }

    /// Flush the log to disk
    pub fn sync(&self) -> Result<()> {
        self.wal.sync().map_err(|e| Error::Storage(e.to_string()))
    }

    /// Save every `interval` on a background thread until [`stop_background_save`] is called.
    ///
    /// [`stop_background_save`]: StorageManager::stop_background_save
    pub fn start_background_save(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        std::thread::spawn(move || {
            let step = Duration::from_millis(200).min(interval);
            let mut waited = Duration::ZERO;
            while !manager.shutdown.load(Ordering::Acquire) {
                std::thread::sleep(step);
                waited += step;
                if waited < interval {
                    continue;
                }
                waited = Duration::ZERO;
                if let Err(e) = manager.save() {
                    error!("Background save error: {}", e);
                }
            }
        })
    }

    pub fn stop_background_save(&self) {
        self.shutdown.store(true, Ordering::Release);
    }

    fn log(&self, written: &[Value]) -> Result<()> {
        self.wal
            .append_documents(written)
            .map_err(|e| Error::Storage(e.to_string()))
    }

    fn put_sync(&self, docs: Vec<Value>) -> Result<Vec<PutResult>> {
        let _shared = self.persist_lock.read();
        let written = self.store.apply_put(docs)?;
        self.log(&written)?;
        Ok(put_results(&written))
    }

    fn merge_sync(&self, docs: Vec<Value>) -> Result<Vec<PutResult>> {
        let _shared = self.persist_lock.read();
        let written = self.store.apply_merge(docs)?;
        self.log(&written)?;
        Ok(put_results(&written))
    }

    fn del_sync(&self, ids: &[String]) -> Result<Vec<PutResult>> {
        let _shared = self.persist_lock.read();
        let written = self.store.apply_del(ids);
        self.log(&written)?;
        Ok(put_results(&written))
    }

    fn del_query_sync(&self, query: &Query) -> Result<usize> {
        let _shared = self.persist_lock.read();
        let written = self.store.apply_del_query(query);
        self.log(&written)?;
        Ok(written.len())
    }
}

fn restore_all(store: &MemoryStore, docs: Vec<Value>) {
    for doc in docs {
        if let Err(e) = store.restore(doc) {
            warn!("Skipping unrecoverable document: {}", e);
        }
    }
}

fn put_results(docs: &[Value]) -> Vec<PutResult> {
    docs.iter()
        .filter_map(|d| {
            Some(PutResult {
                id: doc_id(d)?.to_string(),
                rev: doc_rev(d)?,
            })
        })
        .collect()
}

#[async_trait]
impl DocumentStore for StorageManager {
    async fn find(&self, query: &Query) -> Result<FindResult> {
        self.store.find_page(query)
    }

    async fn get(&self, ids: &[String]) -> Result<Vec<Value>> {
        self.store.get(ids).await
    }

    async fn put(&self, docs: Vec<Value>) -> Result<Vec<PutResult>> {
        self.put_sync(docs)
    }

    async fn merge(&self, docs: Vec<Value>) -> Result<Vec<PutResult>> {
        self.merge_sync(docs)
    }

    async fn del(&self, ids: &[String]) -> Result<Vec<PutResult>> {
        self.del_sync(ids)
    }

    async fn del_query(&self, query: &Query) -> Result<usize> {
        self.del_query_sync(query)
    }

    async fn execute_batch(&self, ops: Vec<BatchOperation>) -> Result<Vec<BatchResponse>> {
        let mut responses = Vec::with_capacity(ops.len());
        for op in ops {
            responses.push(match op {
                BatchOperation::Put { objects } => BatchResponse::Put(self.put_sync(objects)?),
                BatchOperation::Merge { objects } => {
                    BatchResponse::Merge(self.merge_sync(objects)?)
                }
                BatchOperation::Del { ids } => BatchResponse::Del(self.del_sync(&ids)?),
                BatchOperation::DelQuery { query } => {
                    BatchResponse::DelQuery(self.del_query_sync(&query)?)
                }
            });
        }
        Ok(responses)
    }
}

impl Drop for StorageManager {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        if let Err(e) = self.wal.sync() {
            error!("Failed to sync WAL on shutdown: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use personlink_core::{Contact, FilterCondition};

    #[tokio::test]
    async fn test_reopen_replays_wal() {
        let dir = tempfile::tempdir().unwrap();
        let id = {
            let storage = StorageManager::open(dir.path()).unwrap();
            let written = storage
                .put(vec![Contact::new().with_email("a@example.com").to_document().unwrap()])
                .await
                .unwrap();
            storage.del(&[written[0].id.clone()]).await.unwrap();
            written[0].id.clone()
        };

        let storage = StorageManager::open(dir.path()).unwrap();
        let docs = storage.get(&[id]).await.unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0]["_del"], true);
        assert_eq!(storage.memory().current_rev(), 2);

        let written = storage
            .put(vec![Contact::new().to_document().unwrap()])
            .await
            .unwrap();
        assert_eq!(written[0].rev, 3);
    }

    #[tokio::test]
    async fn test_save_truncates_wal_and_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let storage = StorageManager::open(dir.path()).unwrap();
            for email in ["a@example.com", "b@example.com"] {
                storage
                    .put(vec![Contact::new().with_email(email).to_document().unwrap()])
                    .await
                    .unwrap();
            }
            let description = storage.save().unwrap();
            assert!(description.checksum.is_some());
            assert!(storage.last_save_time() > 0);
            assert!(WriteAheadLog::replay(dir.path().join(WAL_FILE)).unwrap().documents.is_empty());

            storage
                .put(vec![Contact::new().with_email("c@example.com").to_document().unwrap()])
                .await
                .unwrap();
        }

        let storage = StorageManager::open(dir.path()).unwrap();
        assert_eq!(storage.memory().count(), 3);
        assert_eq!(storage.memory().current_rev(), 3);
        let found = storage
            .find(
                &Query::new(Contact::KIND)
                    .filter(FilterCondition::equals("emails.normalizedValue", "c@example.com")),
            )
            .await
            .unwrap();
        assert_eq!(found.results.len(), 1);
    }

    #[tokio::test]
    async fn test_crash_torn_record_survives_repeated_restarts() {
        let dir = tempfile::tempdir().unwrap();
        {
            let storage = StorageManager::open(dir.path()).unwrap();
            storage
                .put(vec![Contact::new().with_email("a@example.com").to_document().unwrap()])
                .await
                .unwrap();
            storage.wal.append(br#"{"_id": "torn", "_re"#).unwrap();
        }
        {
            let storage = StorageManager::open(dir.path()).unwrap();
            assert_eq!(storage.memory().count(), 1);
            for email in ["b@example.com", "c@example.com"] {
                storage
                    .put(vec![Contact::new().with_email(email).to_document().unwrap()])
                    .await
                    .unwrap();
            }
        }

        let storage = StorageManager::open(dir.path()).unwrap();
        assert_eq!(storage.memory().count(), 3);
        assert_eq!(storage.memory().current_rev(), 3);
    }

    #[tokio::test]
    async fn test_old_snapshots_are_pruned() {
        let dir = tempfile::tempdir().unwrap();
        let storage = StorageManager::open(dir.path()).unwrap().with_keep_snapshots(2);
        for _ in 0..4 {
            storage
                .put(vec![Contact::new().to_document().unwrap()])
                .await
                .unwrap();
            storage.save().unwrap();
        }
        assert_eq!(storage.list_snapshots().unwrap().len(), 2);
    }
}
