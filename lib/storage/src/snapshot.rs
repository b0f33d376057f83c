// Gzip-compressed JSON snapshots of the whole document store
use anyhow::{anyhow, Result};
use atomicwrites::{AllowOverwrite, AtomicFile};
use chrono::{DateTime, Utc};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{BufReader, Read, Write};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

const SNAPSHOT_EXTENSION: &str = "snapshot";
const CHECKSUM_EXTENSION: &str = "sha256";

/// Snapshot description for API responses
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotDescription {
    pub name: String,
    pub creation_time: Option<String>,
    pub size: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
}

/// Every document in the store plus the revision counter
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreSnapshotData {
    pub last_rev: u64,
    pub documents: Vec<Value>,
    pub created_at: DateTime<Utc>,
}

pub struct SnapshotManager {
    snapshot_dir: PathBuf,
}

impl SnapshotManager {
    pub fn new<P: AsRef<Path>>(snapshot_dir: P) -> Result<Self> {
        let snapshot_dir = snapshot_dir.as_ref().to_path_buf();
        fs::create_dir_all(&snapshot_dir)?;
        Ok(Self { snapshot_dir })
    }

    /// Names sort by revision first, so the newest snapshot sorts last.
    fn generate_snapshot_name(data: &StoreSnapshotData) -> String {
        format!(
            "store-{:016}-{}.{}",
            data.last_rev,
            data.created_at.format("%Y-%m-%d-%H-%M-%S-%3f"),
            SNAPSHOT_EXTENSION
        )
    }

    fn checksum_path(snapshot_path: &Path) -> PathBuf {
        snapshot_path.with_extension(format!("{}.{}", SNAPSHOT_EXTENSION, CHECKSUM_EXTENSION))
    }

    fn file_checksum(path: &Path) -> Result<String> {
        let file_data = fs::read(path)?;
        Ok(format!("{:x}", Sha256::digest(&file_data)))
    }

    fn describe(path: &Path) -> Result<SnapshotDescription> {
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| anyhow!("invalid snapshot path {}", path.display()))?
            .to_string();
        let metadata = fs::metadata(path)?;
        let creation_time = metadata
            .modified()
            .ok()
            .map(|t| DateTime::<Utc>::from(t).format("%Y-%m-%dT%H:%M:%SZ").to_string());
        let checksum = fs::read_to_string(Self::checksum_path(path))
            .ok()
            .map(|s| s.trim().to_string());
        Ok(SnapshotDescription {
            name,
            creation_time,
            size: metadata.len(),
            checksum,
        })
    }

    /// Write a snapshot and its checksum, each atomically.
    pub fn create_snapshot(&self, data: &StoreSnapshotData) -> Result<SnapshotDescription> {
        let snapshot_name = Self::generate_snapshot_name(data);
        let snapshot_path = self.snapshot_dir.join(&snapshot_name);

        let json_data = serde_json::to_vec(data)?;
        AtomicFile::new(&snapshot_path, AllowOverwrite)
            .write(|f| -> std::io::Result<()> {
                let mut encoder = GzEncoder::new(f, Compression::default());
                encoder.write_all(&json_data)?;
                encoder.finish()?;
                Ok(())
            })
            .map_err(|e| anyhow!("writing snapshot {}: {}", snapshot_name, e))?;

        let checksum = Self::file_checksum(&snapshot_path)?;
        AtomicFile::new(Self::checksum_path(&snapshot_path), AllowOverwrite)
            .write(|f| f.write_all(checksum.as_bytes()))
            .map_err(|e| anyhow!("writing checksum for {}: {}", snapshot_name, e))?;

        info!(
            "Snapshot {} written: {} documents at revision {}",
            snapshot_name,
            data.documents.len(),
            data.last_rev
        );
        Self::describe(&snapshot_path)
    }

    /// All snapshots, newest first
    pub fn list_snapshots(&self) -> Result<Vec<SnapshotDescription>> {
        if !self.snapshot_dir.exists() {
            return Ok(Vec::new());
        }

        let mut snapshots = Vec::new();
        for entry in fs::read_dir(&self.snapshot_dir)? {
            let path = entry?.path();
            if path.extension().and_then(|s| s.to_str()) == Some(SNAPSHOT_EXTENSION) {
                snapshots.push(Self::describe(&path)?);
            }
        }

        snapshots.sort_by(|a, b| b.name.cmp(&a.name));
        Ok(snapshots)
    }

    /// Load a snapshot, verifying its checksum when one was recorded.
    pub fn load_snapshot(&self, snapshot_name: &str) -> Result<StoreSnapshotData> {
        let snapshot_path = self.snapshot_dir.join(snapshot_name);
        if !snapshot_path.exists() {
            return Err(anyhow!("Snapshot '{}' not found", snapshot_name));
        }

        if let Ok(expected) = fs::read_to_string(Self::checksum_path(&snapshot_path)) {
            let actual = Self::file_checksum(&snapshot_path)?;
            if actual != expected.trim() {
                return Err(anyhow!(
                    "Checksum mismatch for {}: expected {}, got {}",
                    snapshot_name,
                    expected.trim(),
                    actual
                ));
            }
        }

        let file = File::open(&snapshot_path)?;
        let mut decoder = GzDecoder::new(BufReader::new(file));
        let mut json_data = Vec::new();
        decoder.read_to_end(&mut json_data)?;

        let data: StoreSnapshotData = serde_json::from_slice(&json_data)?;
        Ok(data)
    }

    /// The newest snapshot that loads cleanly, skipping damaged ones.
    pub fn load_latest(&self) -> Result<Option<StoreSnapshotData>> {
        for description in self.list_snapshots()? {
            match self.load_snapshot(&description.name) {
                Ok(data) => return Ok(Some(data)),
                Err(e) => warn!("Skipping snapshot {}: {}", description.name, e),
            }
        }
        Ok(None)
    }

    pub fn delete_snapshot(&self, snapshot_name: &str) -> Result<bool> {
        let snapshot_path = self.snapshot_dir.join(snapshot_name);
        if !snapshot_path.exists() {
            return Ok(false);
        }
        fs::remove_file(&snapshot_path)?;
        let checksum_path = Self::checksum_path(&snapshot_path);
        if checksum_path.exists() {
            fs::remove_file(checksum_path)?;
        }
        Ok(true)
    }

    /// Keep the `keep` newest snapshots, deleting the rest.
    pub fn prune(&self, keep: usize) -> Result<usize> {
        let mut removed = 0;
        for description in self.list_snapshots()?.into_iter().skip(keep) {
            if self.delete_snapshot(&description.name)? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    pub fn get_snapshot_path(&self, snapshot_name: &str) -> Option<PathBuf> {
        let path = self.snapshot_dir.join(snapshot_name);
        if path.exists() {
            Some(path)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn data(rev: u64) -> StoreSnapshotData {
        StoreSnapshotData {
            last_rev: rev,
            documents: vec![json!({"_id": "a", "_kind": "contact", "_rev": rev})],
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_create_list_load() {
        let dir = tempfile::tempdir().unwrap();
        let snapshots = SnapshotManager::new(dir.path()).unwrap();
        let first = snapshots.create_snapshot(&data(3)).unwrap();
        let second = snapshots.create_snapshot(&data(9)).unwrap();
        assert_eq!(second.checksum.as_ref().map(String::len), Some(64));

        let listed = snapshots.list_snapshots().unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].name, second.name);

        let latest = snapshots.load_latest().unwrap().unwrap();
        assert_eq!(latest.last_rev, 9);
        assert_eq!(snapshots.load_snapshot(&first.name).unwrap().last_rev, 3);

        assert_eq!(snapshots.prune(1).unwrap(), 1);
        assert!(snapshots.get_snapshot_path(&first.name).is_none());
    }

    #[test]
    fn test_damaged_snapshot_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        let snapshots = SnapshotManager::new(dir.path()).unwrap();
        snapshots.create_snapshot(&data(3)).unwrap();
        let newest = snapshots.create_snapshot(&data(9)).unwrap();

        let path = snapshots.get_snapshot_path(&newest.name).unwrap();
        fs::write(&path, b"not gzip").unwrap();

        assert!(snapshots.load_snapshot(&newest.name).is_err());
        assert_eq!(snapshots.load_latest().unwrap().unwrap().last_rev, 3);
    }
}
