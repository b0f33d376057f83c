use anyhow::{Context, Result};
use parking_lot::Mutex;
use serde_json::Value;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::warn;

/// Append-only log of written documents, one JSON object per line.
///
/// Every line is a document exactly as stored, revision included, so
/// replaying the log in order reproduces the store.
pub struct WriteAheadLog {
    file: Arc<Mutex<BufWriter<File>>>,
    raw_file: Arc<Mutex<File>>,
    path: PathBuf,
}

impl WriteAheadLog {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("opening WAL at {}", path.display()))?;
        let raw_file = file.try_clone()?;

        Ok(Self {
            file: Arc::new(Mutex::new(BufWriter::new(file))),
            raw_file: Arc::new(Mutex::new(raw_file)),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one record
    #[inline]
    pub fn append(&self, data: &[u8]) -> Result<()> {
        let mut writer = self.file.lock();
        writer.write_all(data)?;
        writer.write_all(b"\n")?;
        writer.flush()?;
        Ok(())
    }

    pub fn append_documents(&self, docs: &[Value]) -> Result<()> {
        if docs.is_empty() {
            return Ok(());
        }
        let mut writer = self.file.lock();
        for doc in docs {
            serde_json::to_writer(&mut *writer, doc)?;
            writer.write_all(b"\n")?;
        }
        writer.flush()?;
        Ok(())
    }

    /// Flush and fdatasync
    #[inline]
    pub fn sync(&self) -> Result<()> {
        let mut writer = self.file.lock();
        writer.flush()?;
        let raw = self.raw_file.lock();
        raw.sync_data()?;
        Ok(())
    }

    /// Drop every record. Called once a snapshot covers them.
    pub fn truncate(&self) -> Result<()> {
        let mut writer = self.file.lock();
        writer.flush()?;
        let raw = self.raw_file.lock();
        raw.set_len(0)?;
        raw.sync_all()?;
        Ok(())
    }

    /// Read back every complete record. A torn final line is skipped.
    pub fn replay<P: AsRef<Path>>(path: P) -> Result<WalReplay> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(WalReplay::default());
        }
        let mut reader = BufReader::new(File::open(path)?);
        let mut replay = WalReplay::default();
        let mut offset = 0u64;
        let mut line_no = 0;
        let mut buf = Vec::new();
        loop {
            buf.clear();
            let read = reader.read_until(b'\n', &mut buf)?;
            if read == 0 {
                break;
            }
            line_no += 1;
            let terminated = buf.last() == Some(&b'\n');
            let line = String::from_utf8_lossy(&buf);
            if line.trim().is_empty() {
                offset += read as u64;
                replay.valid_len = offset;
                continue;
            }
            match serde_json::from_str::<Value>(line.trim_end()) {
                Ok(doc) if terminated => {
                    offset += read as u64;
                    replay.valid_len = offset;
                    replay.documents.push(doc);
                }
                Ok(_) => {
                    warn!("Ignoring unterminated WAL record at line {}", line_no);
                    break;
                }
                Err(e) => {
                    if reader.fill_buf()?.is_empty() {
                        warn!("Ignoring torn WAL record at line {}: {}", line_no, e);
                        break;
                    }
                    return Err(e).with_context(|| {
                        format!("corrupt WAL record at {}:{}", path.display(), line_no)
                    });
                }
            }
        }
        Ok(replay)
    }

    /// Cut the file back to `valid_len` bytes, dropping a torn tail left by a crash.
    pub fn discard_torn_tail<P: AsRef<Path>>(path: P, valid_len: u64) -> Result<bool> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(false);
        }
        let file = OpenOptions::new().write(true).open(path)?;
        let len = file.metadata()?.len();
        if len <= valid_len {
            return Ok(false);
        }
        warn!(
            "Discarding {} torn bytes at the end of {}",
            len - valid_len,
            path.display()
        );
        file.set_len(valid_len)?;
        file.sync_all()?;
        Ok(true)
    }
}

/// Records recovered from a log, and the length of its intact prefix.
#[derive(Debug, Default)]
pub struct WalReplay {
    pub documents: Vec<Value>,
    pub valid_len: u64,
}
