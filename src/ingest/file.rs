//! Append-only JSON Lines sink, deduplicated on `idempotency_key`.
//!
//! Opening the file replays it into an in-memory key index. A torn final line
//! (crash mid-append) is truncated away; corruption anywhere else is an error.

use super::{DeliverySink, IngestRecord};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredRecord {
    #[serde(flatten)]
    pub record: IngestRecord,
    pub stored_at: DateTime<Utc>,
}

struct Store {
    file: File,
    keys: HashSet<String>,
}

#[derive(Clone)]
pub struct FileSink {
    path: PathBuf,
    store: Arc<Mutex<Store>>,
}

impl FileSink {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }

        let (keys, valid_len) = replay(&path)?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("Failed to open {}", path.display()))?;
        let len = file.metadata()?.len();
        if valid_len < len {
            warn!(
                "Truncating torn record at end of {} ({} -> {} bytes)",
                path.display(),
                len,
                valid_len
            );
            file.set_len(valid_len)?;
        }
        info!("Opened {} with {} stored records", path.display(), keys.len());

        Ok(Self {
            path,
            store: Arc::new(Mutex::new(Store { file, keys })),
        })
    }

    pub fn len(&self) -> usize {
        self.lock().keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, key: &str) -> bool {
        self.lock().keys.contains(key)
    }

    /// Reads every stored record back from disk.
    pub fn load_all(&self) -> Result<Vec<StoredRecord>> {
        let content = fs::read_to_string(&self.path)?;
        content
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| {
                serde_json::from_str::<StoredRecord>(line).context("Failed to parse stored record")
            })
            .collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Store> {
        self.store.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl DeliverySink for FileSink {
    async fn write(&self, record: &IngestRecord) -> Result<()> {
        let store = self.store.clone();
        let record = record.clone();
        tokio::task::spawn_blocking(move || -> Result<()> {
            let mut guard = store.lock().unwrap_or_else(|e| e.into_inner());
            if guard.keys.contains(&record.idempotency_key) {
                return Ok(());
            }
            let line = serde_json::to_string(&StoredRecord {
                record: record.clone(),
                stored_at: Utc::now(),
            })?;
            append_or_rollback(&mut guard.file, |file| {
                writeln!(file, "{}", line)?;
                file.sync_data()
            })?;
            guard.keys.insert(record.idempotency_key);
            Ok(())
        })
        .await
        .map_err(|e| anyhow!("File sink task failed: {}", e))?
    }
}

/// Runs `append` against the file. If it fails, the file is cut back to its
/// previous length, so no partial or unsynced line is left for a retry to
/// duplicate or join onto.
fn append_or_rollback(
    file: &mut File,
    append: impl FnOnce(&mut File) -> io::Result<()>,
) -> io::Result<()> {
    let len = file.metadata()?.len();
    if let Err(e) = append(file) {
        if let Err(rollback) = file.set_len(len) {
            warn!("Failed to roll back partial append: {}", rollback);
        }
        return Err(e);
    }
    Ok(())
}

/// Returns the stored keys and the length of the valid prefix of the file.
fn replay(path: &Path) -> Result<(HashSet<String>, u64)> {
    let content = match fs::read(path) {
        Ok(c) => c,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok((HashSet::new(), 0)),
        Err(e) => return Err(e).with_context(|| format!("Failed to read {}", path.display())),
    };

    let mut keys = HashSet::new();
    let mut valid_len = 0u64;
    let chunks: Vec<&[u8]> = content.split_inclusive(|b| *b == b'\n').collect();
    for (idx, chunk) in chunks.iter().enumerate() {
        let is_last = idx + 1 == chunks.len();
        if !chunk.ends_with(b"\n") {
            break;
        }
        let line = &chunk[..chunk.len() - 1];
        if line.iter().all(u8::is_ascii_whitespace) {
            valid_len += chunk.len() as u64;
            continue;
        }
        match serde_json::from_slice::<StoredRecord>(line) {
            Ok(stored) => {
                keys.insert(stored.record.idempotency_key);
                valid_len += chunk.len() as u64;
            }
            Err(_) if is_last => break,
            Err(e) => {
                return Err(anyhow!(
                    "Corrupt record on line {} of {}: {}",
                    idx + 1,
                    path.display(),
                    e
                ))
            }
        }
    }
    Ok((keys, valid_len))
}
