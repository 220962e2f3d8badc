//! Snapshot persistence
//!
//! A snapshot is one JSON object holding the flat key→value mapping of a
//! store. The same format backs the per-node LRU snapshot and the master's
//! disaster-recovery backup. Writes go to a sibling temp file that is
//! renamed over the target, so readers never see a half-written file.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use shardcache_core::types::Mappings;
use shardcache_core::{Error, Result};

use crate::lru::LruStore;

/// Encoder/decoder for whole-store snapshots
pub struct SnapshotCodec;

impl SnapshotCodec {
    /// Persist the current contents of `store` to `path`
    pub async fn save(store: &LruStore, path: impl AsRef<Path>) -> Result<usize> {
        let mappings = store.mappings();
        Self::save_mappings(&mappings, path).await?;
        Ok(mappings.len())
    }

    /// Persist an arbitrary mapping to `path`, replacing any previous content
    pub async fn save_mappings(mappings: &Mappings, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let encoded = Self::encode(mappings)?;

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }

        let tmp = temp_path(path);
        if let Err(e) = write_and_rename(&tmp, path, &encoded).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(e.into());
        }

        debug!("Saved {} mappings to {:?}", mappings.len(), path);
        Ok(())
    }

    /// Read a snapshot back into a mapping
    pub async fn load(path: impl AsRef<Path>) -> Result<Mappings> {
        let path = path.as_ref();
        let bytes = match fs::read(path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::SnapshotNotFound(path.display().to_string()));
            }
            Err(e) => return Err(e.into()),
        };

        let mappings = Self::decode(&bytes)?;
        debug!("Loaded {} mappings from {:?}", mappings.len(), path);
        Ok(mappings)
    }

    /// Load `path` into `store`, replacing its contents. Recency order of
    /// the original store is not reproduced.
    pub async fn restore(store: &LruStore, path: impl AsRef<Path>) -> Result<usize> {
        let mappings = Self::load(path.as_ref()).await?;
        let count = mappings.len();
        store.restore(mappings);
        info!("Restored {} entries from {:?}", count, path.as_ref());
        Ok(count)
    }

    pub fn encode(mappings: &Mappings) -> Result<Vec<u8>> {
        serde_json::to_vec(mappings)
            .map_err(|e| Error::InternalError(format!("Failed to encode snapshot: {}", e)))
    }

    pub fn decode(bytes: &[u8]) -> Result<Mappings> {
        serde_json::from_slice(bytes).map_err(|e| Error::CorruptSnapshot(e.to_string()))
    }
}

async fn write_and_rename(tmp: &Path, path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut file = fs::File::create(tmp).await?;
    file.write_all(bytes).await?;
    file.sync_all().await?;
    drop(file);
    fs::rename(tmp, path).await
}

static TEMP_SEQ: AtomicU64 = AtomicU64::new(0);

/// Sibling temp file, unique per write so concurrent saves never share one
fn temp_path(path: &Path) -> PathBuf {
    let seq = TEMP_SEQ.fetch_add(1, Ordering::Relaxed);
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(format!(".{}.{}.tmp", std::process::id(), seq));
    path.with_file_name(name)
}
