//! Content-addressed Cache Store
//!
//! Maps a [`Fingerprint`] to a previously produced artifact so that resumed
//! or repeated runs skip work that already completed.
//!
//! ## Layout
//!
//! ```text
//! <cache_dir>/index.db                  persisted fingerprint index
//! <cache_dir>/artifacts/<fp>.<ext>      content-addressed artifacts
//! <cache_dir>/artifacts/<fp>.part.<ext> in-progress worker output
//! ```
//!
//! ## Guarantees
//!
//! - A hit is only reported for an existing, non-empty file; dangling entries
//!   are evicted on lookup.
//! - [`CacheStore::store`] renames the artifact into place before the index row
//!   is written, so a concurrent lookup sees either the old entry or the
//!   complete new one.
//! - [`CacheStore::claim`] serializes producers per fingerprint: two jobs with
//!   the same key never both run the underlying worker.
//! - An unreadable index is discarded and recreated empty.

use crate::config::CacheConfig;
use crate::error::{Error, Result};
use crate::utils;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::sync::OwnedMutexGuard;

pub mod fingerprint;
mod index;


pub use fingerprint::{Fingerprint, NormalizeTarget};
pub use index::{CacheIndex, IndexEntry};

/// Artifact category, recorded in the index
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ArtifactKind {
    /// Download stage output
    Raw,
    /// Normalize stage output
    Normalized,
}

impl ArtifactKind {
    fn as_str(self) -> &'static str {
        match self {
            ArtifactKind::Raw => "raw",
            ArtifactKind::Normalized => "normalized",
        }
    }
}

type ProducerLocks = HashMap<Fingerprint, Arc<tokio::sync::Mutex<()>>>;

/// Process-wide shared cache of stage artifacts
pub struct CacheStore {
    index: CacheIndex,
    artifact_dir: PathBuf,
    producers: Arc<Mutex<ProducerLocks>>,
}

impl std::fmt::Debug for CacheStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheStore")
            .field("artifact_dir", &self.artifact_dir)
            .finish_non_exhaustive()
    }
}

impl CacheStore {
    /// Open (or create) the cache rooted at `config.cache_dir`
    pub async fn open(config: &CacheConfig) -> Result<Self> {
        let artifact_dir = config.artifact_dir();
        tokio::fs::create_dir_all(&artifact_dir).await?;
        let index = CacheIndex::open_or_recover(&config.index_path()).await?;

        tracing::debug!(cache_dir = %config.cache_dir.display(), "cache store opened");

        Ok(Self {
            index,
            artifact_dir,
            producers: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    /// Directory holding artifacts
    pub fn artifact_dir(&self) -> &Path {
        &self.artifact_dir
    }

    /// Final location of the artifact for `fingerprint`
    pub fn artifact_path(&self, fingerprint: &Fingerprint, extension: &str) -> PathBuf {
        self.artifact_dir
            .join(format!("{}.{}", fingerprint.as_str(), extension))
    }

    /// Where a worker should write output for `fingerprint` before it is stored
    pub fn staging_path(&self, fingerprint: &Fingerprint, extension: &str) -> PathBuf {
        utils::part_path(&self.artifact_path(fingerprint, extension))
    }

    /// Artifact for `fingerprint`, if indexed and still present on disk
    ///
    /// Index read failures are reported as a miss.
    pub async fn lookup(&self, fingerprint: &Fingerprint) -> Option<PathBuf> {
        let entry = match self.index.get(fingerprint).await {
            Ok(Some(entry)) => entry,
            Ok(None) => return None,
            Err(e) => {
                tracing::warn!(fingerprint = %fingerprint.short(), error = %e, "cache lookup failed, treating as miss");
                return None;
            }
        };

        let path = entry.artifact_path();
        if utils::nonempty_file_size(&path).await.is_some() {
            tracing::debug!(fingerprint = %fingerprint.short(), path = %path.display(), "cache hit");
            return Some(path);
        }

        tracing::info!(
            fingerprint = %fingerprint.short(),
            path = %path.display(),
            "evicting cache entry whose artifact is missing or empty"
        );
        if let Err(e) = self.index.remove(fingerprint).await {
            tracing::warn!(fingerprint = %fingerprint.short(), error = %e, "failed to evict dangling entry");
        }
        None
    }

    /// Move `produced` into the cache under `fingerprint` and index it
    ///
    /// Rejects missing or empty files. Returns the artifact's final path.
    pub async fn store(
        &self,
        fingerprint: &Fingerprint,
        produced: &Path,
        kind: ArtifactKind,
    ) -> Result<PathBuf> {
        let size = utils::nonempty_file_size(produced).await.ok_or_else(|| {
            Error::Other(format!(
                "refusing to cache missing or empty artifact {}",
                produced.display()
            ))
        })?;

        let extension = produced
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("bin");
        let dest = self.artifact_path(fingerprint, extension);

        if produced != dest {
            utils::move_file(produced, &dest).await?;
        }
        self.index.put(fingerprint, &dest, size, kind.as_str()).await?;

        tracing::debug!(
            fingerprint = %fingerprint.short(),
            path = %dest.display(),
            size_bytes = size,
            kind = kind.as_str(),
            "artifact cached"
        );
        Ok(dest)
    }

    /// Forget every indexed entry, returning how many were removed
    ///
    /// Artifact files are left on disk.
    pub async fn evict_all(&self) -> Result<u64> {
        let removed = self.index.clear().await?;
        tracing::info!(removed, "cache index cleared");
        Ok(removed)
    }

    /// Number of indexed entries
    pub async fn len(&self) -> Result<i64> {
        self.index.count().await
    }

    /// Whether the index is empty
    pub async fn is_empty(&self) -> Result<bool> {
        Ok(self.len().await? == 0)
    }

    /// All indexed entries
    pub async fn entries(&self) -> Result<Vec<IndexEntry>> {
        self.index.entries().await
    }

    /// Become the only producer for `fingerprint`
    ///
    /// Waits while another task holds the claim. Callers must re-check
    /// [`lookup`](Self::lookup) after acquiring it, since the previous holder
    /// may have just stored the artifact.
    pub async fn claim(&self, fingerprint: &Fingerprint) -> ProducerClaim {
        let lock = {
            let mut producers = self
                .producers
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            producers
                .entry(fingerprint.clone())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };

        let guard = lock.lock_owned().await;
        ProducerClaim {
            fingerprint: fingerprint.clone(),
            producers: Arc::clone(&self.producers),
            guard: Some(guard),
        }
    }

    /// Close the index connection
    pub async fn close(&self) {
        self.index.close().await;
    }
}

/// Exclusive right to produce one fingerprint; released on drop
#[must_use = "the claim is released as soon as it is dropped"]
pub struct ProducerClaim {
    fingerprint: Fingerprint,
    producers: Arc<Mutex<ProducerLocks>>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for ProducerClaim {
    fn drop(&mut self) {
        // Release the lock before deciding whether the map entry is still needed
        self.guard.take();
        let mut producers = self
            .producers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(lock) = producers.get(&self.fingerprint)
            && Arc::strong_count(lock) == 1
        {
            producers.remove(&self.fingerprint);
        }
    }
}
