//! Local similarity cache: the fast first tier of identity lookup.
//!
//! An in-memory table of identity → embedding, searched by brute-force
//! cosine similarity and persisted to a JSON file. The table sits behind an
//! `Arc` that writers replace wholesale (copy-on-write), so a search always
//! runs against one consistent version: the one before a sync or the one
//! after, never a mix.
//!
//! Entries are kept ordered by identity. Results with equal scores come back
//! in identity order, which holds across restarts and syncs.

use crate::remote::{RemoteError, RemoteIndex, REMOTE_MAX_TOP_K};
use crate::types::{Embedding, EmbeddingError, Metadata};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("cache file I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("cache file encoding failed: {0}")]
    Json(#[from] serde_json::Error),
    #[error("remote index: {0}")]
    Remote(#[from] RemoteError),
    #[error("embedding rejected: {0}")]
    Embedding(#[from] EmbeddingError),
}

/// One cached identity.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub embedding: Embedding,
    pub metadata: Metadata,
    pub updated_at: DateTime<Utc>,
}

/// A search hit.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheHit {
    pub identity: String,
    pub score: f32,
    pub metadata: Metadata,
}

#[derive(Debug, Clone)]
pub struct CacheStats {
    pub entries: usize,
    pub path: PathBuf,
    pub file_exists: bool,
    pub last_modified: Option<DateTime<Utc>>,
}

/// On-disk record: `{ "embedding": [...], "metadata": {...}, "updated_at": "..." }`.
#[derive(Serialize, Deserialize)]
struct StoredEntry {
    embedding: Vec<f32>,
    #[serde(default)]
    metadata: Metadata,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    updated_at: Option<DateTime<Utc>>,
}

type Table = BTreeMap<String, CacheEntry>;

pub struct LocalSimilarityCache {
    path: PathBuf,
    table: RwLock<Arc<Table>>,
    /// Held across mutate + persist so file writes land in table order.
    writer: Mutex<()>,
}

impl LocalSimilarityCache {
    /// Open the cache backed by `path`.
    ///
    /// Never fails: a missing file gives an empty cache, an unreadable one
    /// gives an empty cache and a warning. The next sync repopulates it.
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let table = match read_table(&path) {
            Ok(Some(table)) => {
                tracing::info!(path = %path.display(), entries = table.len(), "loaded embedding cache");
                table
            }
            Ok(None) => {
                tracing::info!(path = %path.display(), "no cache file; starting with empty cache");
                Table::new()
            }
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "failed to read cache file; starting with empty cache"
                );
                Table::new()
            }
        };

        Self {
            path,
            table: RwLock::new(Arc::new(table)),
            writer: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot().is_empty()
    }

    pub fn get(&self, identity: &str) -> Option<CacheEntry> {
        self.snapshot().get(identity).cloned()
    }

    /// Up to `top_k` entries scoring at least `threshold`, best first.
    pub fn search(&self, query: &Embedding, top_k: usize, threshold: f32) -> Vec<CacheHit> {
        let table = self.snapshot();
        if table.is_empty() {
            tracing::debug!("embedding cache is empty");
            return Vec::new();
        }

        let mut hits: Vec<CacheHit> = table
            .iter()
            .filter_map(|(identity, entry)| {
                let score = query.similarity(&entry.embedding);
                (score >= threshold).then(|| CacheHit {
                    identity: identity.clone(),
                    score,
                    metadata: entry.metadata.clone(),
                })
            })
            .collect();

        // Stable sort: equal scores keep identity order.
        hits.sort_by(|a, b| b.score.total_cmp(&a.score));
        hits.truncate(top_k);
        hits
    }

    /// Insert or replace an identity, then persist.
    ///
    /// The in-memory table is updated even if writing the file fails.
    pub fn add(
        &self,
        identity: impl Into<String>,
        embedding: Embedding,
        metadata: Metadata,
    ) -> Result<(), CacheError> {
        let identity = identity.into();
        let entry = CacheEntry {
            embedding,
            metadata,
            updated_at: Utc::now(),
        };
        let ((), persisted) = self.mutate(|table| {
            table.insert(identity.clone(), entry);
        });
        tracing::info!(identity = %identity, "added embedding to cache");
        persisted
    }

    /// Remove an identity; returns whether it was present.
    pub fn remove(&self, identity: &str) -> bool {
        let (existed, persisted) = self.mutate(|table| table.remove(identity).is_some());
        if existed {
            tracing::info!(identity, "removed embedding from cache");
        }
        if let Err(e) = persisted {
            tracing::warn!(identity, error = %e, "failed to persist cache after remove");
        }
        existed
    }

    /// Replace the whole table with the remote index contents.
    ///
    /// The new table is built off to the side and swapped in at once. On a
    /// remote failure the current table is kept. Entries added locally after
    /// the pull started survive the swap. Returns the entry count.
    pub async fn sync(&self, remote: &dyn RemoteIndex) -> Result<usize, CacheError> {
        tracing::info!("syncing embedding cache from remote index");
        let started = Utc::now();
        let snapshot = remote.fetch_all(REMOTE_MAX_TOP_K).await?;

        let returned = snapshot.vectors.len();
        if returned != snapshot.reported_total {
            tracing::warn!(
                reported = snapshot.reported_total,
                returned,
                limit = REMOTE_MAX_TOP_K,
                "remote index returned a different number of vectors than it reports"
            );
        }

        let now = Utc::now();
        let mut table = Table::new();
        for vector in snapshot.vectors {
            match Embedding::new(vector.values) {
                Ok(embedding) => {
                    table.insert(
                        vector.id,
                        CacheEntry {
                            embedding,
                            metadata: vector.metadata,
                            updated_at: now,
                        },
                    );
                }
                Err(e) => {
                    tracing::warn!(id = %vector.id, error = %e, "skipping remote vector");
                }
            }
        }

        let count = self.replace(table, started);
        tracing::info!(entries = count, reported = snapshot.reported_total, "embedding cache synced");
        Ok(count)
    }

    /// Rewrite the cache file from the current table.
    pub fn flush(&self) -> Result<(), CacheError> {
        let _writer = self.writer.lock();
        let table = self.snapshot();
        self.persist(&table)
    }

    pub fn stats(&self) -> CacheStats {
        let modified = std::fs::metadata(&self.path).and_then(|m| m.modified()).ok();
        CacheStats {
            entries: self.len(),
            path: self.path.clone(),
            file_exists: self.path.exists(),
            last_modified: modified.map(DateTime::<Utc>::from),
        }
    }

    fn snapshot(&self) -> Arc<Table> {
        Arc::clone(&*self.table.read())
    }

    fn mutate<R>(&self, f: impl FnOnce(&mut Table) -> R) -> (R, Result<(), CacheError>) {
        let _writer = self.writer.lock();
        let (result, table) = {
            let mut guard = self.table.write();
            let result = f(Arc::make_mut(&mut *guard));
            (result, Arc::clone(&*guard))
        };
        (result, self.persist(&table))
    }

    /// Swap in `table`, carrying over current entries written at or after
    /// `since`.
    fn replace(&self, mut table: Table, since: DateTime<Utc>) -> usize {
        let _writer = self.writer.lock();
        let mut carried = 0usize;
        for (identity, entry) in self.snapshot().iter() {
            if entry.updated_at >= since {
                table.insert(identity.clone(), entry.clone());
                carried += 1;
            }
        }
        if carried > 0 {
            tracing::info!(carried, "kept entries added while syncing");
        }

        let table = Arc::new(table);
        *self.table.write() = Arc::clone(&table);
        if let Err(e) = self.persist(&table) {
            tracing::warn!(path = %self.path.display(), error = %e, "failed to persist synced cache");
        }
        table.len()
    }

    /// Write to a sibling temp file, then rename over the real one.
    fn persist(&self, table: &Table) -> Result<(), CacheError> {
        let stored: BTreeMap<&str, StoredEntry> = table
            .iter()
            .map(|(identity, entry)| {
                (
                    identity.as_str(),
                    StoredEntry {
                        embedding: entry.embedding.values().to_vec(),
                        metadata: entry.metadata.clone(),
                        updated_at: Some(entry.updated_at),
                    },
                )
            })
            .collect();
        let bytes = serde_json::to_vec(&stored)?;

        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir)?;
        }
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        std::fs::write(&tmp, &bytes)?;
        std::fs::rename(&tmp, &self.path)?;

        tracing::debug!(path = %self.path.display(), entries = table.len(), "persisted embedding cache");
        Ok(())
    }
}

/// `Ok(None)` when the file does not exist.
fn read_table(path: &Path) -> Result<Option<Table>, CacheError> {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let stored: BTreeMap<String, StoredEntry> = serde_json::from_slice(&bytes)?;

    let now = Utc::now();
    let mut table = Table::new();
    for (identity, entry) in stored {
        match Embedding::new(entry.embedding) {
            Ok(embedding) => {
                table.insert(
                    identity,
                    CacheEntry {
                        embedding,
                        metadata: entry.metadata,
                        updated_at: entry.updated_at.unwrap_or(now),
                    },
                );
            }
            Err(e) => {
                tracing::warn!(identity = %identity, error = %e, "skipping cached entry");
            }
        }
    }
    Ok(Some(table))
}
