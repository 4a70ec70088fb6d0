//! Index-build contract and the default file indexer.
//!
//! The scheduler only depends on the `IndexBuilder` trait: a build takes a
//! repository root and a cancellation token, and reports either metadata,
//! a distinguished cancellation, or a distinguished lock conflict (another
//! process is already indexing the same repository).
//!
//! `FileIndexBuilder` is the built-in implementation: a walkdir scan that
//! writes a path/size/mtime manifest under `.boardsync/index/`. The scan is
//! deliberately simple — the interesting part is the contract behavior
//! (lock, checkpointed cancellation), not the index format.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use walkdir::WalkDir;

use crate::errors::IndexError;
use crate::workspace::{index_dir, workspace_dir, WORKSPACE_DIR};

/// Cooperative cancellation token. The build routine checks it at its own
/// checkpoints; nothing is forcibly terminated.
#[derive(Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_canceled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexMeta {
    pub files_indexed: u64,
}

#[async_trait]
pub trait IndexBuilder: Send + Sync {
    async fn build_index(
        &self,
        repo_root: &Path,
        cancel: &CancelToken,
    ) -> Result<IndexMeta, IndexError>;
}

#[derive(Debug, Serialize, Deserialize)]
struct ManifestEntry {
    path: String,
    size: u64,
    mtime_secs: i64,
}

/// How many directory entries to scan between cancellation checks.
const CANCEL_CHECK_INTERVAL: u64 = 256;

pub struct FileIndexBuilder;

impl FileIndexBuilder {
    fn scan(repo_root: &Path, cancel: &CancelToken) -> Result<IndexMeta, IndexError> {
        let ws = workspace_dir(repo_root);
        std::fs::create_dir_all(index_dir(repo_root))
            .with_context(|| format!("Failed to create index dir under {}", ws.display()))?;

        // Cross-process exclusive lock. A held lock means another instance
        // is indexing this repository right now.
        let lock_path = ws.join("index.lock");
        let lock_file = std::fs::File::create(&lock_path)
            .with_context(|| format!("Failed to open lock file {}", lock_path.display()))?;
        if lock_file.try_lock_exclusive().is_err() {
            return Err(IndexError::AlreadyRunning {
                repo_root: repo_root.display().to_string(),
            });
        }

        let mut entries = Vec::new();
        let mut seen: u64 = 0;
        for entry in WalkDir::new(repo_root).into_iter().filter_entry(|e| {
            let name = e.file_name().to_string_lossy();
            name != ".git" && name != WORKSPACE_DIR
        }) {
            seen += 1;
            if seen % CANCEL_CHECK_INTERVAL == 0 && cancel.is_canceled() {
                let _ = fs2::FileExt::unlock(&lock_file);
                return Err(IndexError::Canceled);
            }
            let entry = entry.map_err(|e| IndexError::Other(e.into()))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let meta = entry.metadata().map_err(|e| IndexError::Other(e.into()))?;
            let mtime_secs = meta
                .modified()
                .ok()
                .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                .map(|d| d.as_secs() as i64)
                .unwrap_or(0);
            let rel = entry
                .path()
                .strip_prefix(repo_root)
                .unwrap_or(entry.path())
                .display()
                .to_string();
            entries.push(ManifestEntry {
                path: rel,
                size: meta.len(),
                mtime_secs,
            });
        }

        // One last checkpoint before committing the manifest.
        if cancel.is_canceled() {
            let _ = fs2::FileExt::unlock(&lock_file);
            return Err(IndexError::Canceled);
        }

        let manifest_path = index_dir(repo_root).join("manifest.json");
        let json = serde_json::to_vec(&entries).context("Failed to serialize manifest")?;
        std::fs::write(&manifest_path, json)
            .with_context(|| format!("Failed to write {}", manifest_path.display()))?;

        let files_indexed = entries.len() as u64;
        let _ = fs2::FileExt::unlock(&lock_file);
        Ok(IndexMeta { files_indexed })
    }
}

#[async_trait]
impl IndexBuilder for FileIndexBuilder {
    async fn build_index(
        &self,
        repo_root: &Path,
        cancel: &CancelToken,
    ) -> Result<IndexMeta, IndexError> {
        if cancel.is_canceled() {
            return Err(IndexError::Canceled);
        }
        let root = repo_root.to_path_buf();
        let cancel = cancel.clone();
        tokio::task::spawn_blocking(move || Self::scan(&root, &cancel))
            .await
            .map_err(|e| IndexError::Other(anyhow::anyhow!("index task panicked: {}", e)))?
    }
}
