//! Workspace probing.
//!
//! Every tracked repository carries a `.boardsync/` workspace directory for
//! index output and lock files. The scheduler probes writability before
//! each run and ensures the directory shape exists; both operations are
//! idempotent.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;

/// Name of the per-repository workspace directory.
pub const WORKSPACE_DIR: &str = ".boardsync";

#[derive(Debug, Clone)]
pub struct WorkspaceInfo {
    pub writable: bool,
    pub workspace_dir: PathBuf,
}

#[async_trait]
pub trait WorkspaceProbe: Send + Sync {
    /// Probe whether the repository root can be written to.
    async fn status(&self, repo_root: &Path) -> Result<WorkspaceInfo>;

    /// Idempotently create the workspace directory shape.
    async fn ensure_workspace(&self, repo_root: &Path) -> Result<()>;
}

pub fn workspace_dir(repo_root: &Path) -> PathBuf {
    repo_root.join(WORKSPACE_DIR)
}

pub fn index_dir(repo_root: &Path) -> PathBuf {
    workspace_dir(repo_root).join("index")
}

/// Probe backed by the real filesystem: writability is checked by creating
/// and removing a probe file next to where the index will be written.
pub struct DiskWorkspace;

#[async_trait]
impl WorkspaceProbe for DiskWorkspace {
    async fn status(&self, repo_root: &Path) -> Result<WorkspaceInfo> {
        let root = repo_root.to_path_buf();
        tokio::task::spawn_blocking(move || {
            let dir = workspace_dir(&root);
            let writable = if root.is_dir() {
                let probe = root.join(".boardsync-write-probe");
                match std::fs::write(&probe, b"") {
                    Ok(()) => {
                        let _ = std::fs::remove_file(&probe);
                        true
                    }
                    Err(_) => false,
                }
            } else {
                false
            };
            Ok(WorkspaceInfo {
                writable,
                workspace_dir: dir,
            })
        })
        .await
        .context("workspace probe task panicked")?
    }

    async fn ensure_workspace(&self, repo_root: &Path) -> Result<()> {
        let dir = index_dir(repo_root);
        tokio::task::spawn_blocking(move || {
            std::fs::create_dir_all(&dir)
                .with_context(|| format!("Failed to create workspace at {}", dir.display()))
        })
        .await
        .context("workspace ensure task panicked")?
    }
}
