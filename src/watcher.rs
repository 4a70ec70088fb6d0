//! File-watch contract and a polling implementation.
//!
//! The scheduler subscribes a watcher per enabled project; the watcher
//! emits a debounced event whenever the repository tree changes, and the
//! scheduler turns each event into a `fswatch` index request.
//!
//! `MtimeWatcher` polls a cheap fingerprint of the tree (file count plus
//! newest mtime) on an interval. Polling keeps the dependency surface flat
//! and the debounce implicit: at most one event per poll tick.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use walkdir::WalkDir;

use crate::workspace::WORKSPACE_DIR;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatchEvent {
    pub project_id: i64,
}

/// Handle to an active watch subscription. Dropping it stops the watch.
pub struct WatchHandle {
    task: JoinHandle<()>,
}

impl WatchHandle {
    pub fn new(task: JoinHandle<()>) -> Self {
        Self { task }
    }

    pub fn stop(&self) {
        self.task.abort();
    }
}

impl Drop for WatchHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[async_trait]
pub trait FileWatcher: Send + Sync {
    async fn watch(
        &self,
        project_id: i64,
        repo_root: &Path,
        events: mpsc::UnboundedSender<WatchEvent>,
    ) -> Result<WatchHandle>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Fingerprint {
    file_count: u64,
    newest_mtime_secs: i64,
}

fn fingerprint(repo_root: &Path) -> Fingerprint {
    let mut file_count = 0u64;
    let mut newest = 0i64;
    for entry in WalkDir::new(repo_root)
        .into_iter()
        .filter_entry(|e| {
            let name = e.file_name().to_string_lossy();
            name != ".git" && name != WORKSPACE_DIR
        })
        .flatten()
    {
        if !entry.file_type().is_file() {
            continue;
        }
        file_count += 1;
        if let Ok(meta) = entry.metadata() {
            let mtime = meta
                .modified()
                .ok()
                .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                .map(|d| d.as_secs() as i64)
                .unwrap_or(0);
            newest = newest.max(mtime);
        }
    }
    Fingerprint {
        file_count,
        newest_mtime_secs: newest,
    }
}

pub struct MtimeWatcher {
    poll_interval: Duration,
}

impl MtimeWatcher {
    pub fn new(poll_interval: Duration) -> Self {
        Self { poll_interval }
    }
}

impl Default for MtimeWatcher {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}

#[async_trait]
impl FileWatcher for MtimeWatcher {
    async fn watch(
        &self,
        project_id: i64,
        repo_root: &Path,
        events: mpsc::UnboundedSender<WatchEvent>,
    ) -> Result<WatchHandle> {
        let root: PathBuf = repo_root.to_path_buf();
        let interval = self.poll_interval;

        let baseline = {
            let root = root.clone();
            tokio::task::spawn_blocking(move || fingerprint(&root))
                .await
                .context("fingerprint task panicked")?
        };

        let task = tokio::spawn(async move {
            let mut previous = baseline;
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await; // first tick fires immediately
            loop {
                ticker.tick().await;
                let scan_root = root.clone();
                let current =
                    match tokio::task::spawn_blocking(move || fingerprint(&scan_root)).await {
                        Ok(fp) => fp,
                        Err(e) => {
                            tracing::warn!(project_id, "fingerprint scan panicked: {}", e);
                            continue;
                        }
                    };
                if current != previous {
                    previous = current;
                    if events.send(WatchEvent { project_id }).is_err() {
                        // Receiver gone; the scheduler was shut down.
                        return;
                    }
                }
            }
        });

        Ok(WatchHandle { task })
    }
}
