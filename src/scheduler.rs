//! Index refresh scheduling.
//!
//! One `IndexScheduler` owns the per-project scheduling state for the whole
//! process. Per project it guarantees:
//!
//! - at most one index run in flight;
//! - requests arriving during a run coalesce into a single follow-up
//!   (a backlog of at most one, never more);
//! - disabling clears the backlog and tears down the timer and file watch,
//!   while an in-flight run is only asked to stop cooperatively.
//!
//! All triggers — manual, focus change, periodic timer, file watch, and the
//! coalesced follow-up itself — funnel through one mpsc request channel into
//! a dispatcher task, so a finishing run re-submits its follow-up instead of
//! recursing.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::broadcast::ChangeNotifier;
use crate::db::DbHandle;
use crate::errors::IndexError;
use crate::indexer::{CancelToken, IndexBuilder};
use crate::models::{JobState, JobType};
use crate::watcher::{FileWatcher, WatchEvent, WatchHandle};
use crate::workspace::WorkspaceProbe;

/// Why an index run was requested. Manual reasons bypass the enabled guard.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexReason {
    Focus,
    Manual,
    ManualEnabled,
    Coalesced,
    FsWatch,
    ActivePeriodic,
    BackgroundPeriodic,
}

impl IndexReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Focus => "focus",
            Self::Manual => "manual",
            Self::ManualEnabled => "manual:enabled",
            Self::Coalesced => "coalesced",
            Self::FsWatch => "fswatch",
            Self::ActivePeriodic => "active:periodic",
            Self::BackgroundPeriodic => "background:periodic",
        }
    }

    /// Explicit user requests run even while the project is disabled.
    pub fn is_manual(&self) -> bool {
        matches!(self, Self::Manual | Self::ManualEnabled)
    }
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Recurring interval while the project has UI focus.
    pub active_interval: Duration,
    /// Recurring interval for unfocused projects.
    pub background_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            active_interval: Duration::from_secs(60),
            background_interval: Duration::from_secs(600),
        }
    }
}

/// Observable per-project flags, mainly for diagnostics and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProjectFlags {
    pub enabled: bool,
    pub active: bool,
    pub in_progress: bool,
    pub pending: bool,
}

struct ProjectState {
    repo_root: PathBuf,
    enabled: bool,
    active: bool,
    in_progress: bool,
    pending: bool,
    cancel: CancelToken,
    last_run_at: Option<String>,
    periodic: Option<JoinHandle<()>>,
    watch: Option<WatchHandle>,
}

impl ProjectState {
    fn new(repo_root: PathBuf) -> Self {
        Self {
            repo_root,
            enabled: false,
            active: false,
            in_progress: false,
            pending: false,
            cancel: CancelToken::new(),
            last_run_at: None,
            periodic: None,
            watch: None,
        }
    }

    fn stop_periodic(&mut self) {
        if let Some(handle) = self.periodic.take() {
            handle.abort();
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct IndexRequest {
    project_id: i64,
    reason: IndexReason,
}

struct Inner {
    db: DbHandle,
    builder: Arc<dyn IndexBuilder>,
    workspace: Arc<dyn WorkspaceProbe>,
    watcher: Arc<dyn FileWatcher>,
    notifier: ChangeNotifier,
    config: SchedulerConfig,
    projects: Mutex<HashMap<i64, ProjectState>>,
    active_project: Mutex<Option<i64>>,
    tx: mpsc::UnboundedSender<IndexRequest>,
    watch_tx: mpsc::UnboundedSender<WatchEvent>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

#[derive(Clone)]
pub struct IndexScheduler {
    inner: Arc<Inner>,
}

impl IndexScheduler {
    pub fn new(
        db: DbHandle,
        builder: Arc<dyn IndexBuilder>,
        workspace: Arc<dyn WorkspaceProbe>,
        watcher: Arc<dyn FileWatcher>,
        notifier: ChangeNotifier,
        config: SchedulerConfig,
    ) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<IndexRequest>();
        let (watch_tx, mut watch_rx) = mpsc::unbounded_channel::<WatchEvent>();

        let inner = Arc::new(Inner {
            db,
            builder,
            workspace,
            watcher,
            notifier,
            config,
            projects: Mutex::new(HashMap::new()),
            active_project: Mutex::new(None),
            tx: tx.clone(),
            watch_tx,
            tasks: Mutex::new(Vec::new()),
        });

        // Dispatcher: every trigger becomes its own task; the per-project
        // in_progress guard inside run_index serializes same-project work.
        let dispatch_inner = Arc::clone(&inner);
        let dispatcher = tokio::spawn(async move {
            while let Some(req) = rx.recv().await {
                let inner = Arc::clone(&dispatch_inner);
                tokio::spawn(async move {
                    run_index(&inner, req.project_id, req.reason).await;
                });
            }
        });

        // File-watch events map onto fswatch index requests.
        let forward_tx = tx;
        let forwarder = tokio::spawn(async move {
            while let Some(event) = watch_rx.recv().await {
                let _ = forward_tx.send(IndexRequest {
                    project_id: event.project_id,
                    reason: IndexReason::FsWatch,
                });
            }
        });

        if let Ok(mut tasks) = inner.tasks.lock() {
            tasks.push(dispatcher);
            tasks.push(forwarder);
        }

        Self { inner }
    }

    /// Load every project whose persisted auto-index setting is on and
    /// bring it under scheduling.
    pub async fn start(&self) -> Result<()> {
        let projects = self.inner.db.call(|db| db.list_auto_index_projects()).await?;
        for project in projects {
            self.register_project(project.id, Path::new(&project.repo_root));
            self.set_indexing_enabled(project.id, true).await?;
        }
        Ok(())
    }

    pub fn register_project(&self, project_id: i64, repo_root: &Path) {
        if let Ok(mut projects) = self.inner.projects.lock() {
            projects
                .entry(project_id)
                .or_insert_with(|| ProjectState::new(repo_root.to_path_buf()));
        }
    }

    pub fn unregister_project(&self, project_id: i64) {
        if let Ok(mut projects) = self.inner.projects.lock() {
            if let Some(mut state) = projects.remove(&project_id) {
                state.cancel.cancel();
                state.stop_periodic();
                state.watch.take();
            }
        }
    }

    /// The main lifecycle transition.
    pub async fn set_indexing_enabled(&self, project_id: i64, enabled: bool) -> Result<()> {
        if enabled {
            self.enable(project_id).await?;
        } else {
            self.disable(project_id).await?;
        }
        Ok(())
    }

    async fn enable(&self, project_id: i64) -> Result<()> {
        let repo_root = {
            let focused = self
                .inner
                .active_project
                .lock()
                .map(|g| *g)
                .unwrap_or(None);
            let mut projects = lock_projects(&self.inner)?;
            let state = projects
                .get_mut(&project_id)
                .ok_or_else(|| anyhow::anyhow!("Project {} is not registered", project_id))?;
            state.enabled = true;
            state.cancel = CancelToken::new();
            state.active = focused == Some(project_id);
            state.repo_root.clone()
        };

        // File changes trigger fswatch runs for as long as the project
        // stays enabled.
        let watch = self
            .inner
            .watcher
            .watch(project_id, &repo_root, self.inner.watch_tx.clone())
            .await?;
        if let Ok(mut projects) = self.inner.projects.lock() {
            if let Some(state) = projects.get_mut(&project_id) {
                state.watch = Some(watch);
            }
        }

        self.set_periodic(project_id);

        self.inner
            .db
            .call(move |db| db.set_auto_index(project_id, true))
            .await?;

        // Verify the workspace off the enable path, then kick an initial run.
        let inner = Arc::clone(&self.inner);
        let repo_root_for_probe = repo_root.clone();
        let probe = tokio::spawn(async move {
            match inner.workspace.status(&repo_root_for_probe).await {
                Ok(info) if info.writable => {
                    if let Err(e) = inner.workspace.ensure_workspace(&repo_root_for_probe).await {
                        tracing::warn!(project_id, "failed to prepare workspace: {:#}", e);
                        return;
                    }
                    let _ = inner.tx.send(IndexRequest {
                        project_id,
                        reason: IndexReason::ManualEnabled,
                    });
                }
                Ok(_) => {
                    tracing::info!(project_id, "workspace not writable, skipping initial index");
                }
                Err(e) => {
                    tracing::warn!(project_id, "workspace probe failed: {:#}", e);
                }
            }
        });
        if let Ok(mut tasks) = self.inner.tasks.lock() {
            tasks.push(probe);
        }

        self.inner.notifier.notify();
        Ok(())
    }

    async fn disable(&self, project_id: i64) -> Result<()> {
        {
            let mut projects = lock_projects(&self.inner)?;
            if let Some(state) = projects.get_mut(&project_id) {
                state.enabled = false;
                // Ask any in-flight build to stop at its next checkpoint.
                state.cancel.cancel();
                state.pending = false;
                state.stop_periodic();
                state.watch.take();
            }
        }

        self.inner
            .db
            .call(move |db| db.set_auto_index(project_id, false))
            .await?;

        self.inner.notifier.notify();
        Ok(())
    }

    /// Record which single project has UI focus, recompute every project's
    /// cadence, and kick an immediate run for the newly focused project.
    pub fn set_active_project(&self, project_id: Option<i64>) {
        if let Ok(mut focused) = self.inner.active_project.lock() {
            *focused = project_id;
        }

        let tracked: Vec<i64> = match self.inner.projects.lock() {
            Ok(mut projects) => {
                for (id, state) in projects.iter_mut() {
                    state.active = project_id == Some(*id);
                }
                projects.keys().copied().collect()
            }
            Err(_) => return,
        };
        for id in tracked {
            self.set_periodic(id);
        }

        if let Some(id) = project_id {
            let _ = self.inner.tx.send(IndexRequest {
                project_id: id,
                reason: IndexReason::Focus,
            });
        }
    }

    /// Fire-and-forget trigger. With a manual reason this bypasses the
    /// enabled guard.
    pub fn request_index_now(&self, project_id: i64, reason: IndexReason) {
        let _ = self.inner.tx.send(IndexRequest { project_id, reason });
    }

    /// Recompute the recurring timer for one project: cancel the old handle
    /// and, if the project is enabled, schedule at the focused or background
    /// cadence.
    fn set_periodic(&self, project_id: i64) {
        let Ok(mut projects) = self.inner.projects.lock() else {
            return;
        };
        let Some(state) = projects.get_mut(&project_id) else {
            return;
        };
        state.stop_periodic();
        if !state.enabled {
            return;
        }

        let (interval, reason) = if state.active {
            (self.inner.config.active_interval, IndexReason::ActivePeriodic)
        } else {
            (
                self.inner.config.background_interval,
                IndexReason::BackgroundPeriodic,
            )
        };

        let tx = self.inner.tx.clone();
        state.periodic = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await; // the immediate first tick is not a run
            loop {
                ticker.tick().await;
                if tx.send(IndexRequest { project_id, reason }).is_err() {
                    return;
                }
            }
        }));
    }

    pub fn project_flags(&self, project_id: i64) -> Option<ProjectFlags> {
        let projects = self.inner.projects.lock().ok()?;
        projects.get(&project_id).map(|s| ProjectFlags {
            enabled: s.enabled,
            active: s.active,
            in_progress: s.in_progress,
            pending: s.pending,
        })
    }

    /// Stop all background tasks. In-flight builds are asked to cancel
    /// cooperatively; they still drive their jobs to a terminal state.
    pub fn shutdown(&self) {
        if let Ok(mut tasks) = self.inner.tasks.lock() {
            for task in tasks.drain(..) {
                task.abort();
            }
        }
        if let Ok(mut projects) = self.inner.projects.lock() {
            for state in projects.values_mut() {
                state.cancel.cancel();
                state.stop_periodic();
                state.watch.take();
            }
        }
    }
}

fn lock_projects(inner: &Inner) -> Result<std::sync::MutexGuard<'_, HashMap<i64, ProjectState>>> {
    inner
        .projects
        .lock()
        .map_err(|e| anyhow::anyhow!("scheduler state lock poisoned: {}", e))
}

/// The per-project run state machine. Never lets an error escape: every
/// outcome terminates the job and clears `in_progress`.
async fn run_index(inner: &Arc<Inner>, project_id: i64, reason: IndexReason) {
    // Claim the run, or coalesce into the one already in flight.
    let (repo_root, cancel) = {
        let Ok(mut projects) = inner.projects.lock() else {
            tracing::error!(project_id, "scheduler state lock poisoned, dropping request");
            return;
        };
        let Some(state) = projects.get_mut(&project_id) else {
            return;
        };
        if !state.enabled && !reason.is_manual() {
            return;
        }
        if state.in_progress {
            state.pending = true;
            return;
        }
        state.in_progress = true;
        state.pending = false;
        state.cancel = CancelToken::new();
        state.last_run_at = Some(Utc::now().to_rfc3339());
        (state.repo_root.clone(), state.cancel.clone())
    };

    tracing::debug!(project_id, reason = reason.as_str(), "index run starting");

    let payload = serde_json::json!({ "reason": reason.as_str() });
    let job = match inner
        .db
        .call(move |db| db.create_job(project_id, JobType::IndexRefresh, None, Some(&payload)))
        .await
    {
        Ok(job) => job,
        Err(e) => {
            tracing::error!(project_id, "failed to create index job: {:#}", e);
            clear_in_progress(inner, project_id);
            return;
        }
    };
    inner.notifier.notify();

    let (state_out, result_out, error_out, retry) = execute_run(inner, &repo_root, &cancel).await;

    let job_id = job.id;
    let error_clone = error_out.clone();
    if let Err(e) = inner
        .db
        .call(move |db| {
            db.update_job_state(job_id, state_out, result_out.as_ref(), error_clone.as_deref())
        })
        .await
    {
        tracing::error!(project_id, job_id, "failed to finish index job: {:#}", e);
    }
    if let Some(msg) = error_out {
        tracing::info!(
            project_id,
            job_id,
            state = state_out.as_str(),
            "index run ended: {}",
            msg
        );
    }
    inner.notifier.notify();

    // Release the guard and re-submit the coalesced follow-up, if any.
    let resubmit = {
        let Ok(mut projects) = inner.projects.lock() else {
            return;
        };
        let Some(state) = projects.get_mut(&project_id) else {
            return;
        };
        state.in_progress = false;
        if retry {
            state.pending = true;
        }
        state.pending && state.enabled
    };
    if resubmit {
        let _ = inner.tx.send(IndexRequest {
            project_id,
            reason: IndexReason::Coalesced,
        });
    }
}

/// Probe, prepare, and build. Returns the terminal job state, optional
/// result payload, optional error message, and whether the request should
/// be retried via the pending flag.
async fn execute_run(
    inner: &Arc<Inner>,
    repo_root: &Path,
    cancel: &CancelToken,
) -> (JobState, Option<serde_json::Value>, Option<String>, bool) {
    let info = match inner.workspace.status(repo_root).await {
        Ok(info) => info,
        Err(e) => return (JobState::Failed, None, Some(format!("{:#}", e)), false),
    };
    if !info.writable {
        return (
            JobState::Blocked,
            None,
            Some(format!("workspace at {} is not writable", repo_root.display())),
            false,
        );
    }
    if let Err(e) = inner.workspace.ensure_workspace(repo_root).await {
        return (JobState::Failed, None, Some(format!("{:#}", e)), false);
    }

    match inner.builder.build_index(repo_root, cancel).await {
        Ok(meta) => (
            JobState::Succeeded,
            Some(serde_json::json!({ "files_indexed": meta.files_indexed })),
            None,
            false,
        ),
        Err(IndexError::Canceled) => (JobState::Canceled, None, Some("canceled".into()), false),
        Err(e @ IndexError::AlreadyRunning { .. }) => {
            // The external lock holder will release eventually; retry once
            // through the coalescing path.
            (JobState::Blocked, None, Some(e.to_string()), true)
        }
        Err(e @ IndexError::NotWritable { .. }) => {
            (JobState::Blocked, None, Some(e.to_string()), false)
        }
        Err(IndexError::Other(e)) => (JobState::Failed, None, Some(format!("{:#}", e)), false),
    }
}

fn clear_in_progress(inner: &Arc<Inner>, project_id: i64) {
    if let Ok(mut projects) = inner.projects.lock() {
        if let Some(state) = projects.get_mut(&project_id) {
            state.in_progress = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::DbHandle;
    use crate::indexer::IndexMeta;
    use crate::models::{JobState, Provider};
    use crate::watcher::WatchHandle;
    use crate::workspace::WorkspaceInfo;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Notify;

    struct NullWatcher;

    #[async_trait]
    impl FileWatcher for NullWatcher {
        async fn watch(
            &self,
            _project_id: i64,
            _repo_root: &Path,
            _events: mpsc::UnboundedSender<WatchEvent>,
        ) -> Result<WatchHandle> {
            Ok(WatchHandle::new(tokio::spawn(std::future::pending())))
        }
    }

    struct FixedWorkspace {
        writable: bool,
    }

    #[async_trait]
    impl WorkspaceProbe for FixedWorkspace {
        async fn status(&self, repo_root: &Path) -> Result<WorkspaceInfo> {
            Ok(WorkspaceInfo {
                writable: self.writable,
                workspace_dir: repo_root.join(".boardsync"),
            })
        }

        async fn ensure_workspace(&self, _repo_root: &Path) -> Result<()> {
            Ok(())
        }
    }

    /// Builder that parks inside the build until released, so tests can
    /// observe the in-flight window.
    struct GatedBuilder {
        entered: Notify,
        release: Notify,
        runs: AtomicUsize,
    }

    impl GatedBuilder {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                entered: Notify::new(),
                release: Notify::new(),
                runs: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl IndexBuilder for GatedBuilder {
        async fn build_index(
            &self,
            _repo_root: &Path,
            cancel: &CancelToken,
        ) -> Result<IndexMeta, IndexError> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            self.entered.notify_one();
            self.release.notified().await;
            if cancel.is_canceled() {
                return Err(IndexError::Canceled);
            }
            Ok(IndexMeta { files_indexed: 1 })
        }
    }

    struct CountingBuilder {
        runs: AtomicUsize,
    }

    #[async_trait]
    impl IndexBuilder for CountingBuilder {
        async fn build_index(
            &self,
            _repo_root: &Path,
            _cancel: &CancelToken,
        ) -> Result<IndexMeta, IndexError> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            Ok(IndexMeta { files_indexed: 0 })
        }
    }

    /// First build hits the external lock, the retry succeeds.
    struct LockedOnceBuilder {
        runs: AtomicUsize,
    }

    #[async_trait]
    impl IndexBuilder for LockedOnceBuilder {
        async fn build_index(
            &self,
            repo_root: &Path,
            _cancel: &CancelToken,
        ) -> Result<IndexMeta, IndexError> {
            if self.runs.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(IndexError::AlreadyRunning {
                    repo_root: repo_root.display().to_string(),
                })
            } else {
                Ok(IndexMeta { files_indexed: 4 })
            }
        }
    }

    async fn setup(
        builder: Arc<dyn IndexBuilder>,
        writable: bool,
    ) -> (IndexScheduler, DbHandle, i64) {
        let db = DbHandle::open_in_memory().unwrap();
        let project = db
            .call(|db| db.insert_project("p", "/tmp/p", None, Some(Provider::Local)))
            .await
            .unwrap();
        let scheduler = IndexScheduler::new(
            db.clone(),
            builder,
            Arc::new(FixedWorkspace { writable }),
            Arc::new(NullWatcher),
            ChangeNotifier::new(),
            SchedulerConfig::default(),
        );
        scheduler.register_project(project.id, Path::new("/tmp/p"));
        (scheduler, db, project.id)
    }

    async fn wait_for<F, Fut>(mut check: F)
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        for _ in 0..200 {
            if check().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached within timeout");
    }

    async fn job_states(db: &DbHandle, project_id: i64) -> Vec<JobState> {
        db.call(move |db| db.list_jobs(project_id))
            .await
            .unwrap()
            .into_iter()
            .map(|j| j.state)
            .collect()
    }

    #[tokio::test]
    async fn test_rapid_requests_coalesce_into_one_pending_run() {
        let builder = GatedBuilder::new();
        let (scheduler, db, pid) = setup(builder.clone(), true).await;
        scheduler.set_indexing_enabled(pid, true).await.unwrap();

        // The enable-triggered initial run parks inside the builder.
        builder.entered.notified().await;
        assert_eq!(job_states(&db, pid).await.len(), 1);

        // Three triggers during the run leave exactly one pending flag.
        scheduler.request_index_now(pid, IndexReason::Manual);
        scheduler.request_index_now(pid, IndexReason::Manual);
        scheduler.request_index_now(pid, IndexReason::Manual);
        wait_for(|| async { scheduler.project_flags(pid).unwrap().pending }).await;
        assert_eq!(job_states(&db, pid).await.len(), 1);

        // Releasing the first run triggers exactly one coalesced follow-up.
        builder.release.notify_one();
        builder.entered.notified().await;
        builder.release.notify_one();
        wait_for(|| async {
            job_states(&db, pid).await == vec![JobState::Succeeded, JobState::Succeeded]
        })
        .await;
        assert_eq!(builder.runs.load(Ordering::SeqCst), 2);

        let flags = scheduler.project_flags(pid).unwrap();
        assert!(!flags.in_progress);
        assert!(!flags.pending);
        scheduler.shutdown();
    }

    #[tokio::test]
    async fn test_disable_while_running_cancels_and_clears_pending() {
        let builder = GatedBuilder::new();
        let (scheduler, db, pid) = setup(builder.clone(), true).await;
        scheduler.set_indexing_enabled(pid, true).await.unwrap();
        builder.entered.notified().await;

        // Queue a follow-up, then disable mid-run.
        scheduler.request_index_now(pid, IndexReason::FsWatch);
        wait_for(|| async { scheduler.project_flags(pid).unwrap().pending }).await;
        scheduler.set_indexing_enabled(pid, false).await.unwrap();

        let flags = scheduler.project_flags(pid).unwrap();
        assert!(!flags.enabled);
        assert!(!flags.pending);

        // The in-flight run observes the cancel flag at its checkpoint.
        builder.release.notify_one();
        wait_for(|| async { job_states(&db, pid).await == vec![JobState::Canceled] }).await;

        // No coalesced follow-up after a disable.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(job_states(&db, pid).await.len(), 1);
        assert!(!scheduler.project_flags(pid).unwrap().in_progress);
        scheduler.shutdown();
    }

    #[tokio::test]
    async fn test_unwritable_workspace_blocks_job() {
        let builder = Arc::new(CountingBuilder {
            runs: AtomicUsize::new(0),
        });
        let (scheduler, db, pid) = setup(builder.clone(), false).await;
        scheduler.set_indexing_enabled(pid, true).await.unwrap();

        // The enable probe skips the initial run on an unwritable
        // workspace; a manual request still produces a blocked job.
        scheduler.request_index_now(pid, IndexReason::Manual);
        wait_for(|| async { job_states(&db, pid).await == vec![JobState::Blocked] }).await;
        assert_eq!(builder.runs.load(Ordering::SeqCst), 0);
        scheduler.shutdown();
    }

    #[tokio::test]
    async fn test_external_lock_blocks_then_retries_via_pending() {
        let builder = Arc::new(LockedOnceBuilder {
            runs: AtomicUsize::new(0),
        });
        let (scheduler, db, pid) = setup(builder.clone(), true).await;
        scheduler.set_indexing_enabled(pid, true).await.unwrap();

        wait_for(|| async {
            job_states(&db, pid).await == vec![JobState::Blocked, JobState::Succeeded]
        })
        .await;
        assert_eq!(builder.runs.load(Ordering::SeqCst), 2);
        scheduler.shutdown();
    }

    #[tokio::test]
    async fn test_disabled_project_ignores_non_manual_requests() {
        let builder = Arc::new(CountingBuilder {
            runs: AtomicUsize::new(0),
        });
        let (scheduler, db, pid) = setup(builder.clone(), true).await;

        scheduler.request_index_now(pid, IndexReason::FsWatch);
        scheduler.request_index_now(pid, IndexReason::BackgroundPeriodic);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(job_states(&db, pid).await.is_empty());

        // Manual requests bypass the guard.
        scheduler.request_index_now(pid, IndexReason::Manual);
        wait_for(|| async { job_states(&db, pid).await == vec![JobState::Succeeded] }).await;
        scheduler.shutdown();
    }

    #[tokio::test]
    async fn test_focus_change_triggers_run_and_marks_active() {
        let builder = Arc::new(CountingBuilder {
            runs: AtomicUsize::new(0),
        });
        let (scheduler, db, pid) = setup(builder.clone(), true).await;
        scheduler.set_indexing_enabled(pid, true).await.unwrap();
        wait_for(|| async { !job_states(&db, pid).await.is_empty() }).await;
        let before = job_states(&db, pid).await.len();

        scheduler.set_active_project(Some(pid));
        assert!(scheduler.project_flags(pid).unwrap().active);
        wait_for(|| async { job_states(&db, pid).await.len() > before }).await;

        scheduler.set_active_project(None);
        assert!(!scheduler.project_flags(pid).unwrap().active);
        scheduler.shutdown();
    }

    #[tokio::test]
    async fn test_unregister_forgets_project() {
        let builder = Arc::new(CountingBuilder {
            runs: AtomicUsize::new(0),
        });
        let (scheduler, db, pid) = setup(builder.clone(), true).await;
        scheduler.set_indexing_enabled(pid, true).await.unwrap();
        wait_for(|| async { !job_states(&db, pid).await.is_empty() }).await;

        scheduler.unregister_project(pid);
        assert!(scheduler.project_flags(pid).is_none());

        let count = job_states(&db, pid).await.len();
        scheduler.request_index_now(pid, IndexReason::Manual);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(job_states(&db, pid).await.len(), count);
        scheduler.shutdown();
    }
}
