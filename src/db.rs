use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::models::*;

/// Async-safe handle to the board database.
///
/// Wraps `BoardDb` behind `Arc<Mutex>` and runs all access on tokio's
/// blocking thread pool via `spawn_blocking`, preventing synchronous SQLite
/// I/O from tying up async worker threads.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<std::sync::Mutex<BoardDb>>,
}

impl DbHandle {
    pub fn new(db: BoardDb) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    pub fn open(path: &Path) -> Result<Self> {
        Ok(Self::new(BoardDb::new(path)?))
    }

    pub fn open_in_memory() -> Result<Self> {
        Ok(Self::new(BoardDb::new_in_memory()?))
    }

    /// Run a closure with access to the database on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&BoardDb) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db
                .lock()
                .map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))?;
            f(&guard)
        })
        .await
        .context("DB task panicked")?
    }
}

pub struct BoardDb {
    conn: Connection,
}

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339()
}

impl BoardDb {
    /// Open (or create) a SQLite database at the given path and run migrations.
    pub fn new(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Create an in-memory SQLite database (for testing).
    pub fn new_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> Result<()> {
        self.conn
            .execute_batch("PRAGMA foreign_keys = ON;")
            .context("Failed to enable foreign keys")?;
        self.run_migrations().context("Failed to run migrations")?;
        Ok(())
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS projects (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    name TEXT NOT NULL,
                    repo_root TEXT NOT NULL,
                    remote_repo TEXT,
                    provider TEXT,
                    policy TEXT,
                    auto_index INTEGER NOT NULL DEFAULT 0,
                    last_synced_at TEXT,
                    created_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE TABLE IF NOT EXISTS cards (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    project_id INTEGER NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
                    provider TEXT NOT NULL DEFAULT 'local',
                    card_type TEXT NOT NULL DEFAULT 'local',
                    title TEXT NOT NULL,
                    body TEXT NOT NULL DEFAULT '',
                    status TEXT NOT NULL DEFAULT 'draft',
                    ready_eligible INTEGER NOT NULL DEFAULT 0,
                    labels TEXT NOT NULL DEFAULT '[]',
                    assignees TEXT NOT NULL DEFAULT '[]',
                    remote_repo TEXT,
                    remote_number TEXT,
                    remote_node_id TEXT,
                    remote_url TEXT,
                    updated_remote_at TEXT,
                    updated_local_at TEXT NOT NULL,
                    sync_state TEXT NOT NULL DEFAULT 'ok',
                    last_error TEXT
                );

                CREATE TABLE IF NOT EXISTS card_links (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    card_id INTEGER NOT NULL REFERENCES cards(id) ON DELETE CASCADE,
                    linked_type TEXT NOT NULL,
                    linked_url TEXT NOT NULL,
                    linked_repo TEXT NOT NULL,
                    linked_number TEXT NOT NULL,
                    UNIQUE(card_id, linked_type, linked_repo, linked_number)
                );

                CREATE TABLE IF NOT EXISTS jobs (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    project_id INTEGER NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
                    card_id INTEGER REFERENCES cards(id) ON DELETE SET NULL,
                    job_type TEXT NOT NULL,
                    state TEXT NOT NULL DEFAULT 'queued',
                    result TEXT,
                    error TEXT,
                    created_at TEXT NOT NULL DEFAULT (datetime('now')),
                    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE TABLE IF NOT EXISTS sync_cursors (
                    project_id INTEGER NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
                    provider TEXT NOT NULL,
                    stream TEXT NOT NULL,
                    cursor TEXT NOT NULL,
                    updated_at TEXT NOT NULL,
                    PRIMARY KEY (project_id, provider, stream)
                );

                CREATE TABLE IF NOT EXISTS settings (
                    key TEXT PRIMARY KEY,
                    value TEXT NOT NULL,
                    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE INDEX IF NOT EXISTS idx_cards_project ON cards(project_id);
                CREATE INDEX IF NOT EXISTS idx_jobs_project ON jobs(project_id);
                CREATE UNIQUE INDEX IF NOT EXISTS idx_cards_remote
                    ON cards(project_id, remote_repo, remote_number)
                    WHERE remote_number IS NOT NULL;
                ",
            )
            .context("Failed to create tables")?;
        Ok(())
    }

    // ── projects ─────────────────────────────────────────────────────

    pub fn insert_project(
        &self,
        name: &str,
        repo_root: &str,
        remote_repo: Option<&str>,
        provider: Option<Provider>,
    ) -> Result<Project> {
        self.conn
            .execute(
                "INSERT INTO projects (name, repo_root, remote_repo, provider, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    name,
                    repo_root,
                    remote_repo,
                    provider.map(|p| p.as_str()),
                    now_rfc3339()
                ],
            )
            .context("Failed to insert project")?;
        let id = self.conn.last_insert_rowid();
        self.get_project(id)?
            .ok_or_else(|| anyhow::anyhow!("Project {} missing after insert", id))
    }

    pub fn get_project(&self, id: i64) -> Result<Option<Project>> {
        self.conn
            .query_row(
                "SELECT id, name, repo_root, remote_repo, provider, policy, auto_index,
                        last_synced_at, created_at
                 FROM projects WHERE id = ?1",
                params![id],
                row_to_project,
            )
            .optional()
            .context("Failed to query project")
    }

    pub fn list_projects(&self) -> Result<Vec<Project>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, name, repo_root, remote_repo, provider, policy, auto_index,
                    last_synced_at, created_at
             FROM projects ORDER BY id",
        )?;
        let rows = stmt.query_map([], row_to_project)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .context("Failed to list projects")
    }

    pub fn list_auto_index_projects(&self) -> Result<Vec<Project>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, name, repo_root, remote_repo, provider, policy, auto_index,
                    last_synced_at, created_at
             FROM projects WHERE auto_index = 1 ORDER BY id",
        )?;
        let rows = stmt.query_map([], row_to_project)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .context("Failed to list auto-index projects")
    }

    pub fn set_auto_index(&self, id: i64, enabled: bool) -> Result<()> {
        self.conn
            .execute(
                "UPDATE projects SET auto_index = ?2 WHERE id = ?1",
                params![id, enabled as i64],
            )
            .context("Failed to update auto_index")?;
        Ok(())
    }

    pub fn set_project_policy(&self, id: i64, policy_json: &str) -> Result<()> {
        self.conn
            .execute(
                "UPDATE projects SET policy = ?2 WHERE id = ?1",
                params![id, policy_json],
            )
            .context("Failed to update project policy")?;
        Ok(())
    }

    pub fn set_last_synced(&self, id: i64, timestamp: &str) -> Result<()> {
        self.conn
            .execute(
                "UPDATE projects SET last_synced_at = ?2 WHERE id = ?1",
                params![id, timestamp],
            )
            .context("Failed to update last_synced_at")?;
        Ok(())
    }

    // ── cards ────────────────────────────────────────────────────────

    pub fn insert_remote_card(&self, project_id: i64, remote: &RemoteCard) -> Result<Card> {
        self.conn
            .execute(
                "INSERT INTO cards (project_id, provider, card_type, title, body, status,
                        ready_eligible, labels, assignees, remote_repo, remote_number,
                        remote_node_id, remote_url, updated_remote_at, updated_local_at,
                        sync_state)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, 'ok')",
                params![
                    project_id,
                    remote.provider.as_str(),
                    remote.card_type.as_str(),
                    remote.title,
                    remote.body,
                    remote.status.as_str(),
                    remote.ready_eligible as i64,
                    serde_json::to_string(&remote.labels)?,
                    serde_json::to_string(&remote.assignees)?,
                    remote.remote_repo,
                    remote.remote_number,
                    remote.remote_node_id,
                    remote.remote_url,
                    remote.updated_remote_at,
                    now_rfc3339(),
                ],
            )
            .context("Failed to insert card")?;
        let id = self.conn.last_insert_rowid();
        self.get_card(id)?
            .ok_or_else(|| anyhow::anyhow!("Card {} missing after insert", id))
    }

    pub fn get_card(&self, id: i64) -> Result<Option<Card>> {
        self.conn
            .query_row(
                &format!("{} WHERE id = ?1", CARD_SELECT),
                params![id],
                row_to_card,
            )
            .optional()
            .context("Failed to query card")
    }

    pub fn get_card_by_remote(
        &self,
        project_id: i64,
        remote_repo: &str,
        remote_number: &str,
    ) -> Result<Option<Card>> {
        self.conn
            .query_row(
                &format!(
                    "{} WHERE project_id = ?1 AND remote_repo = ?2 AND remote_number = ?3",
                    CARD_SELECT
                ),
                params![project_id, remote_repo, remote_number],
                row_to_card,
            )
            .optional()
            .context("Failed to query card by remote identity")
    }

    pub fn list_cards(&self, project_id: i64) -> Result<Vec<Card>> {
        let mut stmt = self
            .conn
            .prepare(&format!("{} WHERE project_id = ?1 ORDER BY id", CARD_SELECT))?;
        let rows = stmt.query_map(params![project_id], row_to_card)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .context("Failed to list cards")
    }

    /// Overwrite the remote-sourced fields of an existing card. Local-only
    /// fields are untouched; `updated_local_at` is stamped fresh.
    pub fn update_card_from_remote(&self, card_id: i64, remote: &RemoteCard) -> Result<()> {
        self.conn
            .execute(
                "UPDATE cards SET provider = ?2, card_type = ?3, title = ?4, body = ?5,
                        status = ?6, ready_eligible = ?7, labels = ?8, assignees = ?9,
                        remote_node_id = ?10, remote_url = ?11, updated_remote_at = ?12,
                        updated_local_at = ?13, sync_state = 'ok', last_error = NULL
                 WHERE id = ?1",
                params![
                    card_id,
                    remote.provider.as_str(),
                    remote.card_type.as_str(),
                    remote.title,
                    remote.body,
                    remote.status.as_str(),
                    remote.ready_eligible as i64,
                    serde_json::to_string(&remote.labels)?,
                    serde_json::to_string(&remote.assignees)?,
                    remote.remote_node_id,
                    remote.remote_url,
                    remote.updated_remote_at,
                    now_rfc3339(),
                ],
            )
            .context("Failed to update card from remote")?;
        Ok(())
    }

    pub fn set_card_status(&self, card_id: i64, status: CardStatus) -> Result<()> {
        self.conn
            .execute(
                "UPDATE cards SET status = ?2, updated_local_at = ?3 WHERE id = ?1",
                params![card_id, status.as_str(), now_rfc3339()],
            )
            .context("Failed to update card status")?;
        Ok(())
    }

    pub fn set_card_sync_state(
        &self,
        card_id: i64,
        state: SyncState,
        error: Option<&str>,
    ) -> Result<()> {
        self.conn
            .execute(
                "UPDATE cards SET sync_state = ?2, last_error = ?3 WHERE id = ?1",
                params![card_id, state.as_str(), error],
            )
            .context("Failed to update card sync state")?;
        Ok(())
    }

    // ── card links ───────────────────────────────────────────────────

    /// Insert a link unless an equivalent one exists. Returns true if a row
    /// was actually inserted.
    pub fn insert_card_link_if_absent(
        &self,
        card_id: i64,
        linked_type: CardType,
        linked_url: &str,
        linked_repo: &str,
        linked_number: &str,
    ) -> Result<bool> {
        let changed = self
            .conn
            .execute(
                "INSERT OR IGNORE INTO card_links
                        (card_id, linked_type, linked_url, linked_repo, linked_number)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    card_id,
                    linked_type.as_str(),
                    linked_url,
                    linked_repo,
                    linked_number
                ],
            )
            .context("Failed to insert card link")?;
        Ok(changed > 0)
    }

    pub fn list_card_links(&self, card_id: i64) -> Result<Vec<CardLink>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, card_id, linked_type, linked_url, linked_repo, linked_number
             FROM card_links WHERE card_id = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map(params![card_id], |row| {
            Ok(CardLink {
                id: row.get(0)?,
                card_id: row.get(1)?,
                linked_type: parse_col(row, 2)?,
                linked_url: row.get(3)?,
                linked_repo: row.get(4)?,
                linked_number: row.get(5)?,
            })
        })?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .context("Failed to list card links")
    }

    // ── jobs ─────────────────────────────────────────────────────────

    /// Create a job directly in `running` state: the caller is the one
    /// executing it and will drive it to a terminal state.
    pub fn create_job(
        &self,
        project_id: i64,
        job_type: JobType,
        card_id: Option<i64>,
        payload: Option<&serde_json::Value>,
    ) -> Result<Job> {
        let now = now_rfc3339();
        self.conn
            .execute(
                "INSERT INTO jobs (project_id, card_id, job_type, state, result, created_at, updated_at)
                 VALUES (?1, ?2, ?3, 'running', ?4, ?5, ?5)",
                params![
                    project_id,
                    card_id,
                    job_type.as_str(),
                    payload.map(|p| p.to_string()),
                    now
                ],
            )
            .context("Failed to create job")?;
        let id = self.conn.last_insert_rowid();
        self.get_job(id)?
            .ok_or_else(|| anyhow::anyhow!("Job {} missing after insert", id))
    }

    pub fn update_job_state(
        &self,
        job_id: i64,
        state: JobState,
        result: Option<&serde_json::Value>,
        error: Option<&str>,
    ) -> Result<()> {
        match result {
            Some(result) => self.conn.execute(
                "UPDATE jobs SET state = ?2, result = ?3, error = ?4, updated_at = ?5
                 WHERE id = ?1",
                params![job_id, state.as_str(), result.to_string(), error, now_rfc3339()],
            ),
            None => self.conn.execute(
                "UPDATE jobs SET state = ?2, error = ?3, updated_at = ?4 WHERE id = ?1",
                params![job_id, state.as_str(), error, now_rfc3339()],
            ),
        }
        .context("Failed to update job state")?;
        Ok(())
    }

    pub fn get_job(&self, id: i64) -> Result<Option<Job>> {
        self.conn
            .query_row(
                "SELECT id, project_id, card_id, job_type, state, result, error,
                        created_at, updated_at
                 FROM jobs WHERE id = ?1",
                params![id],
                row_to_job,
            )
            .optional()
            .context("Failed to query job")
    }

    pub fn list_jobs(&self, project_id: i64) -> Result<Vec<Job>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, project_id, card_id, job_type, state, result, error,
                    created_at, updated_at
             FROM jobs WHERE project_id = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map(params![project_id], row_to_job)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .context("Failed to list jobs")
    }

    // ── sync cursors ─────────────────────────────────────────────────

    pub fn get_cursor(
        &self,
        project_id: i64,
        provider: Provider,
        stream: &str,
    ) -> Result<Option<String>> {
        self.conn
            .query_row(
                "SELECT cursor FROM sync_cursors
                 WHERE project_id = ?1 AND provider = ?2 AND stream = ?3",
                params![project_id, provider.as_str(), stream],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to query sync cursor")
    }

    pub fn set_cursor(
        &self,
        project_id: i64,
        provider: Provider,
        stream: &str,
        cursor: &str,
    ) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO sync_cursors (project_id, provider, stream, cursor, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(project_id, provider, stream)
                 DO UPDATE SET cursor = excluded.cursor, updated_at = excluded.updated_at",
                params![project_id, provider.as_str(), stream, cursor, now_rfc3339()],
            )
            .context("Failed to set sync cursor")?;
        Ok(())
    }

    // ── settings ─────────────────────────────────────────────────────

    pub fn get_setting(&self, key: &str) -> Result<Option<String>> {
        self.conn
            .query_row(
                "SELECT value FROM settings WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to query setting")
    }

    pub fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO settings (key, value, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value,
                                               updated_at = excluded.updated_at",
                params![key, value, now_rfc3339()],
            )
            .context("Failed to set setting")?;
        Ok(())
    }
}

const CARD_SELECT: &str = "SELECT id, project_id, provider, card_type, title, body, status,
        ready_eligible, labels, assignees, remote_repo, remote_number, remote_node_id,
        remote_url, updated_remote_at, updated_local_at, sync_state, last_error
 FROM cards";

/// Parse a TEXT column through `FromStr`, mapping failures onto rusqlite's
/// column error type so they surface as query errors rather than panics.
fn parse_col<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: FromStr<Err = String>,
{
    let raw: String = row.get(idx)?;
    raw.parse().map_err(|e: String| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            rusqlite::types::Type::Text,
            anyhow::anyhow!(e).into(),
        )
    })
}

fn parse_json_list(row: &Row<'_>, idx: usize) -> rusqlite::Result<Vec<String>> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn row_to_project(row: &Row<'_>) -> rusqlite::Result<Project> {
    let provider: Option<String> = row.get(4)?;
    Ok(Project {
        id: row.get(0)?,
        name: row.get(1)?,
        repo_root: row.get(2)?,
        remote_repo: row.get(3)?,
        provider: provider.and_then(|p| p.parse().ok()),
        policy: row.get(5)?,
        auto_index: row.get::<_, i64>(6)? != 0,
        last_synced_at: row.get(7)?,
        created_at: row.get(8)?,
    })
}

fn row_to_card(row: &Row<'_>) -> rusqlite::Result<Card> {
    Ok(Card {
        id: row.get(0)?,
        project_id: row.get(1)?,
        provider: parse_col(row, 2)?,
        card_type: parse_col(row, 3)?,
        title: row.get(4)?,
        body: row.get(5)?,
        status: parse_col(row, 6)?,
        ready_eligible: row.get::<_, i64>(7)? != 0,
        labels: parse_json_list(row, 8)?,
        assignees: parse_json_list(row, 9)?,
        remote_repo: row.get(10)?,
        remote_number: row.get(11)?,
        remote_node_id: row.get(12)?,
        remote_url: row.get(13)?,
        updated_remote_at: row.get(14)?,
        updated_local_at: row.get(15)?,
        sync_state: parse_col(row, 16)?,
        last_error: row.get(17)?,
    })
}

fn row_to_job(row: &Row<'_>) -> rusqlite::Result<Job> {
    let result: Option<String> = row.get(5)?;
    Ok(Job {
        id: row.get(0)?,
        project_id: row.get(1)?,
        card_id: row.get(2)?,
        job_type: parse_col(row, 3)?,
        state: parse_col(row, 4)?,
        result: result.and_then(|r| serde_json::from_str(&r).ok()),
        error: row.get(6)?,
        created_at: row.get(7)?,
        updated_at: row.get(8)?,
    })
}
