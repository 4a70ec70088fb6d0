use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// A tracked repository with optional remote mirroring.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: i64,
    pub name: String,
    pub repo_root: String,
    /// Remote repository key, e.g. `github:owner/repo` or `gitlab:group/project`.
    pub remote_repo: Option<String>,
    pub provider: Option<Provider>,
    /// Raw policy JSON. Parsed lazily by `PolicyConfig::parse`; never trusted.
    pub policy: Option<String>,
    pub auto_index: bool,
    pub last_synced_at: Option<String>,
    pub created_at: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Provider {
    Github,
    Gitlab,
    Local,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Github => "github",
            Self::Gitlab => "gitlab",
            Self::Local => "local",
        }
    }
}

impl std::fmt::Display for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Provider {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "github" => Ok(Self::Github),
            "gitlab" => Ok(Self::Gitlab),
            "local" => Ok(Self::Local),
            _ => Err(format!("Invalid provider: {}", s)),
        }
    }
}

/// Ordered six-stage card status. The ordering matters for board rendering
/// and for the "one status label at a time" push rule.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum CardStatus {
    Draft,
    Ready,
    InProgress,
    InReview,
    Testing,
    Done,
}

impl CardStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Ready => "ready",
            Self::InProgress => "in_progress",
            Self::InReview => "in_review",
            Self::Testing => "testing",
            Self::Done => "done",
        }
    }

    pub const ALL: [CardStatus; 6] = [
        Self::Draft,
        Self::Ready,
        Self::InProgress,
        Self::InReview,
        Self::Testing,
        Self::Done,
    ];
}

impl std::fmt::Display for CardStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CardStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "draft" => Ok(Self::Draft),
            "ready" => Ok(Self::Ready),
            "in_progress" => Ok(Self::InProgress),
            "in_review" => Ok(Self::InReview),
            "testing" => Ok(Self::Testing),
            "done" => Ok(Self::Done),
            _ => Err(format!("Invalid card status: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CardType {
    Issue,
    Pr,
    Draft,
    Mr,
    Local,
}

impl CardType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Issue => "issue",
            Self::Pr => "pr",
            Self::Draft => "draft",
            Self::Mr => "mr",
            Self::Local => "local",
        }
    }
}

impl FromStr for CardType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "issue" => Ok(Self::Issue),
            "pr" => Ok(Self::Pr),
            "draft" => Ok(Self::Draft),
            "mr" => Ok(Self::Mr),
            "local" => Ok(Self::Local),
            _ => Err(format!("Invalid card type: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    Ok,
    Pending,
    Error,
}

impl SyncState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::Pending => "pending",
            Self::Error => "error",
        }
    }
}

impl FromStr for SyncState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ok" => Ok(Self::Ok),
            "pending" => Ok(Self::Pending),
            "error" => Ok(Self::Error),
            _ => Err(format!("Invalid sync state: {}", s)),
        }
    }
}

/// A kanban card. Remote-sourced fields are owned by the reconciliation
/// engine; local-only fields (notably status moves made in the UI) are
/// preserved across merges unless a tracked field changed remotely.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Card {
    pub id: i64,
    pub project_id: i64,
    pub provider: Provider,
    pub card_type: CardType,
    pub title: String,
    pub body: String,
    pub status: CardStatus,
    pub ready_eligible: bool,
    pub labels: Vec<String>,
    pub assignees: Vec<String>,
    pub remote_repo: Option<String>,
    /// Issue number / MR iid as a string; draft board items carry their
    /// (non-numeric) node identifier here instead.
    pub remote_number: Option<String>,
    pub remote_node_id: Option<String>,
    pub remote_url: Option<String>,
    pub updated_remote_at: Option<String>,
    pub updated_local_at: String,
    pub sync_state: SyncState,
    pub last_error: Option<String>,
}

/// A remote item as fetched by an adapter, before merging into a `Card`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteCard {
    pub provider: Provider,
    pub card_type: CardType,
    pub remote_repo: String,
    pub remote_number: String,
    pub remote_node_id: Option<String>,
    pub remote_url: Option<String>,
    pub title: String,
    pub body: String,
    pub status: CardStatus,
    pub ready_eligible: bool,
    pub labels: Vec<String>,
    pub assignees: Vec<String>,
    pub updated_remote_at: Option<String>,
}

/// Link from an issue card to the PR/MR that references it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CardLink {
    pub id: i64,
    pub card_id: i64,
    pub linked_type: CardType,
    pub linked_url: String,
    pub linked_repo: String,
    pub linked_number: String,
}

/// PR -> issue reference data derived by an adapter ("closes #N" resolution).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrIssueLink {
    pub pr_url: String,
    pub pr_number: i64,
    pub issue_numbers: Vec<i64>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    IndexRefresh,
    SyncPoll,
    SyncPush,
}

impl JobType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::IndexRefresh => "index_refresh",
            Self::SyncPoll => "sync_poll",
            Self::SyncPush => "sync_push",
        }
    }
}

impl FromStr for JobType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "index_refresh" => Ok(Self::IndexRefresh),
            "sync_poll" => Ok(Self::SyncPoll),
            "sync_push" => Ok(Self::SyncPush),
            _ => Err(format!("Invalid job type: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Running,
    Succeeded,
    Failed,
    Canceled,
    Blocked,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
            Self::Blocked => "blocked",
        }
    }

    /// Whether this state ends the job's lifecycle.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::Failed | Self::Canceled | Self::Blocked
        )
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "running" => Ok(Self::Running),
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            "canceled" => Ok(Self::Canceled),
            "blocked" => Ok(Self::Blocked),
            _ => Err(format!("Invalid job state: {}", s)),
        }
    }
}

/// Ledger entry for one unit of background work. Created in `running` state
/// by the component that triggers the work, and moved exactly once to a
/// terminal state by that same invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: i64,
    pub project_id: i64,
    pub card_id: Option<i64>,
    pub job_type: JobType,
    pub state: JobState,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}
