//! Provider adapter contract.
//!
//! One adapter per remote provider. The board-related operations (project
//! discovery, draft items, field mutation, PR-issue links) are capability
//! methods with no-op defaults: a provider without those features simply
//! leaves them alone, and the engine's provider-specific passes fall away
//! naturally instead of branching on adapter type.

use std::str::FromStr;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

use crate::config::PolicyConfig;
use crate::errors::SyncError;
use crate::models::{CardStatus, PrIssueLink, Provider, RemoteCard};
use crate::sync::github::GithubAdapter;
use crate::sync::gitlab::GitlabAdapter;

#[derive(Debug, Clone)]
pub struct AuthStatus {
    pub authenticated: bool,
    pub error: Option<String>,
}

#[async_trait]
pub trait RemoteAdapter: Send + Sync {
    fn provider(&self) -> Provider;

    async fn check_auth(&self) -> Result<AuthStatus>;

    async fn list_issues(&self) -> Result<Vec<RemoteCard>>;

    async fn list_prs(&self) -> Result<Vec<RemoteCard>> {
        Ok(Vec::new())
    }

    async fn list_mrs(&self) -> Result<Vec<RemoteCard>> {
        Ok(Vec::new())
    }

    async fn list_project_drafts(&self) -> Result<Vec<RemoteCard>> {
        Ok(Vec::new())
    }

    fn status_label(&self, status: CardStatus) -> String;

    fn all_status_labels(&self) -> Vec<String>;

    /// Add and remove labels on one item. Returns whether the remote write
    /// went through.
    async fn update_labels(&self, number: &str, add: &[String], remove: &[String]) -> Result<bool>;

    /// Set the board status field for a numbered item.
    async fn update_project_status(&self, _number: &str, _status: CardStatus) -> Result<bool> {
        Ok(false)
    }

    /// Set the board status field for a draft item addressed by node id.
    async fn update_project_draft_status(
        &self,
        _node_id: &str,
        _status: CardStatus,
    ) -> Result<bool> {
        Ok(false)
    }

    /// Discover the provider-side project board for this repository.
    async fn find_repository_project(&self) -> Result<Option<String>> {
        Ok(None)
    }

    /// Drop any per-run cached board state.
    fn clear_status_cache(&self) {}

    async fn list_pr_issue_links(&self) -> Result<Vec<PrIssueLink>> {
        Ok(Vec::new())
    }
}

/// Resolve the provider for a project: an explicit hint wins, otherwise the
/// repository key's prefix decides.
pub fn resolve_provider(hint: Option<Provider>, remote_repo: &str) -> Result<Provider, SyncError> {
    if let Some(provider) = hint {
        return Ok(provider);
    }
    if remote_repo.starts_with("github:") {
        Ok(Provider::Github)
    } else if remote_repo.starts_with("gitlab:") {
        Ok(Provider::Gitlab)
    } else {
        Err(SyncError::UnknownProvider {
            repo: remote_repo.to_string(),
        })
    }
}

/// Strip the provider prefix from a repository key, leaving the API slug.
pub fn repo_slug(remote_repo: &str) -> &str {
    remote_repo
        .split_once(':')
        .map(|(_, slug)| slug)
        .unwrap_or(remote_repo)
}

/// Select and construct the concrete adapter for a project.
pub fn select_adapter(
    hint: Option<Provider>,
    remote_repo: &str,
    policy: &PolicyConfig,
    token: Option<String>,
) -> Result<Arc<dyn RemoteAdapter>, SyncError> {
    let provider = resolve_provider(hint, remote_repo)?;
    let slug = repo_slug(remote_repo).to_string();
    match provider {
        Provider::Github => {
            let token = token.ok_or_else(|| SyncError::MissingToken {
                provider: provider.to_string(),
            })?;
            Ok(Arc::new(GithubAdapter::new(
                slug,
                remote_repo.to_string(),
                token,
                policy.clone(),
            )))
        }
        Provider::Gitlab => {
            let token = token.ok_or_else(|| SyncError::MissingToken {
                provider: provider.to_string(),
            })?;
            Ok(Arc::new(GitlabAdapter::new(
                slug,
                remote_repo.to_string(),
                token,
                policy.clone(),
            )))
        }
        Provider::Local => Err(SyncError::UnknownProvider {
            repo: remote_repo.to_string(),
        }),
    }
}

/// Map a remote item's labels onto a local status using the policy's
/// status-label table. Shared by both concrete adapters.
pub fn status_from_labels(policy: &PolicyConfig, labels: &[String]) -> Option<CardStatus> {
    labels
        .iter()
        .find_map(|label| policy.status_for_label(label))
}

/// Parse a board option name (e.g. "In Progress") into a local status,
/// trying the policy mapping first and the canonical names second.
pub fn status_from_board_value(policy: &PolicyConfig, value: &str) -> Option<CardStatus> {
    policy
        .status_for_board_value(value)
        .or_else(|| CardStatus::from_str(&value.to_lowercase().replace(' ', "_")).ok())
}
