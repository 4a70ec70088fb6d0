//! GitLab adapter: REST for issues, merge requests, and labels.
//!
//! GitLab has no Projects V2 analogue here, so the board capability methods
//! keep their no-op defaults and status flows through labels alone.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use crate::config::PolicyConfig;
use crate::models::{CardStatus, CardType, Provider, RemoteCard};
use crate::sync::adapter::{status_from_labels, AuthStatus, RemoteAdapter};

const GITLAB_API: &str = "https://gitlab.com/api/v4";
const PAGE_SIZE: usize = 100;

/// A GitLab issue or merge request (subset of fields we care about).
#[derive(Debug, Deserialize)]
struct ItemResponse {
    iid: i64,
    title: String,
    description: Option<String>,
    web_url: String,
    updated_at: String,
    #[serde(default)]
    labels: Vec<String>,
    #[serde(default)]
    assignees: Vec<UserResponse>,
}

#[derive(Debug, Deserialize)]
struct UserResponse {
    username: String,
}

pub struct GitlabAdapter {
    client: reqwest::Client,
    /// URL-encoded project path, e.g. `group%2Fproject`.
    encoded_path: String,
    repo_key: String,
    token: String,
    policy: PolicyConfig,
}

impl GitlabAdapter {
    pub fn new(slug: String, repo_key: String, token: String, policy: PolicyConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_default();
        Self {
            client,
            encoded_path: slug.replace('/', "%2F"),
            repo_key,
            token,
            policy,
        }
    }

    fn rest(&self, path: &str) -> String {
        format!("{}/projects/{}{}", GITLAB_API, self.encoded_path, path)
    }

    async fn list_items(&self, path: &str) -> Result<Vec<ItemResponse>> {
        let url = self.rest(path);
        let mut all = Vec::new();
        let mut page = 1u32;
        loop {
            let page_str = page.to_string();
            let per_page = PAGE_SIZE.to_string();
            let resp: Vec<ItemResponse> = self
                .client
                .get(&url)
                .header("PRIVATE-TOKEN", &self.token)
                .query(&[
                    ("state", "opened"),
                    ("per_page", &per_page),
                    ("page", &page_str),
                ])
                .send()
                .await
                .with_context(|| format!("Failed to send request to {}", url))?
                .error_for_status()
                .with_context(|| format!("GitLab API returned error status for {}", url))?
                .json()
                .await
                .with_context(|| format!("Failed to parse response from {}", url))?;

            let count = resp.len();
            all.extend(resp);
            if count < PAGE_SIZE {
                break;
            }
            page += 1;
        }
        Ok(all)
    }

    fn item_to_card(&self, item: ItemResponse, card_type: CardType) -> RemoteCard {
        let status = status_from_labels(&self.policy, &item.labels).unwrap_or(CardStatus::Draft);
        RemoteCard {
            provider: Provider::Gitlab,
            card_type,
            remote_repo: self.repo_key.clone(),
            remote_number: item.iid.to_string(),
            remote_node_id: None,
            remote_url: Some(item.web_url),
            title: item.title,
            body: item.description.unwrap_or_default(),
            status,
            ready_eligible: status == CardStatus::Ready,
            labels: item.labels,
            assignees: item.assignees.into_iter().map(|a| a.username).collect(),
            updated_remote_at: Some(item.updated_at),
        }
    }
}

#[async_trait]
impl RemoteAdapter for GitlabAdapter {
    fn provider(&self) -> Provider {
        Provider::Gitlab
    }

    async fn check_auth(&self) -> Result<AuthStatus> {
        let resp = self
            .client
            .get(self.rest(""))
            .header("PRIVATE-TOKEN", &self.token)
            .send()
            .await
            .context("Failed to reach GitLab")?;
        let status = resp.status();
        if status.is_success() {
            Ok(AuthStatus {
                authenticated: true,
                error: None,
            })
        } else {
            Ok(AuthStatus {
                authenticated: false,
                error: Some(format!("GitLab returned {} for {}", status, self.repo_key)),
            })
        }
    }

    async fn list_issues(&self) -> Result<Vec<RemoteCard>> {
        let items = self.list_items("/issues").await?;
        Ok(items
            .into_iter()
            .map(|i| self.item_to_card(i, CardType::Issue))
            .collect())
    }

    async fn list_mrs(&self) -> Result<Vec<RemoteCard>> {
        let items = self.list_items("/merge_requests").await?;
        Ok(items
            .into_iter()
            .map(|i| self.item_to_card(i, CardType::Mr))
            .collect())
    }

    fn status_label(&self, status: CardStatus) -> String {
        self.policy.status_label(status)
    }

    fn all_status_labels(&self) -> Vec<String> {
        self.policy.all_status_labels()
    }

    async fn update_labels(&self, number: &str, add: &[String], remove: &[String]) -> Result<bool> {
        self.client
            .put(self.rest(&format!("/issues/{}", number)))
            .header("PRIVATE-TOKEN", &self.token)
            .json(&json!({
                "add_labels": add.join(","),
                "remove_labels": remove.join(","),
            }))
            .send()
            .await
            .context("Failed to send label update to GitLab")?
            .error_for_status()
            .context("GitLab label update returned error status")?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn adapter() -> GitlabAdapter {
        GitlabAdapter::new(
            "group/project".to_string(),
            "gitlab:group/project".to_string(),
            "glpat-test".to_string(),
            PolicyConfig::default(),
        )
    }

    #[test]
    fn test_project_path_is_url_encoded() {
        let adapter = adapter();
        assert_eq!(adapter.encoded_path, "group%2Fproject");
        assert!(adapter.rest("/issues").ends_with("/projects/group%2Fproject/issues"));
    }

    #[test]
    fn test_item_response_deserialize() {
        let json = r#"{
            "iid": 17,
            "title": "Flaky pipeline",
            "description": "fails on retry",
            "web_url": "https://gitlab.com/group/project/-/issues/17",
            "updated_at": "2026-03-02T08:30:00Z",
            "labels": ["ci", "status:in_progress"],
            "assignees": [{"username": "bob"}]
        }"#;
        let item: ItemResponse = serde_json::from_str(json).unwrap();
        assert_eq!(item.iid, 17);
        assert_eq!(item.labels, vec!["ci", "status:in_progress"]);
        assert_eq!(item.assignees[0].username, "bob");
    }

    #[test]
    fn test_item_to_card_maps_labels_and_status() {
        let adapter = adapter();
        let item: ItemResponse = serde_json::from_str(
            r#"{
                "iid": 17,
                "title": "Flaky pipeline",
                "description": null,
                "web_url": "https://gitlab.com/group/project/-/issues/17",
                "updated_at": "2026-03-02T08:30:00Z",
                "labels": ["status:in_progress"]
            }"#,
        )
        .unwrap();
        let card = adapter.item_to_card(item, CardType::Issue);
        assert_eq!(card.provider, Provider::Gitlab);
        assert_eq!(card.status, CardStatus::InProgress);
        assert!(!card.ready_eligible);
        assert_eq!(card.remote_number, "17");
        assert!(card.remote_node_id.is_none());
        assert_eq!(card.body, "");
    }

    #[test]
    fn test_item_to_card_without_status_label_defaults_to_draft() {
        let adapter = adapter();
        let item: ItemResponse = serde_json::from_str(
            r#"{
                "iid": 2,
                "title": "T",
                "description": "d",
                "web_url": "https://gitlab.com/group/project/-/issues/2",
                "updated_at": "2026-03-02T08:30:00Z"
            }"#,
        )
        .unwrap();
        let card = adapter.item_to_card(item, CardType::Issue);
        assert_eq!(card.status, CardStatus::Draft);
    }
}
