//! GitHub adapter: REST for issues/PRs/labels, GraphQL for the Projects V2
//! board (discovery, item statuses, draft items, field mutation, closing
//! issue references).
//!
//! Board data is cached per poll run: the engine clears the cache at the
//! start of each run, the first list call reloads it, and every later
//! status lookup during that run hits the cache.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::config::PolicyConfig;
use crate::models::{CardStatus, CardType, PrIssueLink, Provider, RemoteCard};
use crate::sync::adapter::{status_from_board_value, status_from_labels, AuthStatus, RemoteAdapter};

const GITHUB_API: &str = "https://api.github.com";
const GITHUB_GRAPHQL: &str = "https://api.github.com/graphql";
const USER_AGENT: &str = "boardsync";
const PAGE_SIZE: usize = 100;

/// A GitHub issue or pull request (subset of fields we care about).
#[derive(Debug, Deserialize)]
struct ItemResponse {
    number: i64,
    title: String,
    body: Option<String>,
    html_url: String,
    node_id: String,
    updated_at: String,
    #[serde(default)]
    labels: Vec<LabelResponse>,
    #[serde(default)]
    assignees: Vec<UserResponse>,
    /// Pull requests also come through the issues endpoint; filter them out.
    pull_request: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct LabelResponse {
    name: String,
}

#[derive(Debug, Deserialize)]
struct UserResponse {
    login: String,
}

#[derive(Debug, Clone, Default)]
struct BoardItem {
    item_id: String,
    status_value: Option<String>,
}

#[derive(Debug, Clone)]
struct BoardDraft {
    item_id: String,
    title: String,
    body: String,
    status_value: Option<String>,
}

#[derive(Default)]
struct BoardCache {
    loaded: bool,
    /// Discovered board id; survives per-run cache clears.
    board_id: Option<String>,
    status_field_id: Option<String>,
    /// Board option name -> option id.
    status_options: HashMap<String, String>,
    /// Issue/PR number -> board item.
    items: HashMap<i64, BoardItem>,
    drafts: Vec<BoardDraft>,
}

pub struct GithubAdapter {
    client: reqwest::Client,
    slug: String,
    repo_key: String,
    token: String,
    policy: PolicyConfig,
    board: Mutex<BoardCache>,
}

impl GithubAdapter {
    pub fn new(slug: String, repo_key: String, token: String, policy: PolicyConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_default();
        Self {
            client,
            slug,
            repo_key,
            token,
            policy,
            board: Mutex::new(BoardCache::default()),
        }
    }

    fn rest(&self, path: &str) -> String {
        format!("{}/repos/{}{}", GITHUB_API, self.slug, path)
    }

    async fn graphql(&self, query: &str, variables: Value) -> Result<Value> {
        let resp: Value = self
            .client
            .post(GITHUB_GRAPHQL)
            .bearer_auth(&self.token)
            .header("User-Agent", USER_AGENT)
            .json(&json!({ "query": query, "variables": variables }))
            .send()
            .await
            .context("Failed to send GraphQL request to GitHub")?
            .error_for_status()
            .context("GitHub GraphQL endpoint returned error status")?
            .json()
            .await
            .context("Failed to parse GraphQL response from GitHub")?;

        if let Some(first) = resp
            .get("errors")
            .and_then(|e| e.as_array())
            .and_then(|a| a.first())
        {
            anyhow::bail!(
                "GitHub GraphQL error: {}",
                first.get("message").and_then(|m| m.as_str()).unwrap_or("unknown")
            );
        }
        Ok(resp)
    }

    /// Paginate through a REST list endpoint.
    async fn list_items(&self, path: &str, query: &[(&str, &str)]) -> Result<Vec<ItemResponse>> {
        let url = self.rest(path);
        let mut all = Vec::new();
        let mut page = 1u32;
        loop {
            let page_str = page.to_string();
            let per_page = PAGE_SIZE.to_string();
            let mut params: Vec<(&str, &str)> = vec![("per_page", &per_page), ("page", &page_str)];
            params.extend_from_slice(query);

            let resp: Vec<ItemResponse> = self
                .client
                .get(&url)
                .bearer_auth(&self.token)
                .header("User-Agent", USER_AGENT)
                .query(&params)
                .send()
                .await
                .with_context(|| format!("Failed to send request to {}", url))?
                .error_for_status()
                .with_context(|| format!("GitHub API returned error status for {}", url))?
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

    fn board_id(&self) -> Option<String> {
        if !self.policy.projects_v2.enabled {
            return None;
        }
        let cache = self.board.lock().ok()?;
        cache
            .board_id
            .clone()
            .or_else(|| self.policy.projects_v2.project_id.clone())
    }

    /// Load board items and status options for this run, once.
    async fn ensure_board_cache(&self) -> Result<()> {
        if let Ok(cache) = self.board.lock() {
            if cache.loaded {
                return Ok(());
            }
        }
        let Some(board_id) = self.board_id() else {
            // No board configured; mark loaded so we don't re-check.
            if let Ok(mut cache) = self.board.lock() {
                cache.loaded = true;
            }
            return Ok(());
        };

        let query = r#"
            query($project: ID!, $field: String!) {
              node(id: $project) {
                ... on ProjectV2 {
                  field(name: $field) {
                    ... on ProjectV2SingleSelectField {
                      id
                      options { id name }
                    }
                  }
                  items(first: 100) {
                    nodes {
                      id
                      fieldValueByName(name: $field) {
                        ... on ProjectV2ItemFieldSingleSelectValue { name }
                      }
                      content {
                        __typename
                        ... on Issue { number }
                        ... on PullRequest { number }
                        ... on DraftIssue { title body }
                      }
                    }
                  }
                }
              }
            }"#;
        let resp = self
            .graphql(
                query,
                json!({
                    "project": board_id,
                    "field": self.policy.projects_v2.status_field,
                }),
            )
            .await?;

        let (field_id, options, items, drafts) = parse_board_payload(&resp);
        if let Ok(mut cache) = self.board.lock() {
            cache.status_field_id = field_id;
            cache.status_options = options;
            cache.items = items;
            cache.drafts = drafts;
            cache.loaded = true;
        }
        Ok(())
    }

    fn board_status_for(&self, number: i64) -> Option<CardStatus> {
        let cache = self.board.lock().ok()?;
        let value = cache.items.get(&number)?.status_value.clone()?;
        status_from_board_value(&self.policy, &value)
    }

    fn item_to_card(&self, item: ItemResponse, card_type: CardType) -> RemoteCard {
        let labels: Vec<String> = item.labels.into_iter().map(|l| l.name).collect();
        let status = self
            .board_status_for(item.number)
            .or_else(|| status_from_labels(&self.policy, &labels))
            .unwrap_or(CardStatus::Draft);
        RemoteCard {
            provider: Provider::Github,
            card_type,
            remote_repo: self.repo_key.clone(),
            remote_number: item.number.to_string(),
            remote_node_id: Some(item.node_id),
            remote_url: Some(item.html_url),
            title: item.title,
            body: item.body.unwrap_or_default(),
            status,
            ready_eligible: status == CardStatus::Ready,
            labels,
            assignees: item.assignees.into_iter().map(|a| a.login).collect(),
            updated_remote_at: Some(item.updated_at),
        }
    }

    async fn set_item_status(&self, item_id: &str, status: CardStatus) -> Result<bool> {
        self.ensure_board_cache().await?;
        let Some(board_id) = self.board_id() else {
            return Ok(false);
        };
        let value = self
            .policy
            .board_status_value(status)
            .unwrap_or(status.as_str())
            .to_string();
        let (field_id, option_id) = {
            let Ok(cache) = self.board.lock() else {
                return Ok(false);
            };
            let Some(field_id) = cache.status_field_id.clone() else {
                return Ok(false);
            };
            let Some(option_id) = cache.status_options.get(&value).cloned() else {
                return Ok(false);
            };
            (field_id, option_id)
        };

        let mutation = r#"
            mutation($project: ID!, $item: ID!, $field: ID!, $option: String!) {
              updateProjectV2ItemFieldValue(input: {
                projectId: $project,
                itemId: $item,
                fieldId: $field,
                value: { singleSelectOptionId: $option }
              }) { projectV2Item { id } }
            }"#;
        self.graphql(
            mutation,
            json!({
                "project": board_id,
                "item": item_id,
                "field": field_id,
                "option": option_id,
            }),
        )
        .await?;
        Ok(true)
    }
}

#[async_trait]
impl RemoteAdapter for GithubAdapter {
    fn provider(&self) -> Provider {
        Provider::Github
    }

    async fn check_auth(&self) -> Result<AuthStatus> {
        let resp = self
            .client
            .get(self.rest(""))
            .bearer_auth(&self.token)
            .header("User-Agent", USER_AGENT)
            .send()
            .await
            .context("Failed to reach GitHub")?;
        let status = resp.status();
        if status.is_success() {
            Ok(AuthStatus {
                authenticated: true,
                error: None,
            })
        } else {
            Ok(AuthStatus {
                authenticated: false,
                error: Some(format!("GitHub returned {} for {}", status, self.slug)),
            })
        }
    }

    async fn list_issues(&self) -> Result<Vec<RemoteCard>> {
        self.ensure_board_cache().await?;
        let items = self.list_items("/issues", &[("state", "open")]).await?;
        Ok(items
            .into_iter()
            .filter(|i| i.pull_request.is_none())
            .map(|i| self.item_to_card(i, CardType::Issue))
            .collect())
    }

    async fn list_prs(&self) -> Result<Vec<RemoteCard>> {
        self.ensure_board_cache().await?;
        let items = self.list_items("/pulls", &[("state", "open")]).await?;
        Ok(items
            .into_iter()
            .map(|i| self.item_to_card(i, CardType::Pr))
            .collect())
    }

    async fn list_project_drafts(&self) -> Result<Vec<RemoteCard>> {
        self.ensure_board_cache().await?;
        let drafts = {
            let Ok(cache) = self.board.lock() else {
                return Ok(Vec::new());
            };
            cache.drafts.clone()
        };
        Ok(drafts
            .into_iter()
            .map(|d| {
                let status = d
                    .status_value
                    .as_deref()
                    .and_then(|v| status_from_board_value(&self.policy, v))
                    .unwrap_or(CardStatus::Draft);
                RemoteCard {
                    provider: Provider::Github,
                    card_type: CardType::Draft,
                    remote_repo: self.repo_key.clone(),
                    remote_number: d.item_id.clone(),
                    remote_node_id: Some(d.item_id),
                    remote_url: None,
                    title: d.title,
                    body: d.body,
                    status,
                    ready_eligible: status == CardStatus::Ready,
                    labels: Vec::new(),
                    assignees: Vec::new(),
                    updated_remote_at: None,
                }
            })
            .collect())
    }

    fn status_label(&self, status: CardStatus) -> String {
        self.policy.status_label(status)
    }

    fn all_status_labels(&self) -> Vec<String> {
        self.policy.all_status_labels()
    }

    async fn update_labels(&self, number: &str, add: &[String], remove: &[String]) -> Result<bool> {
        for label in remove {
            let resp = self
                .client
                .delete(self.rest(&format!("/issues/{}/labels/{}", number, label)))
                .bearer_auth(&self.token)
                .header("User-Agent", USER_AGENT)
                .send()
                .await
                .context("Failed to send label removal to GitHub")?;
            // 404 just means the label was not present.
            if !resp.status().is_success() && resp.status() != reqwest::StatusCode::NOT_FOUND {
                anyhow::bail!("GitHub label removal returned {}", resp.status());
            }
        }
        if !add.is_empty() {
            self.client
                .post(self.rest(&format!("/issues/{}/labels", number)))
                .bearer_auth(&self.token)
                .header("User-Agent", USER_AGENT)
                .json(&json!({ "labels": add }))
                .send()
                .await
                .context("Failed to send label addition to GitHub")?
                .error_for_status()
                .context("GitHub label addition returned error status")?;
        }
        Ok(true)
    }

    async fn update_project_status(&self, number: &str, status: CardStatus) -> Result<bool> {
        self.ensure_board_cache().await?;
        let parsed: i64 = match number.parse() {
            Ok(n) => n,
            Err(_) => return Ok(false),
        };
        let item_id = {
            let Ok(cache) = self.board.lock() else {
                return Ok(false);
            };
            match cache.items.get(&parsed) {
                Some(item) => item.item_id.clone(),
                None => return Ok(false),
            }
        };
        self.set_item_status(&item_id, status).await
    }

    async fn update_project_draft_status(&self, node_id: &str, status: CardStatus) -> Result<bool> {
        self.set_item_status(node_id, status).await
    }

    async fn find_repository_project(&self) -> Result<Option<String>> {
        let (owner, name) = self
            .slug
            .split_once('/')
            .with_context(|| format!("Invalid repository slug '{}'", self.slug))?;
        let query = r#"
            query($owner: String!, $name: String!) {
              repository(owner: $owner, name: $name) {
                projectsV2(first: 1) { nodes { id } }
              }
            }"#;
        let resp = self
            .graphql(query, json!({ "owner": owner, "name": name }))
            .await?;
        let id = resp
            .pointer("/data/repository/projectsV2/nodes/0/id")
            .and_then(|v| v.as_str())
            .map(String::from);
        if let (Some(id), Ok(mut cache)) = (id.as_ref(), self.board.lock()) {
            cache.board_id = Some(id.clone());
        }
        Ok(id)
    }

    fn clear_status_cache(&self) {
        if let Ok(mut cache) = self.board.lock() {
            let board_id = cache.board_id.take();
            *cache = BoardCache {
                board_id,
                ..BoardCache::default()
            };
        }
    }

    async fn list_pr_issue_links(&self) -> Result<Vec<PrIssueLink>> {
        let (owner, name) = self
            .slug
            .split_once('/')
            .with_context(|| format!("Invalid repository slug '{}'", self.slug))?;
        let query = r#"
            query($owner: String!, $name: String!) {
              repository(owner: $owner, name: $name) {
                pullRequests(first: 100, states: OPEN) {
                  nodes {
                    number
                    url
                    closingIssuesReferences(first: 10) { nodes { number } }
                  }
                }
              }
            }"#;
        let resp = self
            .graphql(query, json!({ "owner": owner, "name": name }))
            .await?;
        Ok(parse_pr_issue_links(&resp))
    }
}

fn parse_board_payload(
    resp: &Value,
) -> (
    Option<String>,
    HashMap<String, String>,
    HashMap<i64, BoardItem>,
    Vec<BoardDraft>,
) {
    let node = resp.pointer("/data/node");
    let field_id = node
        .and_then(|n| n.pointer("/field/id"))
        .and_then(|v| v.as_str())
        .map(String::from);

    let mut options = HashMap::new();
    if let Some(raw) = node
        .and_then(|n| n.pointer("/field/options"))
        .and_then(|v| v.as_array())
    {
        for option in raw {
            if let (Some(id), Some(name)) = (
                option.get("id").and_then(|v| v.as_str()),
                option.get("name").and_then(|v| v.as_str()),
            ) {
                options.insert(name.to_string(), id.to_string());
            }
        }
    }

    let mut items = HashMap::new();
    let mut drafts = Vec::new();
    if let Some(nodes) = node
        .and_then(|n| n.pointer("/items/nodes"))
        .and_then(|v| v.as_array())
    {
        for item in nodes {
            let Some(item_id) = item.get("id").and_then(|v| v.as_str()) else {
                continue;
            };
            let status_value = item
                .pointer("/fieldValueByName/name")
                .and_then(|v| v.as_str())
                .map(String::from);
            let content = item.get("content");
            let typename = content
                .and_then(|c| c.get("__typename"))
                .and_then(|v| v.as_str())
                .unwrap_or_default();
            match typename {
                "Issue" | "PullRequest" => {
                    if let Some(number) = content
                        .and_then(|c| c.get("number"))
                        .and_then(|v| v.as_i64())
                    {
                        items.insert(
                            number,
                            BoardItem {
                                item_id: item_id.to_string(),
                                status_value,
                            },
                        );
                    }
                }
                "DraftIssue" => {
                    drafts.push(BoardDraft {
                        item_id: item_id.to_string(),
                        title: content
                            .and_then(|c| c.get("title"))
                            .and_then(|v| v.as_str())
                            .unwrap_or_default()
                            .to_string(),
                        body: content
                            .and_then(|c| c.get("body"))
                            .and_then(|v| v.as_str())
                            .unwrap_or_default()
                            .to_string(),
                        status_value,
                    });
                }
                _ => {}
            }
        }
    }
    (field_id, options, items, drafts)
}

fn parse_pr_issue_links(resp: &Value) -> Vec<PrIssueLink> {
    let mut links = Vec::new();
    let Some(nodes) = resp
        .pointer("/data/repository/pullRequests/nodes")
        .and_then(|v| v.as_array())
    else {
        return links;
    };
    for pr in nodes {
        let Some(number) = pr.get("number").and_then(|v| v.as_i64()) else {
            continue;
        };
        let url = pr
            .get("url")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        let issue_numbers: Vec<i64> = pr
            .pointer("/closingIssuesReferences/nodes")
            .and_then(|v| v.as_array())
            .map(|refs| {
                refs.iter()
                    .filter_map(|r| r.get("number").and_then(|v| v.as_i64()))
                    .collect()
            })
            .unwrap_or_default();
        if !issue_numbers.is_empty() {
            links.push(PrIssueLink {
                pr_url: url,
                pr_number: number,
                issue_numbers,
            });
        }
    }
    links
}
