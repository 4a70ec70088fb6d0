//! Per-project sync policy.
//!
//! The policy is stored as free-form JSON on the project row and controls
//! how local statuses map onto the remote system: one textual label per
//! status, plus optional Projects-V2 board integration. A missing or
//! unparsable policy is never an error — the engine falls back to these
//! defaults and logs a warning.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::models::CardStatus;

/// Projects-V2 board integration settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ProjectsV2Config {
    /// Board integration is on unless explicitly disabled.
    pub enabled: bool,
    /// Discovered board node id, persisted after the first successful
    /// auto-discovery so later polls skip the discovery call.
    pub project_id: Option<String>,
    /// Name of the single-select status field on the board.
    pub status_field: String,
    /// Local status -> board option name.
    pub status_values: BTreeMap<String, String>,
}

impl Default for ProjectsV2Config {
    fn default() -> Self {
        let mut status_values = BTreeMap::new();
        status_values.insert("draft".to_string(), "Draft".to_string());
        status_values.insert("ready".to_string(), "Ready".to_string());
        status_values.insert("in_progress".to_string(), "In Progress".to_string());
        status_values.insert("in_review".to_string(), "In Review".to_string());
        status_values.insert("testing".to_string(), "Testing".to_string());
        status_values.insert("done".to_string(), "Done".to_string());
        Self {
            enabled: true,
            project_id: None,
            status_field: "Status".to_string(),
            status_values,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PolicyConfig {
    /// Local status -> remote label.
    pub status_labels: BTreeMap<String, String>,
    pub projects_v2: ProjectsV2Config,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        let mut status_labels = BTreeMap::new();
        for status in CardStatus::ALL {
            status_labels.insert(
                status.as_str().to_string(),
                format!("status:{}", status.as_str()),
            );
        }
        Self {
            status_labels,
            projects_v2: ProjectsV2Config::default(),
        }
    }
}

impl PolicyConfig {
    /// Parse a stored policy, falling back to defaults on any failure.
    pub fn parse(raw: Option<&str>) -> Self {
        match raw {
            None => Self::default(),
            Some(s) if s.trim().is_empty() => Self::default(),
            Some(s) => match serde_json::from_str(s) {
                Ok(policy) => policy,
                Err(e) => {
                    tracing::warn!("unparsable sync policy, using defaults: {}", e);
                    Self::default()
                }
            },
        }
    }

    pub fn to_json(&self) -> String {
        // Serialization of a plain map/struct policy cannot fail.
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }

    /// The label representing `status` on the remote side.
    pub fn status_label(&self, status: CardStatus) -> String {
        self.status_labels
            .get(status.as_str())
            .cloned()
            .unwrap_or_else(|| format!("status:{}", status.as_str()))
    }

    /// Every label this policy uses for statuses, in status order.
    pub fn all_status_labels(&self) -> Vec<String> {
        CardStatus::ALL
            .iter()
            .map(|s| self.status_label(*s))
            .collect()
    }

    /// Board option name for `status`, if board integration maps it.
    pub fn board_status_value(&self, status: CardStatus) -> Option<&str> {
        self.projects_v2
            .status_values
            .get(status.as_str())
            .map(String::as_str)
    }

    /// Reverse lookup: board option name -> local status.
    pub fn status_for_board_value(&self, value: &str) -> Option<CardStatus> {
        self.projects_v2
            .status_values
            .iter()
            .find(|(_, v)| v.as_str() == value)
            .and_then(|(k, _)| k.parse().ok())
    }

    /// Reverse lookup: remote label -> local status.
    pub fn status_for_label(&self, label: &str) -> Option<CardStatus> {
        self.status_labels
            .iter()
            .find(|(_, v)| v.as_str() == label)
            .and_then(|(k, _)| k.parse().ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_cover_all_statuses() {
        let policy = PolicyConfig::default();
        for status in CardStatus::ALL {
            assert_eq!(
                policy.status_label(status),
                format!("status:{}", status.as_str())
            );
            assert!(policy.board_status_value(status).is_some());
        }
        assert_eq!(policy.all_status_labels().len(), 6);
    }

    #[test]
    fn test_parse_none_yields_defaults() {
        assert_eq!(PolicyConfig::parse(None), PolicyConfig::default());
    }

    #[test]
    fn test_parse_empty_yields_defaults() {
        assert_eq!(PolicyConfig::parse(Some("  ")), PolicyConfig::default());
    }

    #[test]
    fn test_parse_garbage_yields_defaults() {
        assert_eq!(
            PolicyConfig::parse(Some("{not json at all")),
            PolicyConfig::default()
        );
    }

    #[test]
    fn test_parse_partial_policy_fills_defaults() {
        let policy =
            PolicyConfig::parse(Some(r#"{"projects_v2": {"enabled": false}}"#));
        assert!(!policy.projects_v2.enabled);
        // Unspecified sections keep their defaults.
        assert_eq!(policy.status_label(CardStatus::Ready), "status:ready");
        assert_eq!(policy.projects_v2.status_field, "Status");
    }

    #[test]
    fn test_parse_custom_labels() {
        let policy = PolicyConfig::parse(Some(
            r#"{"status_labels": {"ready": "triage/ready", "done": "closed"}}"#,
        ));
        assert_eq!(policy.status_label(CardStatus::Ready), "triage/ready");
        assert_eq!(policy.status_label(CardStatus::Done), "closed");
        // Statuses absent from the custom map get the built-in label.
        assert_eq!(policy.status_label(CardStatus::Testing), "status:testing");
    }

    #[test]
    fn test_board_value_reverse_lookup() {
        let policy = PolicyConfig::default();
        assert_eq!(
            policy.status_for_board_value("In Progress"),
            Some(CardStatus::InProgress)
        );
        assert_eq!(policy.status_for_board_value("Shipped"), None);
    }

    #[test]
    fn test_label_reverse_lookup() {
        let policy = PolicyConfig::default();
        assert_eq!(
            policy.status_for_label("status:in_review"),
            Some(CardStatus::InReview)
        );
        assert_eq!(policy.status_for_label("bug"), None);
    }

    #[test]
    fn test_json_roundtrip_preserves_discovered_board_id() {
        let mut policy = PolicyConfig::default();
        policy.projects_v2.project_id = Some("PVT_abc123".to_string());
        let parsed = PolicyConfig::parse(Some(&policy.to_json()));
        assert_eq!(parsed.projects_v2.project_id.as_deref(), Some("PVT_abc123"));
    }
}
