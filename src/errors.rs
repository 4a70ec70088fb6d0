//! Typed error hierarchy for the automation core.
//!
//! Two top-level enums cover the two subsystems:
//! - `IndexError` — index-build failures, with distinguished variants the
//!   scheduler maps onto terminal job states
//! - `SyncError` — reconciliation engine failures

use thiserror::Error;

/// Errors from the index-build routine. The scheduler maps each variant to
/// a terminal job state: `Canceled` -> canceled, `AlreadyRunning` -> blocked
/// (with an implicit retry via the pending flag), everything else -> failed.
#[derive(Debug, Error)]
pub enum IndexError {
    #[error("index build canceled")]
    Canceled,

    #[error("another process holds the index lock for {repo_root}")]
    AlreadyRunning { repo_root: String },

    #[error("workspace at {repo_root} is not writable")]
    NotWritable { repo_root: String },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Errors from the reconciliation engine and its adapters.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Project {id} not found")]
    ProjectNotFound { id: i64 },

    #[error("Project {id} has no remote repository configured")]
    MissingRemote { id: i64 },

    #[error("Card {id} not found")]
    CardNotFound { id: i64 },

    #[error("Card {id} has no remote identifier to push to")]
    MissingRemoteIdentifier { id: i64 },

    #[error("No adapter for remote repository key '{repo}'")]
    UnknownProvider { repo: String },

    #[error("No access token configured for {provider}")]
    MissingToken { provider: String },

    #[error("Not authenticated: {0}")]
    NotAuthenticated(String),

    #[error("Remote API error: {0}")]
    Api(String),

    #[error("Database error: {0}")]
    Database(#[source] anyhow::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn index_error_canceled_is_matchable() {
        let err = IndexError::Canceled;
        assert!(matches!(err, IndexError::Canceled));
    }

    #[test]
    fn index_error_already_running_carries_repo_root() {
        let err = IndexError::AlreadyRunning {
            repo_root: "/tmp/repo".to_string(),
        };
        assert!(err.to_string().contains("/tmp/repo"));
        match &err {
            IndexError::AlreadyRunning { repo_root } => assert_eq!(repo_root, "/tmp/repo"),
            _ => panic!("Expected AlreadyRunning"),
        }
    }

    #[test]
    fn sync_error_project_not_found_carries_id() {
        let err = SyncError::ProjectNotFound { id: 7 };
        assert!(err.to_string().contains('7'));
    }

    #[test]
    fn sync_error_unknown_provider_carries_repo_key() {
        let err = SyncError::UnknownProvider {
            repo: "svn:trunk".to_string(),
        };
        assert!(err.to_string().contains("svn:trunk"));
    }

    #[test]
    fn sync_error_variants_are_distinct() {
        let missing = SyncError::MissingRemote { id: 1 };
        let not_found = SyncError::ProjectNotFound { id: 1 };
        assert!(matches!(missing, SyncError::MissingRemote { .. }));
        assert!(!matches!(missing, SyncError::ProjectNotFound { .. }));
        assert!(matches!(not_found, SyncError::ProjectNotFound { .. }));
    }

    #[test]
    fn all_error_types_implement_std_error_trait() {
        fn assert_std_error<E: std::error::Error>(_: &E) {}
        assert_std_error(&IndexError::Canceled);
        assert_std_error(&SyncError::NotAuthenticated("token expired".into()));
    }
}
