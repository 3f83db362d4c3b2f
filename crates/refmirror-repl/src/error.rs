//! Error types for the replication engine.

use std::time::Duration;
use thiserror::Error;

/// Errors reported by a push attempt against a remote repository.
///
/// Every variant is retryable: the scheduler keeps trying until the
/// destination's retry budget is spent.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// The remote repository does not exist and may not be created.
    #[error("remote repository not found: {url}")]
    RepositoryNotFound {
        /// Concrete remote URL.
        url: String,
    },

    /// A ref the push depends on is not present on the remote yet.
    #[error("ref {ref_name} not present on {url}")]
    MissingRef {
        /// Concrete remote URL.
        url: String,
        /// Ref that was expected on the remote.
        ref_name: String,
    },

    /// The source project could not be read.
    #[error("source project {project} not available")]
    SourceMissing {
        /// Source project name.
        project: String,
    },

    /// The remote refused the update.
    #[error("push to {url} rejected: {reason}")]
    Rejected {
        /// Concrete remote URL.
        url: String,
        /// Remote's explanation.
        reason: String,
    },

    /// The remote could not be reached.
    #[error("connection to {url} failed: {msg}")]
    Connection {
        /// Concrete remote URL.
        url: String,
        /// Error message describing the network issue.
        msg: String,
    },
}

/// Errors that can occur in the replication engine.
#[derive(Debug, Error)]
pub enum ReplError {
    /// Malformed or missing configuration.
    #[error("configuration error: {msg}")]
    Config {
        /// Error message describing the problem.
        msg: String,
    },

    /// A push attempt failed.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// A URL pattern matched no configured destination for the project.
    #[error("no destination matches {pattern} for project {project}")]
    NoMatch {
        /// Pattern or literal URL supplied by the caller.
        pattern: String,
        /// Project the pattern was evaluated against.
        project: String,
    },

    /// The project name cannot be substituted into a URL template.
    #[error("invalid project name {name:?}: {reason}")]
    InvalidProjectName {
        /// The rejected name.
        name: String,
        /// Why it was rejected.
        reason: &'static str,
    },

    /// A bounded wait for replication expired.
    #[error("timed out after {waited:?} waiting for replication")]
    Timeout {
        /// How long the caller waited.
        waited: Duration,
    },

    /// A waiter was released because shutdown did not drain its tasks.
    #[error("replication interrupted by shutdown")]
    ShutdownInterrupted,

    /// The destination was removed from the configuration.
    #[error("destination {name} was removed from the configuration")]
    DestinationRemoved {
        /// Destination name.
        name: String,
    },

    /// The engine is shutting down or stopped and accepts no new work.
    #[error("replication engine shut down")]
    Shutdown,

    /// I/O error.
    #[error("I/O error")]
    Io(#[from] std::io::Error),
}

impl ReplError {
    pub(crate) fn config(msg: impl Into<String>) -> Self {
        ReplError::Config { msg: msg.into() }
    }
}

impl From<toml::de::Error> for ReplError {
    fn from(err: toml::de::Error) -> Self {
        ReplError::config(err.message().to_string())
    }
}

/// Result type for replication operations.
pub type Result<T> = std::result::Result<T, ReplError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_error_display() {
        let err = TransportError::MissingRef {
            url: "/git/p.git".to_string(),
            ref_name: "refs/heads/main".to_string(),
        };
        assert_eq!(err.to_string(), "ref refs/heads/main not present on /git/p.git");
    }

    #[test]
    fn test_transport_error_converts() {
        let err: ReplError = TransportError::Connection {
            url: "ssh://mirror/p.git".to_string(),
            msg: "refused".to_string(),
        }
        .into();
        assert!(matches!(err, ReplError::Transport(_)));
    }

    #[test]
    fn test_toml_error_becomes_config_error() {
        let parsed: std::result::Result<toml::Table, _> = "[remote".parse();
        let err: ReplError = parsed.unwrap_err().into();
        assert!(matches!(err, ReplError::Config { .. }));
    }

    #[test]
    fn test_timeout_display_mentions_duration() {
        let err = ReplError::Timeout {
            waited: Duration::from_secs(2),
        };
        assert!(err.to_string().contains("2s"));
    }
}
