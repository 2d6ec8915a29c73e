// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error types for the sync engine.
//!
//! Errors are categorized by where they originate (cluster transport,
//! response decoding, record shape, bulk submission) and whether the
//! calling layer may retry them.
//!
//! # Error Categories
//!
//! | Error Type | Retryable | Description |
//! |------------|-----------|-------------|
//! | `Transport` | Yes | HTTP failure, connection refused, timeout |
//! | `BulkWrite` | Yes | Bulk request rejected by the target |
//! | `ClusterNotReady` | Yes | Health check did not pass |
//! | `Decode` | No | Malformed version/health/scroll response |
//! | `DataShape` | No | A fetched record is missing required fields |
//! | `Config` | No | Configuration invalid |
//! | `Invariant` | No | Merge-diff internal-consistency violation |
//! | `Shutdown` | No | Run is shutting down |
//! | `Internal` | No | Unexpected internal error |
//!
//! # Retry Behavior
//!
//! This crate never retries on its own inside `flush()`. The coordinator
//! consults [`SyncError::is_retryable()`] together with
//! [`RetryConfig`](crate::resilience::RetryConfig) to decide.

use thiserror::Error;

/// Result type alias for sync operations.
pub type Result<T> = std::result::Result<T, SyncError>;

/// Errors that can occur while synchronizing two clusters.
#[derive(Error, Debug)]
pub enum SyncError {
    /// HTTP-level failure talking to a cluster.
    #[error("Transport error ({operation}): {message}")]
    Transport {
        operation: String,
        message: String,
        #[source]
        source: Option<reqwest::Error>,
    },

    /// A cluster response could not be decoded.
    #[error("Decode error ({operation}): {message}")]
    Decode { operation: String, message: String },

    /// A fetched record lacks `_id`/`_type`/`_source` or carries an
    /// upstream error status instead of a document.
    ///
    /// Only the offending record is skipped; callers log and continue.
    #[error("Malformed record: {0}")]
    DataShape(String),

    /// The target rejected a bulk request.
    #[error("Bulk write failed (status {status}): {message}")]
    BulkWrite { status: u16, message: String },

    /// Cluster health did not satisfy the readiness requirement.
    #[error("Cluster {cluster} not ready: status {status}")]
    ClusterNotReady { cluster: String, status: String },

    /// Invalid or missing configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Merge-diff internal-consistency violation.
    ///
    /// The run must stop: continuing would produce a wrong diff.
    #[error("Invariant violated: {0}")]
    Invariant(String),

    /// Shutdown in progress.
    #[error("Shutdown in progress")]
    Shutdown,

    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl SyncError {
    /// Create a transport error from a `reqwest::Error`.
    pub fn transport(operation: impl Into<String>, source: reqwest::Error) -> Self {
        Self::Transport {
            operation: operation.into(),
            message: source.to_string(),
            source: Some(source),
        }
    }

    /// Create a transport error without source.
    pub fn transport_msg(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Transport {
            operation: operation.into(),
            message: message.into(),
            source: None,
        }
    }

    /// Create a decode error.
    pub fn decode(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Decode {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport { .. } => true,
            Self::BulkWrite { status, .. } => *status == 0 || *status == 429 || *status >= 500,
            Self::ClusterNotReady { .. } => true,
            Self::Decode { .. } => false,
            Self::DataShape(_) => false,
            Self::Config(_) => false,
            Self::Invariant(_) => false,
            Self::Shutdown => false,
            Self::Internal(_) => false,
        }
    }

    /// Short label used for metrics and log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Transport { .. } => "transport",
            Self::Decode { .. } => "decode",
            Self::DataShape(_) => "data_shape",
            Self::BulkWrite { .. } => "bulk_write",
            Self::ClusterNotReady { .. } => "cluster_not_ready",
            Self::Config(_) => "config",
            Self::Invariant(_) => "invariant",
            Self::Shutdown => "shutdown",
            Self::Internal(_) => "internal",
        }
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(e: reqwest::Error) -> Self {
        Self::transport("unknown", e)
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(e: serde_json::Error) -> Self {
        Self::decode("json", e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_retryable_transport() {
        let err = SyncError::transport_msg("scroll", "connection reset");
        assert!(err.is_retryable());
        assert!(err.to_string().contains("scroll"));
    }

    #[test]
    fn test_bulk_write_retryable_by_status() {
        let busy = SyncError::BulkWrite { status: 429, message: "too many requests".into() };
        assert!(busy.is_retryable());

        let unavailable = SyncError::BulkWrite { status: 503, message: "unavailable".into() };
        assert!(unavailable.is_retryable());

        let bad_request = SyncError::BulkWrite { status: 400, message: "malformed".into() };
        assert!(!bad_request.is_retryable());
    }

    #[test]
    fn test_not_retryable_decode() {
        let err = SyncError::decode("cluster_version", "missing version.number");
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("cluster_version"));
    }

    #[test]
    fn test_not_retryable_invariant() {
        let err = SyncError::Invariant("both sides behind".to_string());
        assert!(!err.is_retryable());
        assert_eq!(err.kind(), "invariant");
    }

    #[test]
    fn test_not_retryable_config() {
        let err = SyncError::Config("page size must be > 0".to_string());
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_cluster_not_ready_formatting() {
        let err = SyncError::ClusterNotReady {
            cluster: "source".to_string(),
            status: "red".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("source"));
        assert!(msg.contains("red"));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_from_serde_json_error() {
        let json_err = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
        let err: SyncError = json_err.into();
        assert_eq!(err.kind(), "decode");
    }
}
