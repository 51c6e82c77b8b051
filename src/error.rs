//! Error types for the iSCSI provisioner
//!
//! The caller-facing taxonomy is small: configuration problems, an unreachable
//! appliance, and non-recoverable appliance-side rejections. Duplicate-create
//! conflicts never show up here; they are an outcome of the resource client
//! and are absorbed by the saga.

use crate::domain::resources::ResourceKind;
use std::time::Duration;
use thiserror::Error;

/// Appliance message returned when deleting a volume that is already gone
const MISSING_DATASET_MESSAGE: &str = "dataset does not exist";

/// Unified error type for the provisioner
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Internal Errors
    // =========================================================================
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    // =========================================================================
    // Appliance Errors
    // =========================================================================
    #[error("Appliance unreachable while trying to {operation} {kind}: {reason}")]
    Connectivity {
        kind: ResourceKind,
        operation: String,
        reason: String,
    },

    #[error("Appliance rejected {operation} {kind}: {reason}")]
    Resource {
        kind: ResourceKind,
        operation: String,
        reason: String,
    },

    // =========================================================================
    // Kubernetes Errors
    // =========================================================================
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    // =========================================================================
    // Parse Errors
    // =========================================================================
    #[error("Capacity parse error: {0}")]
    CapacityParse(String),

    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("YAML parse error: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    // =========================================================================
    // IO Errors
    // =========================================================================
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Action to take on error, advised to the invoking controller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorAction {
    /// Requeue with exponential backoff
    RequeueWithBackoff,
    /// Requeue after specific duration
    RequeueAfter(Duration),
    /// Don't requeue, wait for changes
    NoRequeue,
}

impl Error {
    /// Shorthand for a resource rejection
    pub fn resource(
        kind: ResourceKind,
        operation: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Error::Resource {
            kind,
            operation: operation.into(),
            reason: reason.into(),
        }
    }

    /// Shorthand for a connectivity failure
    pub fn connectivity(
        kind: ResourceKind,
        operation: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Error::Connectivity {
            kind,
            operation: operation.into(),
            reason: reason.into(),
        }
    }

    /// Prefix the operation of an appliance error with the step that issued it.
    ///
    /// Other variants pass through untouched.
    pub fn in_step(self, step: &str) -> Self {
        match self {
            Error::Connectivity {
                kind,
                operation,
                reason,
            } => Error::Connectivity {
                kind,
                operation: format!("{} ({})", operation, step),
                reason,
            },
            Error::Resource {
                kind,
                operation,
                reason,
            } => Error::Resource {
                kind,
                operation: format!("{} ({})", operation, step),
                reason,
            },
            other => other,
        }
    }

    /// Whether this error is the appliance reporting a volume's dataset as missing.
    ///
    /// The appliance answers a delete of an already-removed volume with a plain
    /// 400 and this message instead of a 404.
    pub fn is_missing_dataset(&self) -> bool {
        match self {
            Error::Resource {
                kind: ResourceKind::Volume,
                reason,
                ..
            } => reason.contains(MISSING_DATASET_MESSAGE),
            _ => false,
        }
    }

    /// Determine what action to take for this error
    pub fn action(&self) -> ErrorAction {
        match self {
            // Transient errors - retry with backoff
            Error::Connectivity { .. } | Error::Kube(_) => ErrorAction::RequeueWithBackoff,

            // Appliance refused - give it time before trying again
            Error::Resource { .. } => ErrorAction::RequeueAfter(Duration::from_secs(60)),

            // Configuration/validation errors - don't retry automatically
            Error::Configuration(_)
            | Error::CapacityParse(_)
            | Error::JsonParse(_)
            | Error::YamlParse(_) => ErrorAction::NoRequeue,

            // All other errors - retry with backoff
            _ => ErrorAction::RequeueWithBackoff,
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        !matches!(self.action(), ErrorAction::NoRequeue)
    }

    /// Check if this error is transient
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Connectivity { .. } | Error::Kube(_))
    }
}

/// Result type alias for the provisioner
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_actions() {
        let err = Error::connectivity(ResourceKind::Target, "create", "connection refused");
        assert_eq!(err.action(), ErrorAction::RequeueWithBackoff);

        let err = Error::Configuration("bad config".into());
        assert_eq!(err.action(), ErrorAction::NoRequeue);

        let err = Error::resource(ResourceKind::Extent, "create", "status 500");
        assert_eq!(
            err.action(),
            ErrorAction::RequeueAfter(Duration::from_secs(60))
        );
    }

    #[test]
    fn test_error_retryable() {
        let transient = Error::connectivity(ResourceKind::Volume, "delete", "timed out");
        assert!(transient.is_retryable());
        assert!(transient.is_transient());

        let config_err = Error::Configuration("invalid".into());
        assert!(!config_err.is_retryable());
        assert!(!config_err.is_transient());

        let bad_body = Error::from(serde_json::from_str::<u64>("nope").unwrap_err());
        assert!(!bad_body.is_retryable());
    }

    #[test]
    fn test_in_step_keeps_kind() {
        let err = Error::resource(ResourceKind::Extent, "create", "status 500").in_step("extent");
        match err {
            Error::Resource {
                kind, operation, ..
            } => {
                assert_eq!(kind, ResourceKind::Extent);
                assert_eq!(operation, "create (extent)");
            }
            other => panic!("unexpected error: {other}"),
        }

        let err = Error::Configuration("x".into()).in_step("naming");
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn test_missing_dataset_classification() {
        let err = Error::resource(
            ResourceKind::Volume,
            "delete",
            "status 400: {\"__all__\": [\"dataset does not exist\"]}",
        );
        assert!(err.is_missing_dataset());

        // Only volumes carry this meaning
        let err = Error::resource(ResourceKind::Extent, "delete", "dataset does not exist");
        assert!(!err.is_missing_dataset());

        let err = Error::resource(ResourceKind::Volume, "delete", "volume is busy");
        assert!(!err.is_missing_dataset());
    }
}
