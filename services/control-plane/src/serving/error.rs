//! Reconciler error taxonomy.

use std::time::Duration;

use mserve_id::EndpointId;
use thiserror::Error;

use super::catalog::CatalogError;
use super::cluster::ClusterError;
use super::manifests::RenderError;
use super::store::StoreError;

/// Errors surfaced by orchestrator operations.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ReconcileError {
    /// Another mutation holds the endpoint lock.
    #[error("a {status} operation is already in progress for endpoint {id}")]
    AlreadyInProgress { id: EndpointId, status: String },

    /// The request or the resolved desired state is invalid.
    #[error("invalid request: {0}")]
    Validation(String),

    #[error("endpoint {0} not found")]
    NotFound(EndpointId),

    /// Previous resources did not disappear in time.
    #[error(
        "deletion of previous resources timed out after {}s; resources may require manual cleanup: {}",
        .elapsed.as_secs(),
        .remaining.join(", ")
    )]
    DeletionTimeout {
        elapsed: Duration,
        remaining: Vec<String>,
    },

    /// A name kept conflicting after every delete-and-retry attempt.
    #[error("creation of {resource} still conflicted after {attempts} attempts")]
    CreationConflictExhausted { resource: String, attempts: u32 },

    /// Retryable cluster or dependency failure.
    #[error("transient error: {0}")]
    Transient(String),

    /// Unexpected internal condition: malformed data, store failure, panic.
    #[error("internal error: {0}")]
    Fatal(String),
}

impl ReconcileError {
    /// Stable error code carried in `fail` envelopes and audit events.
    pub fn code(&self) -> &'static str {
        match self {
            ReconcileError::AlreadyInProgress { .. } => "already_in_progress",
            ReconcileError::Validation(_) => "validation_error",
            ReconcileError::NotFound(_) => "not_found",
            ReconcileError::DeletionTimeout { .. } => "deletion_timeout",
            ReconcileError::CreationConflictExhausted { .. } => "creation_conflict_exhausted",
            ReconcileError::Transient(_) => "transient_cluster_error",
            ReconcileError::Fatal(_) => "fatal",
        }
    }

    /// User errors are returned before anything is touched.
    pub fn is_user_error(&self) -> bool {
        matches!(
            self,
            ReconcileError::AlreadyInProgress { .. }
                | ReconcileError::Validation(_)
                | ReconcileError::NotFound(_)
        )
    }

    /// Whether retrying the same operation later may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ReconcileError::AlreadyInProgress { .. }
                | ReconcileError::DeletionTimeout { .. }
                | ReconcileError::CreationConflictExhausted { .. }
                | ReconcileError::Transient(_)
        )
    }
}

impl From<ClusterError> for ReconcileError {
    fn from(err: ClusterError) -> Self {
        if err.is_transient() {
            ReconcileError::Transient(err.to_string())
        } else {
            ReconcileError::Fatal(err.to_string())
        }
    }
}

impl From<CatalogError> for ReconcileError {
    fn from(err: CatalogError) -> Self {
        match err {
            CatalogError::NotFound(_) | CatalogError::NotApproved(_) => {
                ReconcileError::Validation(err.to_string())
            }
            CatalogError::Unavailable(_) => ReconcileError::Transient(err.to_string()),
            CatalogError::Malformed(_) => ReconcileError::Fatal(err.to_string()),
        }
    }
}

impl From<StoreError> for ReconcileError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(id) => ReconcileError::NotFound(id),
            StoreError::RouteTaken(route) => {
                ReconcileError::Validation(format!("route {route} is already in use"))
            }
            other => ReconcileError::Fatal(other.to_string()),
        }
    }
}

impl From<RenderError> for ReconcileError {
    fn from(err: RenderError) -> Self {
        ReconcileError::Fatal(err.to_string())
    }
}
