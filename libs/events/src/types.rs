//! Audit event types and payloads.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::EventError;

/// All event type names as constants.
pub mod event_types {
    pub const ENDPOINT_COMMITTED: &str = "endpoint.committed";
    pub const ENDPOINT_ROLLED_BACK: &str = "endpoint.rolled_back";
    pub const ENDPOINT_DELETED: &str = "endpoint.deleted";
}

/// The mutating operation an event belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Deploy,
    Redeploy,
    Delete,
    Unlock,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Deploy => "deploy",
            Operation::Redeploy => "redeploy",
            Operation::Delete => "delete",
            Operation::Unlock => "unlock",
        }
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal outcome of a state-machine run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditOutcome {
    Committed,
    RolledBack,
    Deleted,
}

impl AuditOutcome {
    /// The event type string recorded for this outcome.
    pub fn event_type(&self) -> &'static str {
        match self {
            AuditOutcome::Committed => event_types::ENDPOINT_COMMITTED,
            AuditOutcome::RolledBack => event_types::ENDPOINT_ROLLED_BACK,
            AuditOutcome::Deleted => event_types::ENDPOINT_DELETED,
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, AuditOutcome::RolledBack)
    }
}

impl FromStr for AuditOutcome {
    type Err = EventError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            event_types::ENDPOINT_COMMITTED => Ok(AuditOutcome::Committed),
            event_types::ENDPOINT_ROLLED_BACK => Ok(AuditOutcome::RolledBack),
            event_types::ENDPOINT_DELETED => Ok(AuditOutcome::Deleted),
            other => Err(EventError::UnknownEventType(other.to_string())),
        }
    }
}

/// Event payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditPayload {
    pub operation: Operation,

    /// Error code from the reconciler's taxonomy, for rolled back runs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,

    /// Human-readable failure reason, for rolled back runs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    /// Hash of the desired state in effect after the transition.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spec_hash: Option<String>,
}

impl AuditPayload {
    pub fn new(operation: Operation) -> Self {
        Self {
            operation,
            error_code: None,
            reason: None,
            spec_hash: None,
        }
    }
}
