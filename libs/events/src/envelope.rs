//! Audit event envelope.

use chrono::{DateTime, Utc};
use mserve_id::{AuditEventId, EndpointId, RequestId};
use serde::{Deserialize, Serialize};

use crate::{AuditOutcome, AuditPayload, EventError, Operation};

/// Type of actor that triggered an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ActorType {
    /// A human or API caller.
    User,
    /// The control plane itself (status sync worker, recovery).
    #[default]
    System,
}

impl std::fmt::Display for ActorType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ActorType::User => write!(f, "user"),
            ActorType::System => write!(f, "system"),
        }
    }
}

/// Who asked for an operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub actor_type: ActorType,
    pub actor_id: String,
}

impl Actor {
    pub fn user(id: impl Into<String>) -> Self {
        Self {
            actor_type: ActorType::User,
            actor_id: id.into(),
        }
    }

    pub fn system(component: impl Into<String>) -> Self {
        Self {
            actor_type: ActorType::System,
            actor_id: component.into(),
        }
    }
}

impl std::fmt::Display for Actor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.actor_type, self.actor_id)
    }
}

/// One audit record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    /// Assigned by the sink on insert; `None` until stored.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_id: Option<AuditEventId>,

    pub occurred_at: DateTime<Utc>,
    pub endpoint_id: EndpointId,
    pub outcome: AuditOutcome,
    pub actor: Actor,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<RequestId>,

    pub payload: AuditPayload,
}

impl AuditEvent {
    pub fn builder() -> AuditEventBuilder {
        AuditEventBuilder::default()
    }

    pub fn event_type(&self) -> &'static str {
        self.outcome.event_type()
    }
}

/// Builder for [`AuditEvent`].
#[derive(Debug, Default)]
pub struct AuditEventBuilder {
    occurred_at: Option<DateTime<Utc>>,
    endpoint_id: Option<EndpointId>,
    outcome: Option<AuditOutcome>,
    actor: Option<Actor>,
    request_id: Option<RequestId>,
    operation: Option<Operation>,
    error_code: Option<String>,
    reason: Option<String>,
    spec_hash: Option<String>,
}

impl AuditEventBuilder {
    pub fn occurred_at(mut self, ts: DateTime<Utc>) -> Self {
        self.occurred_at = Some(ts);
        self
    }

    pub fn endpoint(mut self, id: EndpointId) -> Self {
        self.endpoint_id = Some(id);
        self
    }

    pub fn outcome(mut self, outcome: AuditOutcome) -> Self {
        self.outcome = Some(outcome);
        self
    }

    pub fn actor(mut self, actor: Actor) -> Self {
        self.actor = Some(actor);
        self
    }

    pub fn request_id(mut self, request_id: Option<RequestId>) -> Self {
        self.request_id = request_id;
        self
    }

    pub fn operation(mut self, operation: Operation) -> Self {
        self.operation = Some(operation);
        self
    }

    pub fn failure(mut self, code: impl Into<String>, reason: impl Into<String>) -> Self {
        self.error_code = Some(code.into());
        self.reason = Some(reason.into());
        self
    }

    pub fn spec_hash(mut self, hash: impl Into<String>) -> Self {
        self.spec_hash = Some(hash.into());
        self
    }

    pub fn build(self) -> Result<AuditEvent, EventError> {
        let operation = self.operation.ok_or(EventError::MissingField("operation"))?;
        Ok(AuditEvent {
            event_id: None,
            occurred_at: self.occurred_at.unwrap_or_else(Utc::now),
            endpoint_id: self
                .endpoint_id
                .ok_or(EventError::MissingField("endpoint_id"))?,
            outcome: self.outcome.ok_or(EventError::MissingField("outcome"))?,
            actor: self.actor.ok_or(EventError::MissingField("actor"))?,
            request_id: self.request_id,
            payload: AuditPayload {
                operation,
                error_code: self.error_code,
                reason: self.reason,
                spec_hash: self.spec_hash,
            },
        })
    }
}
