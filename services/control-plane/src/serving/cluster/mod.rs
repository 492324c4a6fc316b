//! Cluster resource client.
//!
//! The reconciler talks to the cluster only through [`ClusterClient`], which
//! exposes four capabilities over the resource kinds an endpoint can own:
//! `get`, `create`, `delete` and `list_by_label`. Not-found and already-exists
//! are typed values rather than errors so the confirmer and the creator can
//! branch on them without inspecting status codes.

mod kubernetes;
mod memory;

pub use kubernetes::KubeClusterClient;
pub use memory::{ready_pod, ClusterCall, InMemoryCluster, StuckDeletion};

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use thiserror::Error;

/// Resource kinds an endpoint may own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ResourceKind {
    InferenceService,
    Deployment,
    Service,
    HorizontalPodAutoscaler,
    Ingress,
    Pod,
}

impl ResourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::InferenceService => "InferenceService",
            ResourceKind::Deployment => "Deployment",
            ResourceKind::Service => "Service",
            ResourceKind::HorizontalPodAutoscaler => "HorizontalPodAutoscaler",
            ResourceKind::Ingress => "Ingress",
            ResourceKind::Pod => "Pod",
        }
    }

    /// `(group, version, plural)` used to address the kind over the API.
    pub fn gvr(&self) -> (&'static str, &'static str, &'static str) {
        match self {
            ResourceKind::InferenceService => ("serving.kserve.io", "v1beta1", "inferenceservices"),
            ResourceKind::Deployment => ("apps", "v1", "deployments"),
            ResourceKind::Service => ("", "v1", "services"),
            ResourceKind::HorizontalPodAutoscaler => {
                ("autoscaling", "v2", "horizontalpodautoscalers")
            }
            ResourceKind::Ingress => ("networking.k8s.io", "v1", "ingresses"),
            ResourceKind::Pod => ("", "v1", "pods"),
        }
    }

    pub fn api_version(&self) -> String {
        match self.gvr() {
            ("", version, _) => version.to_string(),
            (group, version, _) => format!("{group}/{version}"),
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A namespaced reference to one cluster object.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceRef {
    pub kind: ResourceKind,
    pub namespace: String,
    pub name: String,
}

impl ResourceRef {
    pub fn new(kind: ResourceKind, namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind,
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind, self.name)
    }
}

/// A live object as returned by the cluster.
#[derive(Debug, Clone, PartialEq)]
pub struct ClusterObject {
    pub resource: ResourceRef,
    pub uid: Option<String>,
    /// Set once the object is terminating.
    pub deletion_timestamp: Option<DateTime<Utc>>,
    /// Full object JSON (`apiVersion`, `kind`, `metadata`, `spec`, `status`).
    pub body: Value,
}

impl ClusterObject {
    pub fn is_terminating(&self) -> bool {
        self.deletion_timestamp.is_some()
    }
}

/// A rendered object to create.
#[derive(Debug, Clone, PartialEq)]
pub struct Manifest {
    pub resource: ResourceRef,
    pub body: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Lookup {
    Found(ClusterObject),
    NotFound,
}

impl Lookup {
    pub fn into_option(self) -> Option<ClusterObject> {
        match self {
            Lookup::Found(obj) => Some(obj),
            Lookup::NotFound => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CreateResult {
    Created(ClusterObject),
    /// An object with the same name already exists (possibly terminating).
    AlreadyExists,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteMode {
    Graceful,
    /// Grace period zero with background propagation.
    Force,
}

/// Cluster API errors, classified by how the caller should react.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ClusterError {
    /// Network failure, throttling, server error or timeout. Safe to retry.
    #[error("transient cluster error on {resource}: {message}")]
    Transient { resource: String, message: String },

    /// The API rejected the request.
    #[error("cluster rejected request on {resource} ({code}): {message}")]
    Rejected {
        resource: String,
        code: u16,
        message: String,
    },

    /// The API returned data we could not decode.
    #[error("malformed cluster data for {resource}: {message}")]
    Malformed { resource: String, message: String },
}

impl ClusterError {
    pub fn transient(resource: impl fmt::Display, message: impl Into<String>) -> Self {
        ClusterError::Transient {
            resource: resource.to_string(),
            message: message.into(),
        }
    }

    pub fn malformed(resource: impl fmt::Display, message: impl Into<String>) -> Self {
        ClusterError::Malformed {
            resource: resource.to_string(),
            message: message.into(),
        }
    }

    /// Classify an HTTP status code returned by the API server.
    pub fn from_status(resource: impl fmt::Display, code: u16, message: impl Into<String>) -> Self {
        if code == 429 || code >= 500 {
            ClusterError::Transient {
                resource: resource.to_string(),
                message: format!("{} ({code})", message.into()),
            }
        } else {
            ClusterError::Rejected {
                resource: resource.to_string(),
                code,
                message: message.into(),
            }
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, ClusterError::Transient { .. })
    }
}

pub type ClusterResult<T> = Result<T, ClusterError>;

/// Capability interface over the cluster API.
#[async_trait]
pub trait ClusterClient: Send + Sync {
    async fn get(&self, resource: &ResourceRef) -> ClusterResult<Lookup>;

    async fn create(&self, manifest: &Manifest) -> ClusterResult<CreateResult>;

    /// Idempotent: deleting an absent object succeeds.
    async fn delete(&self, resource: &ResourceRef, mode: DeleteMode) -> ClusterResult<()>;

    /// `selector` is a `key=value` label selector.
    async fn list_by_label(
        &self,
        kind: ResourceKind,
        namespace: &str,
        selector: &str,
    ) -> ClusterResult<Vec<ClusterObject>>;
}
