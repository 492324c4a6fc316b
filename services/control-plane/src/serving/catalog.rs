//! Model catalog client.
//!
//! The catalog is an external, read-only service. The reconciler only asks it
//! one question: is this model approved, and where does it live?

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::RwLock;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// An approved model as described by the catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovedModel {
    pub storage_uri: String,
    pub model_family: String,
    pub job_type: String,
    /// Free-form hints such as `gpu_count` or `max_input_tokens`.
    #[serde(default)]
    pub metadata: Value,
}

impl ApprovedModel {
    pub fn hint_u32(&self, key: &str) -> Option<u32> {
        self.metadata
            .get(key)
            .and_then(Value::as_u64)
            .and_then(|n| u32::try_from(n).ok())
    }

    pub fn hint_str(&self, key: &str) -> Option<String> {
        self.metadata
            .get(key)
            .and_then(Value::as_str)
            .map(str::to_string)
    }

    pub fn hint_bool(&self, key: &str) -> Option<bool> {
        self.metadata.get(key).and_then(Value::as_bool)
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CatalogError {
    #[error("model {0} not found in catalog")]
    NotFound(String),

    #[error("model {0} is not approved for serving")]
    NotApproved(String),

    #[error("model catalog unavailable: {0}")]
    Unavailable(String),

    #[error("invalid catalog response: {0}")]
    Malformed(String),
}

#[async_trait]
pub trait ModelCatalog: Send + Sync {
    async fn get_approved_model(&self, model_ref: &str) -> Result<ApprovedModel, CatalogError>;
}

#[derive(Debug, Deserialize)]
struct CatalogModel {
    #[serde(default = "default_approved")]
    approved: bool,
    #[serde(flatten)]
    model: ApprovedModel,
}

fn default_approved() -> bool {
    true
}

/// HTTP catalog client: `GET {base_url}/v1/models/{model_ref}`.
#[derive(Clone)]
pub struct HttpModelCatalog {
    base_url: String,
    client: reqwest::Client,
}

impl HttpModelCatalog {
    pub fn new(base_url: impl Into<String>) -> Result<Self, CatalogError> {
        let client = reqwest::Client::builder()
            .timeout(DEFAULT_REQUEST_TIMEOUT)
            .build()
            .map_err(|e| CatalogError::Unavailable(format!("failed to build client: {e}")))?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
        })
    }

    fn model_url(&self, model_ref: &str) -> String {
        format!("{}/v1/models/{}", self.base_url, model_ref)
    }
}

#[async_trait]
impl ModelCatalog for HttpModelCatalog {
    async fn get_approved_model(&self, model_ref: &str) -> Result<ApprovedModel, CatalogError> {
        debug!(model_ref, "Looking up model in catalog");
        let response = self
            .client
            .get(self.model_url(model_ref))
            .send()
            .await
            .map_err(|e| CatalogError::Unavailable(e.to_string()))?;

        match response.status() {
            status if status.is_success() => {
                let found: CatalogModel = response
                    .json()
                    .await
                    .map_err(|e| CatalogError::Malformed(e.to_string()))?;
                if !found.approved {
                    return Err(CatalogError::NotApproved(model_ref.to_string()));
                }
                Ok(found.model)
            }
            StatusCode::NOT_FOUND => Err(CatalogError::NotFound(model_ref.to_string())),
            status if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS => Err(
                CatalogError::Unavailable(format!("catalog returned {status}")),
            ),
            status => Err(CatalogError::Malformed(format!(
                "unexpected catalog status {status}"
            ))),
        }
    }
}

/// Catalog backed by a map, for local runs and tests.
#[derive(Default)]
pub struct InMemoryCatalog {
    models: RwLock<HashMap<String, ApprovedModel>>,
    lookups: AtomicUsize,
}

impl InMemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_model(self, model_ref: impl Into<String>, model: ApprovedModel) -> Self {
        self.insert(model_ref, model);
        self
    }

    pub fn insert(&self, model_ref: impl Into<String>, model: ApprovedModel) {
        self.models
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(model_ref.into(), model);
    }

    /// Number of lookups served so far.
    pub fn lookups(&self) -> usize {
        self.lookups.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl ModelCatalog for InMemoryCatalog {
    async fn get_approved_model(&self, model_ref: &str) -> Result<ApprovedModel, CatalogError> {
        self.lookups.fetch_add(1, Ordering::Relaxed);
        self.models
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(model_ref)
            .cloned()
            .ok_or_else(|| CatalogError::NotFound(model_ref.to_string()))
    }
}
