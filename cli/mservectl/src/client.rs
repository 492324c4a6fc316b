//! HTTP client for the control plane API.

use anyhow::{Context, Result};
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::config::Config;
use crate::error::CliError;

const ACTOR_HEADER: &str = "x-actor-id";

/// API client for communicating with the control plane.
#[derive(Debug, Clone)]
pub struct ApiClient {
    client: reqwest::Client,
    base_url: String,
}

/// The control plane's result envelope.
#[derive(Debug, Deserialize)]
struct Envelope<T> {
    status: String,
    #[serde(default)]
    message: String,
    data: Option<T>,
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    retryable: Option<bool>,
    #[serde(default)]
    request_id: Option<String>,
}

impl ApiClient {
    pub fn new(config: &Config) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        if let Some(actor) = &config.actor {
            headers.insert(
                ACTOR_HEADER,
                HeaderValue::from_str(actor).context("Invalid actor")?,
            );
        }

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            base_url: config.api_url.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, CliError> {
        let response = self.client.get(self.url(path)).send().await?;
        Self::handle_response(response).await
    }

    pub async fn post<T: DeserializeOwned, B: Serialize>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, CliError> {
        let response = self.client.post(self.url(path)).json(body).send().await?;
        Self::handle_response(response).await
    }

    /// POST without a body.
    pub async fn post_empty<T: DeserializeOwned>(&self, path: &str) -> Result<T, CliError> {
        let response = self.client.post(self.url(path)).send().await?;
        Self::handle_response(response).await
    }

    pub async fn delete<T: DeserializeOwned>(&self, path: &str) -> Result<T, CliError> {
        let response = self.client.delete(self.url(path)).send().await?;
        Self::handle_response(response).await
    }

    /// Unwrap the envelope: `data` on success, [`CliError::Api`] on `fail`.
    async fn handle_response<T: DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, CliError> {
        let status = response.status().as_u16();
        let bytes = response.bytes().await?;

        let envelope: Envelope<T> = match serde_json::from_slice(&bytes) {
            Ok(envelope) => envelope,
            Err(e) if (200..300).contains(&status) => {
                return Err(CliError::Decode(format!("failed to parse response: {e}")));
            }
            Err(_) => {
                return Err(CliError::Api {
                    status,
                    code: "unknown".to_string(),
                    message: format!("HTTP {status}: {}", String::from_utf8_lossy(&bytes)),
                    retryable: status >= 500,
                    request_id: None,
                })
            }
        };

        if envelope.status == "success" {
            if let Some(data) = envelope.data {
                return Ok(data);
            }
            return Err(CliError::Decode("success envelope without data".to_string()));
        }

        Err(CliError::Api {
            status,
            code: envelope.code.unwrap_or_else(|| "unknown".to_string()),
            message: envelope.message,
            retryable: envelope.retryable.unwrap_or(false),
            request_id: envelope.request_id,
        })
    }
}
