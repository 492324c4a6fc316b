//! The uniform result envelope.
//!
//! Every v1 response body is `{status, message, data}`; failures add `code`
//! and `retryable`. `request_id` echoes the caller's `X-Request-Id`.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultStatus {
    Success,
    Fail,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Envelope<T> {
    pub status: ResultStatus,
    pub message: String,
    pub data: Option<T>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retryable: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

impl<T> Envelope<T> {
    pub fn success(message: impl Into<String>, data: T) -> Self {
        Self {
            status: ResultStatus::Success,
            message: message.into(),
            data: Some(data),
            code: None,
            retryable: None,
            request_id: None,
        }
    }

    pub fn fail(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            status: ResultStatus::Fail,
            message: message.into(),
            data: None,
            code: Some(code.into()),
            retryable: Some(false),
            request_id: None,
        }
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }
}
