use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};

use super::envelope::Envelope;
use crate::serving::ReconcileError;

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub body: Box<Envelope<()>>,
}

impl ApiError {
    fn new(status: StatusCode, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            status,
            body: Box::new(Envelope::fail(code, message)),
        }
    }

    pub fn bad_request(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, code, message)
    }

    pub fn not_found(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, code, message)
    }

    pub fn internal(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, code, message)
    }

    pub fn conflict(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(StatusCode::CONFLICT, code, message)
    }

    pub fn gateway_timeout(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(StatusCode::GATEWAY_TIMEOUT, code, message)
    }

    pub fn service_unavailable(code: impl Into<String>, message: impl Into<String>) -> Self {
        let mut err = Self::new(StatusCode::SERVICE_UNAVAILABLE, code, message);
        err.body.retryable = Some(true);
        err
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.body.request_id = Some(request_id.into());
        self
    }

    /// Map an orchestrator failure onto its HTTP status.
    pub fn from_reconcile(err: ReconcileError, request_id: &str) -> Self {
        let code = err.code();
        let message = err.to_string();
        let api = match err {
            ReconcileError::AlreadyInProgress { .. } => Self::conflict(code, message),
            ReconcileError::Validation(_) => Self::bad_request(code, message),
            ReconcileError::NotFound(_) => Self::not_found(code, message),
            ReconcileError::DeletionTimeout { .. } => Self::gateway_timeout(code, message),
            ReconcileError::CreationConflictExhausted { .. } => Self::conflict(code, message),
            ReconcileError::Transient(_) => Self::service_unavailable(code, message),
            ReconcileError::Fatal(_) => Self::internal(code, message),
        };
        api.with_request_id(request_id)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}
