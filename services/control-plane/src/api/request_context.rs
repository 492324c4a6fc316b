//! Request-scoped context extracted from HTTP requests.

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum::http::HeaderMap;
use mserve_id::RequestId;

use crate::api::error::ApiError;
use crate::serving::OperationContext;

pub const ACTOR_HEADER: &str = "x-actor-id";
pub const REQUEST_ID_HEADER: &str = "x-request-id";

const ANONYMOUS: &str = "anonymous";
const MAX_ACTOR_LEN: usize = 128;

#[derive(Debug, Clone)]
pub struct RequestContext {
    /// Echoed back in every response envelope.
    pub request_id: String,
    pub actor_id: String,
}

impl RequestContext {
    /// The orchestrator's view of this request. Caller-supplied request ids
    /// that are not ours are kept in responses but not in audit events.
    pub fn operation(&self) -> OperationContext {
        OperationContext::user(self.actor_id.clone())
            .with_request_id(RequestId::parse(&self.request_id).ok())
    }
}

fn header_string(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

impl<S> FromRequestParts<S> for RequestContext
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let request_id = header_string(&parts.headers, REQUEST_ID_HEADER)
            .unwrap_or_else(|| RequestId::new().to_string());

        let actor_id =
            header_string(&parts.headers, ACTOR_HEADER).unwrap_or_else(|| ANONYMOUS.to_string());
        if actor_id.len() > MAX_ACTOR_LEN || actor_id.chars().any(char::is_control) {
            return Err(ApiError::bad_request(
                "validation_error",
                format!("X-Actor-Id must be at most {MAX_ACTOR_LEN} printable characters"),
            )
            .with_request_id(request_id));
        }

        Ok(Self {
            request_id,
            actor_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;

    async fn extract(request: Request<()>) -> Result<RequestContext, ApiError> {
        let (mut parts, _) = request.into_parts();
        RequestContext::from_request_parts(&mut parts, &()).await
    }

    #[tokio::test]
    async fn test_defaults() {
        let ctx = extract(Request::builder().body(()).unwrap()).await.unwrap();
        assert_eq!(ctx.actor_id, "anonymous");
        assert!(RequestId::parse(&ctx.request_id).is_ok());
        assert!(ctx.operation().request_id.is_some());
    }

    #[tokio::test]
    async fn test_headers_are_used() {
        let request = Request::builder()
            .header("X-Actor-Id", "alice")
            .header("X-Request-Id", "trace-42")
            .body(())
            .unwrap();
        let ctx = extract(request).await.unwrap();
        assert_eq!(ctx.actor_id, "alice");
        assert_eq!(ctx.request_id, "trace-42");
        assert!(ctx.operation().request_id.is_none());
        assert_eq!(ctx.operation().actor.to_string(), "user:alice");
    }

    #[tokio::test]
    async fn test_rejects_oversized_actor() {
        let request = Request::builder()
            .header("X-Actor-Id", "a".repeat(200))
            .body(())
            .unwrap();
        let err = extract(request).await.unwrap_err();
        assert_eq!(err.status, axum::http::StatusCode::BAD_REQUEST);
    }
}
