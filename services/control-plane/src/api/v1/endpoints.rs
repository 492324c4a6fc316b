//! Serving endpoint routes.
//!
//! - `POST   /v1/endpoints`                 deploy
//! - `GET    /v1/endpoints`                 list
//! - `GET    /v1/endpoints/{id}`            status, synced from the cluster first
//! - `DELETE /v1/endpoints/{id}`            delete
//! - `POST   /v1/endpoints/{id}/redeploy`   redeploy with optional overrides
//! - `POST   /v1/endpoints/{id}/unlock`     break a stale lock
//!
//! Mutations run on tracked tasks, so they finish even if the caller hangs up.

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use mserve_id::EndpointId;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::api::envelope::Envelope;
use crate::api::error::ApiError;
use crate::api::request_context::RequestContext;
use crate::serving::model::{DeployRequest, DesiredStateOverrides, ServingEndpoint};
use crate::state::AppState;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/", post(deploy_endpoint).get(list_endpoints))
        .route("/{id}", get(get_endpoint).delete(delete_endpoint))
        .route("/{id}/redeploy", post(redeploy_endpoint))
        .route("/{id}/unlock", post(unlock_endpoint))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct EndpointList {
    pub items: Vec<ServingEndpoint>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DeletedEndpoint {
    pub id: EndpointId,
}

fn parse_id(raw: &str, ctx: &RequestContext) -> Result<EndpointId, ApiError> {
    EndpointId::parse(raw).map_err(|_| {
        ApiError::bad_request("validation_error", format!("invalid endpoint id {raw:?}"))
            .with_request_id(ctx.request_id.clone())
    })
}

/// Decode a JSON body; an empty body is the type's default.
fn parse_body<T>(body: &Bytes, ctx: &RequestContext) -> Result<T, ApiError>
where
    T: Default + for<'de> Deserialize<'de>,
{
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(body).map_err(|e| {
        ApiError::bad_request("validation_error", format!("invalid request body: {e}"))
            .with_request_id(ctx.request_id.clone())
    })
}

fn respond<T: Serialize>(status: StatusCode, envelope: Envelope<T>, ctx: &RequestContext) -> Response {
    (status, Json(envelope.with_request_id(ctx.request_id.clone()))).into_response()
}

async fn deploy_endpoint(
    State(state): State<AppState>,
    ctx: RequestContext,
    body: Bytes,
) -> Result<Response, ApiError> {
    let request: DeployRequest = parse_body(&body, &ctx)?;
    let op = ctx.operation();
    let endpoint = state
        .run_operation(move |o| async move { o.deploy(&op, request).await })
        .await
        .map_err(|e| ApiError::from_reconcile(e, &ctx.request_id))?;

    info!(endpoint_id = %endpoint.id, route = %endpoint.route, actor = %ctx.actor_id, "Endpoint deployed");
    Ok(respond(
        StatusCode::CREATED,
        Envelope::success("endpoint deployed", endpoint),
        &ctx,
    ))
}

async fn list_endpoints(
    State(state): State<AppState>,
    ctx: RequestContext,
) -> Result<Response, ApiError> {
    let items = state
        .orchestrator()
        .list()
        .await
        .map_err(|e| ApiError::from_reconcile(e, &ctx.request_id))?;
    Ok(respond(
        StatusCode::OK,
        Envelope::success(format!("{} endpoints", items.len()), EndpointList { items }),
        &ctx,
    ))
}

async fn get_endpoint(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let id = parse_id(&id, &ctx)?;
    let endpoint = state
        .orchestrator()
        .get_status(&id)
        .await
        .map_err(|e| ApiError::from_reconcile(e, &ctx.request_id))?;
    Ok(respond(
        StatusCode::OK,
        Envelope::success(format!("endpoint is {}", endpoint.status), endpoint),
        &ctx,
    ))
}

async fn delete_endpoint(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let id = parse_id(&id, &ctx)?;
    let op = ctx.operation();
    state
        .run_operation(move |o| async move { o.delete(&op, &id).await })
        .await
        .map_err(|e| ApiError::from_reconcile(e, &ctx.request_id))?;

    info!(endpoint_id = %id, actor = %ctx.actor_id, "Endpoint deleted");
    Ok(respond(
        StatusCode::OK,
        Envelope::success("endpoint deleted", DeletedEndpoint { id }),
        &ctx,
    ))
}

async fn redeploy_endpoint(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(id): Path<String>,
    body: Bytes,
) -> Result<Response, ApiError> {
    let id = parse_id(&id, &ctx)?;
    let overrides: DesiredStateOverrides = parse_body(&body, &ctx)?;
    let op = ctx.operation();
    let endpoint = state
        .run_operation(move |o| async move { o.redeploy(&op, &id, overrides).await })
        .await
        .map_err(|e| ApiError::from_reconcile(e, &ctx.request_id))?;

    info!(endpoint_id = %id, actor = %ctx.actor_id, "Endpoint redeployed");
    Ok(respond(
        StatusCode::OK,
        Envelope::success("endpoint redeployed", endpoint),
        &ctx,
    ))
}

async fn unlock_endpoint(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let id = parse_id(&id, &ctx)?;
    let op = ctx.operation();
    let endpoint = state
        .run_operation(move |o| async move { o.unlock(&op, &id).await })
        .await
        .map_err(|e| ApiError::from_reconcile(e, &ctx.request_id))?;
    Ok(respond(
        StatusCode::OK,
        Envelope::success(format!("endpoint is {}", endpoint.status), endpoint),
        &ctx,
    ))
}
