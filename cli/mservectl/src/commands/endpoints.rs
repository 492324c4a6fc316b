//! Serving endpoint commands.

use anyhow::Result;
use chrono::{DateTime, Utc};
use clap::{Args, ValueEnum};
use serde::{Deserialize, Serialize};
use tabled::Tabled;

use crate::output::{colour_status, print_info, print_output, print_single, print_success, OutputFormat};

use super::CommandContext;

#[derive(Debug, Clone, Copy, Serialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum Framework {
    Managed,
    Raw,
}

#[derive(Debug, Clone, Copy, Serialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum Target {
    Vllm,
    Tgi,
    Triton,
    External,
}

#[derive(Debug, Clone, Copy, Serialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    Concurrency,
    Cpu,
    Rps,
}

/// Settings shared by deploy and redeploy. Anything left unset keeps its
/// stored value, or falls back to catalog hints and server defaults.
#[derive(Debug, Clone, Default, Args, Serialize)]
pub struct SpecArgs {
    /// Catalog model reference.
    #[arg(long = "model")]
    #[serde(skip_serializing_if = "Option::is_none")]
    model_ref: Option<String>,

    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    model_family: Option<String>,

    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    job_type: Option<String>,

    /// Model server to run, or `external` for a hosted model.
    #[arg(long = "target", value_enum)]
    #[serde(skip_serializing_if = "Option::is_none")]
    serve_target: Option<Target>,

    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    storage_uri: Option<String>,

    /// Upstream URL for external targets.
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    external_url: Option<String>,

    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    gpu_count: Option<u32>,

    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    gpu_memory_gb: Option<u32>,

    /// CPU quantity, e.g. `4` or `500m`.
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    cpu: Option<String>,

    /// Memory quantity, e.g. `16Gi`.
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    memory: Option<String>,

    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    max_concurrent_requests: Option<u32>,

    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    max_input_tokens: Option<u32>,

    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    max_output_tokens: Option<u32>,

    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    use_gpu: Option<bool>,

    /// Container image, overriding the configured default.
    #[arg(long = "image")]
    #[serde(skip_serializing_if = "Option::is_none")]
    runtime_image: Option<String>,

    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    min_replicas: Option<u32>,

    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    max_replicas: Option<u32>,

    #[arg(long, value_enum, requires = "scale_target")]
    #[serde(skip)]
    scale_metric: Option<Metric>,

    #[arg(long, requires = "scale_metric")]
    #[serde(skip)]
    scale_target: Option<u32>,

    #[arg(long = "framework", value_enum)]
    #[serde(skip_serializing_if = "Option::is_none")]
    serving_framework: Option<Framework>,
}

impl SpecArgs {
    /// The JSON overrides object the API expects.
    fn to_body(&self) -> Result<serde_json::Value> {
        let mut body = serde_json::to_value(self)?;
        if let (Some(metric), Some(target)) = (self.scale_metric, self.scale_target) {
            body["autoscale_policy"] = serde_json::json!({ "metric": metric, "target": target });
        }
        Ok(body)
    }
}

#[derive(Debug, Args)]
pub struct DeployArgs {
    /// Display name.
    name: String,

    /// Public route path, e.g. `/chat/llama`.
    #[arg(long)]
    route: String,

    /// Cluster namespace; the server default when omitted.
    #[arg(long)]
    namespace: Option<String>,

    #[command(flatten)]
    spec: SpecArgs,
}

#[derive(Debug, Args)]
pub struct RedeployArgs {
    /// Endpoint ID.
    id: String,

    #[command(flatten)]
    spec: SpecArgs,
}

#[derive(Debug, Args)]
pub struct IdArgs {
    /// Endpoint ID.
    id: String,
}

/// The fields of an endpoint the CLI displays.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Endpoint {
    id: String,
    name: String,
    route: String,
    namespace: String,
    serving_framework: String,
    status: String,
    #[serde(default)]
    status_message: Option<String>,
    min_replicas: u32,
    max_replicas: u32,
    #[serde(default)]
    last_health_check_at: Option<DateTime<Utc>>,
    updated_at: DateTime<Utc>,
    /// Everything else, kept for JSON output.
    #[serde(flatten)]
    rest: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Serialize, Tabled)]
struct EndpointRow {
    #[tabled(rename = "ID")]
    id: String,
    #[tabled(rename = "Name")]
    name: String,
    #[tabled(rename = "Route")]
    route: String,
    #[tabled(rename = "Framework")]
    framework: String,
    #[tabled(rename = "Status")]
    status: String,
    #[tabled(rename = "Replicas")]
    replicas: String,
    #[tabled(rename = "Checked")]
    checked: String,
}

impl From<&Endpoint> for EndpointRow {
    fn from(e: &Endpoint) -> Self {
        Self {
            id: e.id.clone(),
            name: e.name.clone(),
            route: e.route.clone(),
            framework: e.serving_framework.clone(),
            status: colour_status(&e.status),
            replicas: format!("{}-{}", e.min_replicas, e.max_replicas),
            checked: e
                .last_health_check_at
                .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
                .unwrap_or_else(|| "-".to_string()),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct EndpointList {
    items: Vec<Endpoint>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Deleted {
    id: String,
}

fn show(ctx: &CommandContext, endpoint: &Endpoint, verb: &str) {
    match ctx.format {
        OutputFormat::Json => print_single(endpoint),
        OutputFormat::Table => {
            print_success(&format!(
                "{verb} endpoint '{}' ({}) at {}",
                endpoint.name, endpoint.id, endpoint.route
            ));
            describe(endpoint);
        }
    }
}

fn describe(endpoint: &Endpoint) {
    println!("  status:    {}", colour_status(&endpoint.status));
    if let Some(message) = &endpoint.status_message {
        println!("  message:   {message}");
    }
    println!("  framework: {}", endpoint.serving_framework);
    println!("  namespace: {}", endpoint.namespace);
    println!(
        "  replicas:  {}-{}",
        endpoint.min_replicas, endpoint.max_replicas
    );
}

pub async fn deploy(ctx: CommandContext, args: DeployArgs) -> Result<()> {
    let client = ctx.client()?;

    let mut body = args.spec.to_body()?;
    body["name"] = args.name.into();
    body["route"] = args.route.into();
    if let Some(namespace) = args.namespace {
        body["namespace"] = namespace.into();
    }

    let endpoint: Endpoint = client.post("/v1/endpoints", &body).await?;
    show(&ctx, &endpoint, "Deployed");
    Ok(())
}

pub async fn redeploy(ctx: CommandContext, args: RedeployArgs) -> Result<()> {
    let client = ctx.client()?;
    let body = args.spec.to_body()?;

    let endpoint: Endpoint = client
        .post(&format!("/v1/endpoints/{}/redeploy", args.id), &body)
        .await?;
    show(&ctx, &endpoint, "Redeployed");
    Ok(())
}

pub async fn delete(ctx: CommandContext, args: IdArgs) -> Result<()> {
    let client = ctx.client()?;
    let deleted: Deleted = client
        .delete(&format!("/v1/endpoints/{}", args.id))
        .await?;

    match ctx.format {
        OutputFormat::Json => print_single(&deleted),
        OutputFormat::Table => print_success(&format!("Deleted endpoint {}", deleted.id)),
    }
    Ok(())
}

pub async fn status(ctx: CommandContext, args: IdArgs) -> Result<()> {
    let client = ctx.client()?;
    let endpoint: Endpoint = client.get(&format!("/v1/endpoints/{}", args.id)).await?;

    match ctx.format {
        OutputFormat::Json => print_single(&endpoint),
        OutputFormat::Table => {
            println!("{} ({})", endpoint.name, endpoint.id);
            println!("  route:     {}", endpoint.route);
            describe(&endpoint);
        }
    }
    Ok(())
}

pub async fn list(ctx: CommandContext) -> Result<()> {
    let client = ctx.client()?;
    let list: EndpointList = client.get("/v1/endpoints").await?;

    match ctx.format {
        OutputFormat::Json => print_single(&list.items),
        OutputFormat::Table => {
            let rows: Vec<EndpointRow> = list.items.iter().map(EndpointRow::from).collect();
            print_output(&rows, ctx.format);
        }
    }
    Ok(())
}

pub async fn unlock(ctx: CommandContext, args: IdArgs) -> Result<()> {
    let client = ctx.client()?;
    let endpoint: Endpoint = client
        .post_empty(&format!("/v1/endpoints/{}/unlock", args.id))
        .await?;

    match ctx.format {
        OutputFormat::Json => print_single(&endpoint),
        OutputFormat::Table if endpoint.status == "failed" => {
            print_success(&format!("Released lock on {}", endpoint.id));
            print_info("The previous spec was restored; redeploy to bring the endpoint back.");
        }
        OutputFormat::Table => print_info(&format!(
            "Endpoint {} was not locked ({})",
            endpoint.id, endpoint.status
        )),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_spec_body_skips_unset_fields() {
        let spec = SpecArgs {
            max_concurrent_requests: Some(64),
            serving_framework: Some(Framework::Raw),
            ..SpecArgs::default()
        };
        assert_eq!(
            spec.to_body().unwrap(),
            json!({ "max_concurrent_requests": 64, "serving_framework": "raw" })
        );
    }

    #[test]
    fn test_spec_body_builds_autoscale_policy() {
        let spec = SpecArgs {
            scale_metric: Some(Metric::Rps),
            scale_target: Some(20),
            ..SpecArgs::default()
        };
        assert_eq!(
            spec.to_body().unwrap(),
            json!({ "autoscale_policy": { "metric": "rps", "target": 20 } })
        );
    }

    #[test]
    fn test_endpoint_row_from_api_shape() {
        let endpoint: Endpoint = serde_json::from_value(json!({
            "id": "ep_01hzx",
            "name": "llama chat",
            "route": "/chat/llama",
            "namespace": "serving",
            "serving_framework": "raw",
            "status": "failed",
            "status_message": "boom",
            "min_replicas": 1,
            "max_replicas": 3,
            "deployment_spec": { "model_ref": "llama-3-8b" },
            "updated_at": "2026-01-01T00:00:00Z"
        }))
        .unwrap();

        let row = EndpointRow::from(&endpoint);
        assert_eq!(row.replicas, "1-3");
        assert_eq!(row.checked, "-");
        assert!(endpoint.rest.contains_key("deployment_spec"));
    }
}
