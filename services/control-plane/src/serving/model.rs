//! Serving endpoint data model.
//!
//! A [`ServingEndpoint`] is the persisted row. Its [`DesiredState`] is the
//! configuration that was last successfully applied to the cluster; the
//! `backup_config` holds the prior desired state while a mutation is in flight
//! (or after one failed).

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use mserve_id::EndpointId;
use mserve_reconcile::SpecHash;
use serde::{Deserialize, Serialize};

/// Observed endpoint status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndpointStatus {
    Deploying,
    Healthy,
    Degraded,
    Failed,
    Terminating,
}

impl EndpointStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EndpointStatus::Deploying => "deploying",
            EndpointStatus::Healthy => "healthy",
            EndpointStatus::Degraded => "degraded",
            EndpointStatus::Failed => "failed",
            EndpointStatus::Terminating => "terminating",
        }
    }

    /// Lock states: no other mutation may start while the row is in one.
    pub fn is_locked(&self) -> bool {
        matches!(self, EndpointStatus::Deploying | EndpointStatus::Terminating)
    }
}

impl fmt::Display for EndpointStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EndpointStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "deploying" => Ok(EndpointStatus::Deploying),
            "healthy" => Ok(EndpointStatus::Healthy),
            "degraded" => Ok(EndpointStatus::Degraded),
            "failed" => Ok(EndpointStatus::Failed),
            "terminating" => Ok(EndpointStatus::Terminating),
            other => Err(format!("unknown endpoint status: {other}")),
        }
    }
}

/// Which backend the endpoint's cluster resources are created with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ServingFramework {
    /// One managed inference service custom resource.
    #[default]
    Managed,
    /// Deployment + Service + HorizontalPodAutoscaler + Ingress.
    Raw,
}

impl ServingFramework {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServingFramework::Managed => "managed",
            ServingFramework::Raw => "raw",
        }
    }
}

impl fmt::Display for ServingFramework {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ServingFramework {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "managed" => Ok(ServingFramework::Managed),
            "raw" => Ok(ServingFramework::Raw),
            other => Err(format!("unknown serving framework: {other}")),
        }
    }
}

/// Model server the endpoint runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServeTarget {
    Vllm,
    Tgi,
    Triton,
    /// Passthrough to a model hosted outside the cluster.
    External,
}

impl ServeTarget {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServeTarget::Vllm => "vllm",
            ServeTarget::Tgi => "tgi",
            ServeTarget::Triton => "triton",
            ServeTarget::External => "external",
        }
    }

    /// Whether this target owns cluster resources.
    pub fn is_cluster(&self) -> bool {
        !matches!(self, ServeTarget::External)
    }
}

impl fmt::Display for ServeTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ServeTarget {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "vllm" => Ok(ServeTarget::Vllm),
            "tgi" => Ok(ServeTarget::Tgi),
            "triton" => Ok(ServeTarget::Triton),
            "external" => Ok(ServeTarget::External),
            other => Err(format!("unknown serve target: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceShape {
    pub gpu_count: u32,
    pub gpu_memory_gb: u32,
    /// Kubernetes CPU quantity, e.g. `"4"` or `"500m"`.
    pub cpu: String,
    /// Kubernetes memory quantity, e.g. `"16Gi"`.
    pub memory: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeConstraints {
    pub max_concurrent_requests: u32,
    pub max_input_tokens: u32,
    pub max_output_tokens: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentSpec {
    pub model_ref: String,
    pub model_family: String,
    pub job_type: String,
    pub serve_target: ServeTarget,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_uri: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_url: Option<String>,
    pub resources: ResourceShape,
    pub runtime: RuntimeConstraints,
    pub use_gpu: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScaleMetric {
    Concurrency,
    Cpu,
    Rps,
}

impl ScaleMetric {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScaleMetric::Concurrency => "concurrency",
            ScaleMetric::Cpu => "cpu",
            ScaleMetric::Rps => "rps",
        }
    }
}

impl FromStr for ScaleMetric {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "concurrency" => Ok(ScaleMetric::Concurrency),
            "cpu" => Ok(ScaleMetric::Cpu),
            "rps" => Ok(ScaleMetric::Rps),
            other => Err(format!("unknown scale metric: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AutoscalePolicy {
    pub metric: ScaleMetric,
    /// Per-replica target: in-flight requests, CPU percent or requests/s.
    pub target: u32,
}

/// Everything an endpoint is asked to run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DesiredState {
    pub deployment_spec: DeploymentSpec,
    /// Container image; absent for external targets.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime_image: Option<String>,
    pub min_replicas: u32,
    pub max_replicas: u32,
    pub autoscale_policy: AutoscalePolicy,
}

impl DesiredState {
    pub fn spec_hash(&self) -> SpecHash {
        // Serializing plain data structs cannot fail.
        let json = serde_json::to_value(self).unwrap_or(serde_json::Value::Null);
        SpecHash::from_json(&json)
    }

    pub fn serve_target(&self) -> ServeTarget {
        self.deployment_spec.serve_target
    }

    /// Check internal consistency. Returns every problem found.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut problems = Vec::new();
        let spec = &self.deployment_spec;

        if spec.model_ref.trim().is_empty() {
            problems.push("model_ref must not be empty".to_string());
        }

        if spec.serve_target.is_cluster() {
            if spec.storage_uri.as_deref().map_or(true, |s| s.trim().is_empty()) {
                problems.push(format!(
                    "storage_uri is required for serve target {}",
                    spec.serve_target
                ));
            }
            if self
                .runtime_image
                .as_deref()
                .map_or(true, |s| s.trim().is_empty())
            {
                problems.push(format!(
                    "no runtime image for serve target {} (use_gpu={})",
                    spec.serve_target, spec.use_gpu
                ));
            }
            if self.min_replicas < 1 {
                problems.push("min_replicas must be at least 1".to_string());
            }
            if self.min_replicas > self.max_replicas {
                problems.push(format!(
                    "min_replicas ({}) must not exceed max_replicas ({})",
                    self.min_replicas, self.max_replicas
                ));
            }
            if self.autoscale_policy.target < 1 {
                problems.push("autoscale_policy.target must be at least 1".to_string());
            }
            // Workload and autoscaler fields are int32 on the cluster side.
            for (field, value) in [
                ("min_replicas", self.min_replicas),
                ("max_replicas", self.max_replicas),
                ("autoscale_policy.target", self.autoscale_policy.target),
            ] {
                if i32::try_from(value).is_err() {
                    problems.push(format!("{field} must not exceed {}", i32::MAX));
                }
            }
            if spec.use_gpu && spec.resources.gpu_count < 1 {
                problems.push("use_gpu requires gpu_count >= 1".to_string());
            }
            if spec.use_gpu && spec.resources.gpu_memory_gb < 1 {
                problems.push("use_gpu requires gpu_memory_gb >= 1".to_string());
            }
            if !is_quantity(&spec.resources.cpu) {
                problems.push(format!("cpu {:?} is not a valid quantity", spec.resources.cpu));
            }
            if !is_quantity(&spec.resources.memory) {
                problems.push(format!(
                    "memory {:?} is not a valid quantity",
                    spec.resources.memory
                ));
            }
        } else {
            match spec.external_url.as_deref() {
                Some(url) if url.starts_with("https://") || url.starts_with("http://") => {}
                Some(url) => problems.push(format!("external_url {url:?} must be http(s)")),
                None => problems.push("external_url is required for serve target external".to_string()),
            }
        }

        let runtime = &spec.runtime;
        if runtime.max_concurrent_requests < 1 {
            problems.push("max_concurrent_requests must be at least 1".to_string());
        }
        if runtime.max_input_tokens < 1 || runtime.max_output_tokens < 1 {
            problems.push("token limits must be at least 1".to_string());
        }
        if runtime
            .max_input_tokens
            .checked_add(runtime.max_output_tokens)
            .is_none()
        {
            problems.push(format!(
                "max_input_tokens + max_output_tokens must not exceed {}",
                u32::MAX
            ));
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(problems)
        }
    }
}

/// Loose Kubernetes quantity check: digits with an optional fraction and suffix.
fn is_quantity(s: &str) -> bool {
    let digits_end = s
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(s.len());
    let (number, suffix) = s.split_at(digits_end);
    !number.is_empty()
        && number.chars().filter(|&c| c == '.').count() <= 1
        && matches!(
            suffix,
            "" | "m" | "k" | "M" | "G" | "T" | "Ki" | "Mi" | "Gi" | "Ti"
        )
}

/// One persisted serving endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServingEndpoint {
    pub id: EndpointId,
    pub name: String,
    pub route: String,
    pub namespace: String,
    pub serving_framework: ServingFramework,

    #[serde(flatten)]
    pub desired: DesiredState,

    pub status: EndpointStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_resource_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_health_check_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup_config: Option<DesiredState>,

    pub resource_version: i64,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ServingEndpoint {
    /// A mutation holds the lock and has not yet committed or rolled back.
    pub fn mutation_in_flight(&self) -> bool {
        self.status.is_locked() && self.backup_config.is_some()
    }
}

/// Optional per-field overrides supplied by Deploy and Redeploy requests.
///
/// Every field left `None` falls back to the stored value, then to values
/// derived from the catalog, then to configured defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DesiredStateOverrides {
    pub model_ref: Option<String>,
    pub model_family: Option<String>,
    pub job_type: Option<String>,
    pub serve_target: Option<ServeTarget>,
    pub storage_uri: Option<String>,
    pub external_url: Option<String>,
    pub gpu_count: Option<u32>,
    pub gpu_memory_gb: Option<u32>,
    pub cpu: Option<String>,
    pub memory: Option<String>,
    pub max_concurrent_requests: Option<u32>,
    pub max_input_tokens: Option<u32>,
    pub max_output_tokens: Option<u32>,
    pub use_gpu: Option<bool>,
    pub runtime_image: Option<String>,
    pub min_replicas: Option<u32>,
    pub max_replicas: Option<u32>,
    pub autoscale_policy: Option<AutoscalePolicy>,
    /// Switch the endpoint to a different serving framework.
    pub serving_framework: Option<ServingFramework>,
}

/// A request to create a new endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeployRequest {
    pub name: String,
    pub route: String,
    #[serde(default)]
    pub namespace: Option<String>,
    #[serde(flatten)]
    pub spec: DesiredStateOverrides,
}
