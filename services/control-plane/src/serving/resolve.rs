//! Desired state resolution.
//!
//! Each field is resolved independently, first match wins:
//! request override, stored value, catalog-derived value, configured default.
//! The catalog is only consulted when a model-derived field is missing or the
//! model reference changed.

use std::sync::Arc;

use tracing::debug;

use super::catalog::{ApprovedModel, ModelCatalog};
use super::error::ReconcileError;
use super::model::{
    AutoscalePolicy, DeploymentSpec, DesiredState, DesiredStateOverrides, ResourceShape,
    RuntimeConstraints, ScaleMetric, ServeTarget,
};

/// Configured fallbacks for fields nobody else supplies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpecDefaults {
    pub serve_target: ServeTarget,
    pub use_gpu: bool,
    pub gpu_count: u32,
    pub gpu_memory_gb: u32,
    pub cpu: String,
    pub memory: String,
    pub max_concurrent_requests: u32,
    pub max_input_tokens: u32,
    pub max_output_tokens: u32,
    pub min_replicas: u32,
    pub max_replicas: u32,
    pub autoscale_policy: AutoscalePolicy,
}

impl Default for SpecDefaults {
    fn default() -> Self {
        Self {
            serve_target: ServeTarget::Vllm,
            use_gpu: true,
            gpu_count: 1,
            gpu_memory_gb: 24,
            cpu: "4".to_string(),
            memory: "16Gi".to_string(),
            max_concurrent_requests: 32,
            max_input_tokens: 4096,
            max_output_tokens: 1024,
            min_replicas: 1,
            max_replicas: 1,
            autoscale_policy: AutoscalePolicy {
                metric: ScaleMetric::Concurrency,
                target: 16,
            },
        }
    }
}

/// Runtime image per serve target and accelerator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeImages {
    pub vllm_gpu: String,
    pub vllm_cpu: String,
    pub tgi_gpu: String,
    pub tgi_cpu: String,
    pub triton_gpu: String,
    pub triton_cpu: String,
}

impl Default for RuntimeImages {
    fn default() -> Self {
        Self {
            vllm_gpu: "vllm/vllm-openai:v0.6.3".to_string(),
            vllm_cpu: "vllm/vllm-cpu:v0.6.3".to_string(),
            tgi_gpu: "ghcr.io/huggingface/text-generation-inference:2.4".to_string(),
            tgi_cpu: "ghcr.io/huggingface/text-generation-inference:2.4-intel-cpu".to_string(),
            triton_gpu: "nvcr.io/nvidia/tritonserver:24.10-py3".to_string(),
            triton_cpu: "nvcr.io/nvidia/tritonserver:24.10-py3-cpu".to_string(),
        }
    }
}

impl RuntimeImages {
    pub fn image_for(&self, target: ServeTarget, use_gpu: bool) -> Option<&str> {
        let image = match (target, use_gpu) {
            (ServeTarget::Vllm, true) => &self.vllm_gpu,
            (ServeTarget::Vllm, false) => &self.vllm_cpu,
            (ServeTarget::Tgi, true) => &self.tgi_gpu,
            (ServeTarget::Tgi, false) => &self.tgi_cpu,
            (ServeTarget::Triton, true) => &self.triton_gpu,
            (ServeTarget::Triton, false) => &self.triton_cpu,
            (ServeTarget::External, _) => return None,
        };
        Some(image.as_str()).filter(|s| !s.is_empty())
    }
}

pub struct SpecResolver {
    catalog: Arc<dyn ModelCatalog>,
    defaults: SpecDefaults,
    images: RuntimeImages,
}

impl SpecResolver {
    pub fn new(catalog: Arc<dyn ModelCatalog>, defaults: SpecDefaults, images: RuntimeImages) -> Self {
        Self {
            catalog,
            defaults,
            images,
        }
    }

    /// Merge `overrides` over `stored` and validate the result.
    pub async fn resolve(
        &self,
        stored: Option<&DesiredState>,
        overrides: &DesiredStateOverrides,
    ) -> Result<DesiredState, ReconcileError> {
        let stored_spec = stored.map(|s| &s.deployment_spec);

        let model_ref = overrides
            .model_ref
            .clone()
            .or_else(|| stored_spec.map(|s| s.model_ref.clone()))
            .filter(|m| !m.trim().is_empty())
            .ok_or_else(|| ReconcileError::Validation("model_ref is required".to_string()))?;

        let model_changed = stored_spec.is_none_or(|s| s.model_ref != model_ref);
        // Model-derived fields of the stored spec only carry over for the same model.
        let carried = stored_spec.filter(|_| !model_changed);

        let serve_target = overrides
            .serve_target
            .or(stored_spec.map(|s| s.serve_target))
            .unwrap_or(self.defaults.serve_target);

        let storage_uri = overrides
            .storage_uri
            .clone()
            .or_else(|| carried.and_then(|s| s.storage_uri.clone()));
        let model_family = overrides
            .model_family
            .clone()
            .or_else(|| carried.map(|s| s.model_family.clone()));
        let job_type = overrides
            .job_type
            .clone()
            .or_else(|| carried.map(|s| s.job_type.clone()));

        let needs_catalog = model_changed
            || model_family.is_none()
            || job_type.is_none()
            || (serve_target.is_cluster() && storage_uri.is_none());
        let approved = if needs_catalog {
            debug!(model_ref = %model_ref, model_changed, "Consulting model catalog");
            Some(self.catalog.get_approved_model(&model_ref).await?)
        } else {
            None
        };
        let approved = approved.as_ref();

        let use_gpu = overrides
            .use_gpu
            .or(stored_spec.map(|s| s.use_gpu))
            .or_else(|| approved.and_then(|m| m.hint_bool("use_gpu")))
            .unwrap_or(self.defaults.use_gpu);

        let stored_resources = stored_spec.map(|s| &s.resources);
        let stored_runtime = stored_spec.map(|s| &s.runtime);
        let defaults = &self.defaults;

        let resources = ResourceShape {
            gpu_count: pick_u32(
                overrides.gpu_count,
                stored_resources.map(|r| r.gpu_count),
                approved,
                "gpu_count",
                defaults.gpu_count,
            ),
            gpu_memory_gb: pick_u32(
                overrides.gpu_memory_gb,
                stored_resources.map(|r| r.gpu_memory_gb),
                approved,
                "gpu_memory_gb",
                defaults.gpu_memory_gb,
            ),
            cpu: pick_str(
                overrides.cpu.as_ref(),
                stored_resources.map(|r| &r.cpu),
                approved,
                "cpu",
                &defaults.cpu,
            ),
            memory: pick_str(
                overrides.memory.as_ref(),
                stored_resources.map(|r| &r.memory),
                approved,
                "memory",
                &defaults.memory,
            ),
        };

        let runtime = RuntimeConstraints {
            max_concurrent_requests: pick_u32(
                overrides.max_concurrent_requests,
                stored_runtime.map(|r| r.max_concurrent_requests),
                approved,
                "max_concurrent_requests",
                defaults.max_concurrent_requests,
            ),
            max_input_tokens: pick_u32(
                overrides.max_input_tokens,
                stored_runtime.map(|r| r.max_input_tokens),
                approved,
                "max_input_tokens",
                defaults.max_input_tokens,
            ),
            max_output_tokens: pick_u32(
                overrides.max_output_tokens,
                stored_runtime.map(|r| r.max_output_tokens),
                approved,
                "max_output_tokens",
                defaults.max_output_tokens,
            ),
        };

        let deployment_spec = DeploymentSpec {
            model_family: model_family
                .or_else(|| approved.map(|m| m.model_family.clone()))
                .unwrap_or_default(),
            job_type: job_type
                .or_else(|| approved.map(|m| m.job_type.clone()))
                .unwrap_or_default(),
            storage_uri: storage_uri.or_else(|| approved.map(|m| m.storage_uri.clone())),
            external_url: overrides
                .external_url
                .clone()
                .or_else(|| stored_spec.and_then(|s| s.external_url.clone())),
            model_ref,
            serve_target,
            resources,
            runtime,
            use_gpu,
        };

        let runtime_image = self.resolve_image(stored, overrides, serve_target, use_gpu);

        let desired = DesiredState {
            deployment_spec,
            runtime_image,
            min_replicas: overrides
                .min_replicas
                .or(stored.map(|s| s.min_replicas))
                .unwrap_or(defaults.min_replicas),
            max_replicas: overrides
                .max_replicas
                .or(stored.map(|s| s.max_replicas))
                .unwrap_or(defaults.max_replicas),
            autoscale_policy: overrides
                .autoscale_policy
                .or(stored.map(|s| s.autoscale_policy))
                .unwrap_or(defaults.autoscale_policy),
        };

        desired
            .validate()
            .map_err(|problems| ReconcileError::Validation(problems.join("; ")))?;
        Ok(desired)
    }

    /// Explicit image, else the stored one if target and accelerator are
    /// unchanged, else the configured image for the target.
    fn resolve_image(
        &self,
        stored: Option<&DesiredState>,
        overrides: &DesiredStateOverrides,
        target: ServeTarget,
        use_gpu: bool,
    ) -> Option<String> {
        if !target.is_cluster() {
            return None;
        }
        if let Some(image) = overrides.runtime_image.clone() {
            return Some(image);
        }
        let same_runtime = stored
            .filter(|s| s.serve_target() == target && s.deployment_spec.use_gpu == use_gpu)
            .and_then(|s| s.runtime_image.clone());
        same_runtime.or_else(|| self.images.image_for(target, use_gpu).map(str::to_string))
    }
}

fn pick_u32(
    requested: Option<u32>,
    stored: Option<u32>,
    approved: Option<&ApprovedModel>,
    hint: &str,
    default: u32,
) -> u32 {
    requested
        .or(stored)
        .or_else(|| approved.and_then(|m| m.hint_u32(hint)))
        .unwrap_or(default)
}

fn pick_str(
    requested: Option<&String>,
    stored: Option<&String>,
    approved: Option<&ApprovedModel>,
    hint: &str,
    default: &str,
) -> String {
    requested
        .or(stored)
        .cloned()
        .or_else(|| approved.and_then(|m| m.hint_str(hint)))
        .unwrap_or_else(|| default.to_string())
}
