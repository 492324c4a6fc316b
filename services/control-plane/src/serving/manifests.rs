//! Manifest builders for both serving frameworks.
//!
//! The raw framework renders typed `k8s-openapi` objects (Deployment, Service,
//! HorizontalPodAutoscaler, Ingress); the managed framework renders one
//! InferenceService custom resource as JSON. Every object carries the endpoint
//! label so the confirmer can find dependents by selector.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec as K8sDeploymentSpec};
use k8s_openapi::api::autoscaling::v2::{
    CrossVersionObjectReference, HorizontalPodAutoscaler, HorizontalPodAutoscalerSpec,
    MetricIdentifier, MetricSpec, MetricTarget, PodsMetricSource, ResourceMetricSource,
};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EnvVar, HTTPGetAction, PodSpec, PodTemplateSpec, Probe,
    ResourceRequirements, Service, ServicePort, ServiceSpec,
};
use k8s_openapi::api::networking::v1::{
    HTTPIngressPath, HTTPIngressRuleValue, Ingress, IngressBackend, IngressRule,
    IngressServiceBackend, IngressSpec, ServiceBackendPort,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use serde::Serialize;
use serde_json::{json, Value};

use super::cluster::{Manifest, ResourceKind, ResourceRef};
use super::model::{DesiredState, ScaleMetric, ServeTarget, ServingEndpoint, ServingFramework};
use super::naming::{
    ResourceNames, ENDPOINT_LABEL, MANAGED_BY_LABEL, MANAGED_BY_VALUE, ROUTE_ANNOTATION,
    SPEC_HASH_ANNOTATION,
};

/// Port the model server listens on inside the pod.
pub const SERVER_PORT: i32 = 8080;

const GPU_RESOURCE: &str = "nvidia.com/gpu";

#[derive(Debug, thiserror::Error)]
pub enum RenderError {
    #[error("serve target {0} has no cluster resources")]
    NoClusterResources(ServeTarget),

    #[error("runtime image missing for {0}")]
    MissingImage(ServeTarget),

    #[error("{field} is out of range for the cluster API")]
    OutOfRange { field: &'static str },

    #[error("failed to encode {kind}: {message}")]
    Encode { kind: ResourceKind, message: String },
}

/// What to render: identity plus the desired state to apply.
pub struct RenderInput<'a> {
    pub endpoint: &'a ServingEndpoint,
    pub desired: &'a DesiredState,
    pub framework: ServingFramework,
}

/// References of every resource `framework` creates for an endpoint, in
/// dependency order.
pub fn framework_refs(
    framework: ServingFramework,
    names: &ResourceNames,
    namespace: &str,
) -> Vec<ResourceRef> {
    match framework {
        ServingFramework::Managed => vec![ResourceRef::new(
            ResourceKind::InferenceService,
            namespace,
            &names.primary,
        )],
        ServingFramework::Raw => vec![
            ResourceRef::new(ResourceKind::Deployment, namespace, &names.primary),
            ResourceRef::new(ResourceKind::Service, namespace, &names.service),
            ResourceRef::new(
                ResourceKind::HorizontalPodAutoscaler,
                namespace,
                &names.autoscaler,
            ),
            ResourceRef::new(ResourceKind::Ingress, namespace, &names.route),
        ],
    }
}

/// Every resource either framework could have created for an endpoint.
/// Deletion always sweeps all of them.
pub fn all_known_refs(names: &ResourceNames, namespace: &str) -> Vec<ResourceRef> {
    // Dependents before workloads, so traffic stops before pods go away.
    let mut refs = framework_refs(ServingFramework::Raw, names, namespace);
    refs.reverse();
    refs.extend(framework_refs(ServingFramework::Managed, names, namespace));
    refs
}

pub fn primary_ref(framework: ServingFramework, names: &ResourceNames, namespace: &str) -> ResourceRef {
    let kind = match framework {
        ServingFramework::Managed => ResourceKind::InferenceService,
        ServingFramework::Raw => ResourceKind::Deployment,
    };
    ResourceRef::new(kind, namespace, &names.primary)
}

/// Render the manifests for an endpoint, in creation order.
pub fn render(input: &RenderInput<'_>) -> Result<Vec<Manifest>, RenderError> {
    let target = input.desired.serve_target();
    if !target.is_cluster() {
        return Err(RenderError::NoClusterResources(target));
    }

    let names = ResourceNames::for_endpoint(&input.endpoint.id);
    let ctx = Context::new(input, &names)?;

    match input.framework {
        ServingFramework::Managed => Ok(vec![ctx.inference_service()]),
        ServingFramework::Raw => Ok(vec![
            ctx.deployment()?,
            ctx.service()?,
            ctx.autoscaler()?,
            ctx.ingress()?,
        ]),
    }
}

struct Context<'a> {
    input: &'a RenderInput<'a>,
    names: &'a ResourceNames,
    namespace: &'a str,
    image: &'a str,
    labels: BTreeMap<String, String>,
    annotations: BTreeMap<String, String>,
    total_tokens: u32,
    min_replicas: i32,
    max_replicas: i32,
    scale_target: i32,
}

fn int32(field: &'static str, value: u32) -> Result<i32, RenderError> {
    i32::try_from(value).map_err(|_| RenderError::OutOfRange { field })
}

impl<'a> Context<'a> {
    fn new(input: &'a RenderInput<'a>, names: &'a ResourceNames) -> Result<Self, RenderError> {
        let target = input.desired.serve_target();
        let image = input
            .desired
            .runtime_image
            .as_deref()
            .ok_or(RenderError::MissingImage(target))?;

        let labels = BTreeMap::from([
            (ENDPOINT_LABEL.to_string(), names.label_value.clone()),
            (MANAGED_BY_LABEL.to_string(), MANAGED_BY_VALUE.to_string()),
        ]);
        let annotations = BTreeMap::from([
            (
                SPEC_HASH_ANNOTATION.to_string(),
                input.desired.spec_hash().to_string(),
            ),
            (ROUTE_ANNOTATION.to_string(), input.endpoint.route.clone()),
        ]);

        let desired = input.desired;
        let runtime = &desired.deployment_spec.runtime;
        let total_tokens = runtime
            .max_input_tokens
            .checked_add(runtime.max_output_tokens)
            .ok_or(RenderError::OutOfRange {
                field: "max_input_tokens + max_output_tokens",
            })?;

        Ok(Self {
            input,
            names,
            namespace: &input.endpoint.namespace,
            image,
            labels,
            annotations,
            total_tokens,
            min_replicas: int32("min_replicas", desired.min_replicas)?,
            max_replicas: int32("max_replicas", desired.max_replicas)?,
            scale_target: int32("autoscale_policy.target", desired.autoscale_policy.target)?,
        })
    }

    fn meta(&self, name: &str) -> ObjectMeta {
        ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(self.namespace.to_string()),
            labels: Some(self.labels.clone()),
            annotations: Some(self.annotations.clone()),
            ..ObjectMeta::default()
        }
    }

    fn manifest<T: Serialize>(
        &self,
        kind: ResourceKind,
        name: &str,
        object: &T,
    ) -> Result<Manifest, RenderError> {
        let mut body = serde_json::to_value(object).map_err(|e| RenderError::Encode {
            kind,
            message: e.to_string(),
        })?;
        // Typed objects serialize without type meta.
        body["apiVersion"] = json!(kind.api_version());
        body["kind"] = json!(kind.as_str());
        Ok(Manifest {
            resource: ResourceRef::new(kind, self.namespace, name),
            body,
        })
    }

    fn server_args(&self) -> Vec<String> {
        let spec = &self.input.desired.deployment_spec;
        let storage = spec.storage_uri.clone().unwrap_or_default();
        let runtime = &spec.runtime;
        let total_tokens = self.total_tokens;
        match spec.serve_target {
            ServeTarget::Vllm => vec![
                format!("--model={storage}"),
                format!("--served-model-name={}", spec.model_ref),
                format!("--port={SERVER_PORT}"),
                format!("--max-num-seqs={}", runtime.max_concurrent_requests),
                format!("--max-model-len={total_tokens}"),
                format!("--tensor-parallel-size={}", spec.resources.gpu_count.max(1)),
            ],
            ServeTarget::Tgi => vec![
                format!("--model-id={storage}"),
                format!("--port={SERVER_PORT}"),
                format!("--max-concurrent-requests={}", runtime.max_concurrent_requests),
                format!("--max-input-tokens={}", runtime.max_input_tokens),
                format!("--max-total-tokens={total_tokens}"),
            ],
            ServeTarget::Triton => vec![
                format!("--model-repository={storage}"),
                format!("--http-port={SERVER_PORT}"),
            ],
            ServeTarget::External => Vec::new(),
        }
    }

    fn resources(&self) -> ResourceRequirements {
        let spec = &self.input.desired.deployment_spec;
        let mut requests = BTreeMap::from([
            ("cpu".to_string(), Quantity(spec.resources.cpu.clone())),
            ("memory".to_string(), Quantity(spec.resources.memory.clone())),
        ]);
        let mut limits = BTreeMap::from([(
            "memory".to_string(),
            Quantity(spec.resources.memory.clone()),
        )]);
        if spec.use_gpu {
            let gpus = Quantity(spec.resources.gpu_count.to_string());
            requests.insert(GPU_RESOURCE.to_string(), gpus.clone());
            limits.insert(GPU_RESOURCE.to_string(), gpus);
        }
        ResourceRequirements {
            requests: Some(requests),
            limits: Some(limits),
            ..ResourceRequirements::default()
        }
    }

    fn env(&self) -> Vec<EnvVar> {
        let spec = &self.input.desired.deployment_spec;
        [
            ("MODEL_REF", spec.model_ref.as_str()),
            ("MODEL_FAMILY", spec.model_family.as_str()),
            ("JOB_TYPE", spec.job_type.as_str()),
        ]
        .into_iter()
        .map(|(name, value)| EnvVar {
            name: name.to_string(),
            value: Some(value.to_string()),
            ..EnvVar::default()
        })
        .collect()
    }

    fn container(&self) -> Container {
        Container {
            name: "server".to_string(),
            image: Some(self.image.to_string()),
            args: Some(self.server_args()),
            env: Some(self.env()),
            ports: Some(vec![ContainerPort {
                name: Some("http".to_string()),
                container_port: SERVER_PORT,
                ..ContainerPort::default()
            }]),
            resources: Some(self.resources()),
            readiness_probe: Some(Probe {
                http_get: Some(HTTPGetAction {
                    path: Some("/health".to_string()),
                    port: IntOrString::Int(SERVER_PORT),
                    ..HTTPGetAction::default()
                }),
                period_seconds: Some(5),
                failure_threshold: Some(3),
                ..Probe::default()
            }),
            ..Container::default()
        }
    }

    fn deployment(&self) -> Result<Manifest, RenderError> {
        let deployment = Deployment {
            metadata: self.meta(&self.names.primary),
            spec: Some(K8sDeploymentSpec {
                replicas: Some(self.min_replicas),
                selector: LabelSelector {
                    match_labels: Some(BTreeMap::from([(
                        ENDPOINT_LABEL.to_string(),
                        self.names.label_value.clone(),
                    )])),
                    ..LabelSelector::default()
                },
                template: PodTemplateSpec {
                    metadata: Some(ObjectMeta {
                        labels: Some(self.labels.clone()),
                        ..ObjectMeta::default()
                    }),
                    spec: Some(PodSpec {
                        containers: vec![self.container()],
                        ..PodSpec::default()
                    }),
                },
                ..K8sDeploymentSpec::default()
            }),
            ..Deployment::default()
        };
        self.manifest(ResourceKind::Deployment, &self.names.primary, &deployment)
    }

    fn service(&self) -> Result<Manifest, RenderError> {
        let service = Service {
            metadata: self.meta(&self.names.service),
            spec: Some(ServiceSpec {
                selector: Some(BTreeMap::from([(
                    ENDPOINT_LABEL.to_string(),
                    self.names.label_value.clone(),
                )])),
                ports: Some(vec![ServicePort {
                    name: Some("http".to_string()),
                    port: 80,
                    target_port: Some(IntOrString::Int(SERVER_PORT)),
                    ..ServicePort::default()
                }]),
                ..ServiceSpec::default()
            }),
            ..Service::default()
        };
        self.manifest(ResourceKind::Service, &self.names.service, &service)
    }

    fn autoscaler(&self) -> Result<Manifest, RenderError> {
        let policy = self.input.desired.autoscale_policy;
        let metric = match policy.metric {
            ScaleMetric::Cpu => MetricSpec {
                type_: "Resource".to_string(),
                resource: Some(ResourceMetricSource {
                    name: "cpu".to_string(),
                    target: MetricTarget {
                        type_: "Utilization".to_string(),
                        average_utilization: Some(self.scale_target),
                        ..MetricTarget::default()
                    },
                }),
                ..MetricSpec::default()
            },
            ScaleMetric::Concurrency | ScaleMetric::Rps => MetricSpec {
                type_: "Pods".to_string(),
                pods: Some(PodsMetricSource {
                    metric: MetricIdentifier {
                        name: pods_metric_name(policy.metric).to_string(),
                        selector: None,
                    },
                    target: MetricTarget {
                        type_: "AverageValue".to_string(),
                        average_value: Some(Quantity(policy.target.to_string())),
                        ..MetricTarget::default()
                    },
                }),
                ..MetricSpec::default()
            },
        };

        let hpa = HorizontalPodAutoscaler {
            metadata: self.meta(&self.names.autoscaler),
            spec: Some(HorizontalPodAutoscalerSpec {
                scale_target_ref: CrossVersionObjectReference {
                    api_version: Some(ResourceKind::Deployment.api_version()),
                    kind: ResourceKind::Deployment.as_str().to_string(),
                    name: self.names.primary.clone(),
                },
                min_replicas: Some(self.min_replicas),
                max_replicas: self.max_replicas,
                metrics: Some(vec![metric]),
                ..HorizontalPodAutoscalerSpec::default()
            }),
            ..HorizontalPodAutoscaler::default()
        };
        self.manifest(
            ResourceKind::HorizontalPodAutoscaler,
            &self.names.autoscaler,
            &hpa,
        )
    }

    fn ingress(&self) -> Result<Manifest, RenderError> {
        let ingress = Ingress {
            metadata: self.meta(&self.names.route),
            spec: Some(IngressSpec {
                rules: Some(vec![IngressRule {
                    http: Some(HTTPIngressRuleValue {
                        paths: vec![HTTPIngressPath {
                            path: Some(self.input.endpoint.route.clone()),
                            path_type: "Prefix".to_string(),
                            backend: IngressBackend {
                                service: Some(IngressServiceBackend {
                                    name: self.names.service.clone(),
                                    port: Some(ServiceBackendPort {
                                        number: Some(80),
                                        ..ServiceBackendPort::default()
                                    }),
                                }),
                                ..IngressBackend::default()
                            },
                        }],
                    }),
                    ..IngressRule::default()
                }]),
                ..IngressSpec::default()
            }),
            ..Ingress::default()
        };
        self.manifest(ResourceKind::Ingress, &self.names.route, &ingress)
    }

    fn inference_service(&self) -> Manifest {
        let desired = self.input.desired;
        let container = self.container();
        let kind = ResourceKind::InferenceService;
        let body = json!({
            "apiVersion": kind.api_version(),
            "kind": kind.as_str(),
            "metadata": {
                "name": self.names.primary,
                "namespace": self.namespace,
                "labels": self.labels,
                "annotations": self.annotations,
            },
            "spec": {
                "predictor": {
                    "minReplicas": desired.min_replicas,
                    "maxReplicas": desired.max_replicas,
                    "scaleMetric": desired.autoscale_policy.metric.as_str(),
                    "scaleTarget": desired.autoscale_policy.target,
                    "containerConcurrency": desired.deployment_spec.runtime.max_concurrent_requests,
                    "containers": [container],
                }
            }
        });
        Manifest {
            resource: ResourceRef::new(kind, self.namespace, &self.names.primary),
            body,
        }
    }
}

fn pods_metric_name(metric: ScaleMetric) -> &'static str {
    match metric {
        ScaleMetric::Rps => "inference_requests_per_second",
        _ => "inference_requests_in_flight",
    }
}

/// Declared replica count of a primary workload object, if visible.
pub fn declared_replicas(kind: ResourceKind, body: &Value) -> Option<u32> {
    let value = match kind {
        ResourceKind::Deployment => &body["spec"]["replicas"],
        ResourceKind::InferenceService => &body["spec"]["predictor"]["minReplicas"],
        _ => return None,
    };
    value.as_u64().and_then(|n| u32::try_from(n).ok())
}
