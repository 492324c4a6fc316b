#![allow(dead_code)]

use std::sync::Arc;

use mserve_control_plane::serving::{
    audit::RecordingAuditSink,
    catalog::{ApprovedModel, InMemoryCatalog},
    cluster::{InMemoryCluster, ResourceKind, ResourceRef},
    manifests::framework_refs,
    model::{DeployRequest, DesiredStateOverrides, ServingEndpoint, ServingFramework},
    naming::ResourceNames,
    store::InMemoryEndpointStore,
    OperationContext, Orchestrator, OrchestratorDeps, ReconcilerConfig,
};
use serde_json::json;

pub const NAMESPACE: &str = "serving";
pub const MODEL: &str = "llama-3-8b";

pub struct Harness {
    pub store: Arc<InMemoryEndpointStore>,
    pub cluster: Arc<InMemoryCluster>,
    pub catalog: Arc<InMemoryCatalog>,
    pub audit: Arc<RecordingAuditSink>,
    pub orchestrator: Arc<Orchestrator>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(ReconcilerConfig {
            default_namespace: NAMESPACE.to_string(),
            ..ReconcilerConfig::default()
        })
    }

    pub fn with_config(config: ReconcilerConfig) -> Self {
        let store = Arc::new(InMemoryEndpointStore::new());
        let cluster = Arc::new(InMemoryCluster::new().with_auto_pods());
        let catalog = Arc::new(
            InMemoryCatalog::new()
                .with_model(MODEL, approved_model("s3://models/llama-3-8b", "llama"))
                .with_model("mistral-7b", approved_model("s3://models/mistral-7b", "mistral")),
        );
        let audit = Arc::new(RecordingAuditSink::new());
        let orchestrator = Arc::new(Orchestrator::new(
            OrchestratorDeps {
                store: store.clone(),
                cluster: cluster.clone(),
                catalog: catalog.clone(),
                audit: audit.clone(),
            },
            config,
        ));
        Self {
            store,
            cluster,
            catalog,
            audit,
            orchestrator,
        }
    }

    /// Deploy a raw-framework endpoint and return it.
    pub async fn deploy(&self, route: &str) -> ServingEndpoint {
        self.orchestrator
            .deploy(&ctx(), deploy_request(route, ServingFramework::Raw))
            .await
            .expect("deploy should succeed")
    }

    pub fn refs(&self, endpoint: &ServingEndpoint, framework: ServingFramework) -> Vec<ResourceRef> {
        framework_refs(framework, &ResourceNames::for_endpoint(&endpoint.id), NAMESPACE)
    }

    pub fn deployment_ref(&self, endpoint: &ServingEndpoint) -> ResourceRef {
        let names = ResourceNames::for_endpoint(&endpoint.id);
        ResourceRef::new(ResourceKind::Deployment, NAMESPACE, &names.primary)
    }
}

pub fn ctx() -> OperationContext {
    OperationContext::user("alice")
}

pub fn approved_model(storage_uri: &str, family: &str) -> ApprovedModel {
    ApprovedModel {
        storage_uri: storage_uri.to_string(),
        model_family: family.to_string(),
        job_type: "chat".to_string(),
        metadata: json!({ "gpu_memory_gb": 24, "max_input_tokens": 8192 }),
    }
}

pub fn deploy_request(route: &str, framework: ServingFramework) -> DeployRequest {
    DeployRequest {
        name: "llama chat".to_string(),
        route: route.to_string(),
        namespace: None,
        spec: DesiredStateOverrides {
            model_ref: Some(MODEL.to_string()),
            serving_framework: Some(framework),
            ..DesiredStateOverrides::default()
        },
    }
}

pub fn concurrency(limit: u32) -> DesiredStateOverrides {
    DesiredStateOverrides {
        max_concurrent_requests: Some(limit),
        ..DesiredStateOverrides::default()
    }
}
