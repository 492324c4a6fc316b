//! `kube`-backed cluster client.

use async_trait::async_trait;
use kube::api::{
    Api, DeleteParams, DynamicObject, ListParams, PostParams, PropagationPolicy,
};
use kube::discovery::ApiResource;
use kube::Client;
use tracing::debug;

use super::{
    ClusterClient, ClusterError, ClusterObject, ClusterResult, CreateResult, DeleteMode, Lookup,
    Manifest, ResourceKind, ResourceRef,
};

/// Cluster client over the Kubernetes API using untyped `DynamicObject`s.
#[derive(Clone)]
pub struct KubeClusterClient {
    client: Client,
}

impl KubeClusterClient {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Connect using the in-cluster or kubeconfig environment.
    pub async fn try_default() -> Result<Self, kube::Error> {
        Ok(Self::new(Client::try_default().await?))
    }

    fn api(&self, kind: ResourceKind, namespace: &str) -> Api<DynamicObject> {
        Api::namespaced_with(self.client.clone(), namespace, &api_resource(kind))
    }
}

fn api_resource(kind: ResourceKind) -> ApiResource {
    let (group, version, plural) = kind.gvr();
    ApiResource {
        group: group.to_string(),
        version: version.to_string(),
        api_version: kind.api_version(),
        kind: kind.as_str().to_string(),
        plural: plural.to_string(),
    }
}

fn classify(resource: &ResourceRef, err: kube::Error) -> ClusterError {
    match err {
        kube::Error::Api(ae) => ClusterError::from_status(resource, ae.code, ae.message),
        kube::Error::SerdeError(e) => ClusterError::malformed(resource, e.to_string()),
        // Everything else is transport level: connection, TLS handshake, timeouts.
        other => ClusterError::transient(resource, other.to_string()),
    }
}

fn to_cluster_object(
    kind: ResourceKind,
    namespace: &str,
    obj: DynamicObject,
) -> ClusterResult<ClusterObject> {
    let name = obj.metadata.name.clone().unwrap_or_default();
    let resource = ResourceRef::new(kind, namespace, name);
    let uid = obj.metadata.uid.clone();
    let deletion_timestamp = obj.metadata.deletion_timestamp.as_ref().map(|t| t.0);
    let body = serde_json::to_value(&obj)
        .map_err(|e| ClusterError::malformed(&resource, e.to_string()))?;

    Ok(ClusterObject {
        resource,
        uid,
        deletion_timestamp,
        body,
    })
}

#[async_trait]
impl ClusterClient for KubeClusterClient {
    async fn get(&self, resource: &ResourceRef) -> ClusterResult<Lookup> {
        let api = self.api(resource.kind, &resource.namespace);
        match api.get(&resource.name).await {
            Ok(obj) => Ok(Lookup::Found(to_cluster_object(
                resource.kind,
                &resource.namespace,
                obj,
            )?)),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(Lookup::NotFound),
            Err(e) => Err(classify(resource, e)),
        }
    }

    async fn create(&self, manifest: &Manifest) -> ClusterResult<CreateResult> {
        let resource = &manifest.resource;
        let obj: DynamicObject = serde_json::from_value(manifest.body.clone())
            .map_err(|e| ClusterError::malformed(resource, e.to_string()))?;

        let api = self.api(resource.kind, &resource.namespace);
        match api.create(&PostParams::default(), &obj).await {
            Ok(created) => {
                debug!(kind = %resource.kind, name = %resource.name, "Created resource");
                Ok(CreateResult::Created(to_cluster_object(
                    resource.kind,
                    &resource.namespace,
                    created,
                )?))
            }
            Err(kube::Error::Api(ae)) if ae.code == 409 => Ok(CreateResult::AlreadyExists),
            Err(e) => Err(classify(resource, e)),
        }
    }

    async fn delete(&self, resource: &ResourceRef, mode: DeleteMode) -> ClusterResult<()> {
        let params = match mode {
            DeleteMode::Graceful => DeleteParams {
                propagation_policy: Some(PropagationPolicy::Foreground),
                ..DeleteParams::default()
            },
            DeleteMode::Force => DeleteParams {
                grace_period_seconds: Some(0),
                propagation_policy: Some(PropagationPolicy::Background),
                ..DeleteParams::default()
            },
        };

        let api = self.api(resource.kind, &resource.namespace);
        match api.delete(&resource.name, &params).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(classify(resource, e)),
        }
    }

    async fn list_by_label(
        &self,
        kind: ResourceKind,
        namespace: &str,
        selector: &str,
    ) -> ClusterResult<Vec<ClusterObject>> {
        let api = self.api(kind, namespace);
        let list = api
            .list(&ListParams::default().labels(selector))
            .await
            .map_err(|e| {
                classify(
                    &ResourceRef::new(kind, namespace, format!("[{selector}]")),
                    e,
                )
            })?;

        list.items
            .into_iter()
            .map(|obj| to_cluster_object(kind, namespace, obj))
            .collect()
    }
}
