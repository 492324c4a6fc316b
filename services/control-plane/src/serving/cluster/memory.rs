//! In-memory cluster.
//!
//! Backs the control plane when it runs without a real cluster
//! (`MSERVE_CLUSTER_BACKEND=memory`) and drives the reconciler tests. Besides
//! plain object storage it can simulate the eventually consistent behaviour
//! the reconciler has to cope with: delayed finalization, objects stuck
//! terminating, name conflicts and failing API calls.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use mserve_id::Ulid;
use serde_json::{json, Value};
use tokio::time::Instant;

use crate::serving::naming::ENDPOINT_LABEL;

use super::{
    ClusterClient, ClusterError, ClusterObject, ClusterResult, CreateResult, DeleteMode, Lookup,
    Manifest, ResourceKind, ResourceRef,
};

/// How an object reacts to deletion requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StuckDeletion {
    /// Stays terminating until a forced delete arrives.
    UntilForced,
    /// Never goes away, forced or not.
    Forever,
}

/// One recorded API call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClusterCall {
    Get(ResourceRef),
    Create(ResourceRef),
    Delete(ResourceRef, DeleteMode),
    List(ResourceKind, String),
}

type CreateHook = Box<dyn Fn(&Manifest) + Send + Sync>;

struct Entry {
    object: ClusterObject,
    terminating_since: Option<Instant>,
}

#[derive(Default)]
struct State {
    objects: BTreeMap<ResourceRef, Entry>,
    conflicts: HashMap<ResourceRef, u32>,
    stuck: HashMap<ResourceRef, StuckDeletion>,
    create_failures: HashMap<ResourceRef, ClusterError>,
    delete_failures: HashMap<ResourceRef, ClusterError>,
    read_failure: Option<ClusterError>,
    deletion_delay: Duration,
    auto_pods: bool,
    calls: Vec<ClusterCall>,
    create_hooks: Vec<CreateHook>,
}

impl State {
    /// Drop terminating objects whose finalization delay has passed.
    fn finalize(&mut self) {
        let delay = self.deletion_delay;
        let stuck = &self.stuck;
        self.objects.retain(|r, entry| match entry.terminating_since {
            Some(since) if !stuck.contains_key(r) => since.elapsed() < delay,
            _ => true,
        });
    }

    fn mark_terminating(&mut self, resource: &ResourceRef) {
        if let Some(entry) = self.objects.get_mut(resource) {
            if entry.terminating_since.is_none() {
                let now = Utc::now();
                entry.terminating_since = Some(Instant::now());
                entry.object.deletion_timestamp = Some(now);
                if let Some(meta) = entry.object.body.get_mut("metadata") {
                    meta["deletionTimestamp"] = json!(now.to_rfc3339());
                }
            }
        }
    }

    fn delete_one(&mut self, resource: &ResourceRef, mode: DeleteMode) {
        if !self.objects.contains_key(resource) {
            return;
        }
        match (self.stuck.get(resource).copied(), mode) {
            (Some(StuckDeletion::Forever), _) | (Some(StuckDeletion::UntilForced), DeleteMode::Graceful) => {
                self.mark_terminating(resource);
            }
            (Some(StuckDeletion::UntilForced), DeleteMode::Force) => {
                self.stuck.remove(resource);
                self.objects.remove(resource);
            }
            (None, DeleteMode::Force) => {
                self.objects.remove(resource);
            }
            (None, DeleteMode::Graceful) if self.deletion_delay.is_zero() => {
                self.objects.remove(resource);
            }
            (None, DeleteMode::Graceful) => self.mark_terminating(resource),
        }
    }

    fn matching(&self, kind: ResourceKind, namespace: &str, selector: &str) -> Vec<ResourceRef> {
        let Some((key, value)) = selector.split_once('=') else {
            return Vec::new();
        };
        self.objects
            .iter()
            .filter(|(r, entry)| {
                r.kind == kind
                    && r.namespace == namespace
                    && entry.object.body["metadata"]["labels"][key].as_str() == Some(value)
            })
            .map(|(r, _)| r.clone())
            .collect()
    }

    fn insert(&mut self, resource: ResourceRef, mut body: Value) -> ClusterObject {
        let uid = Ulid::new().to_string().to_ascii_lowercase();
        if let Some(meta) = body.get_mut("metadata") {
            meta["uid"] = json!(uid);
            meta["creationTimestamp"] = json!(Utc::now().to_rfc3339());
        }
        let object = ClusterObject {
            resource: resource.clone(),
            uid: Some(uid),
            deletion_timestamp: None,
            body,
        };
        self.objects.insert(
            resource,
            Entry {
                object: object.clone(),
                terminating_since: None,
            },
        );
        object
    }
}

/// An in-memory [`ClusterClient`].
#[derive(Default)]
pub struct InMemoryCluster {
    state: Mutex<State>,
}

impl InMemoryCluster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create ready pods whenever a primary workload is created, and remove
    /// them with it.
    pub fn with_auto_pods(self) -> Self {
        self.lock().auto_pods = true;
        self
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Graceful deletes leave objects terminating for `delay` before they vanish.
    pub fn set_deletion_delay(&self, delay: Duration) {
        self.lock().deletion_delay = delay;
    }

    /// Answer the next `count` creates of `resource` with already-exists.
    pub fn inject_conflicts(&self, resource: ResourceRef, count: u32) {
        self.lock().conflicts.insert(resource, count);
    }

    pub fn set_stuck(&self, resource: ResourceRef, stuck: StuckDeletion) {
        self.lock().stuck.insert(resource, stuck);
    }

    /// Every create of `resource` fails with `error`.
    pub fn fail_creates(&self, resource: ResourceRef, error: ClusterError) {
        self.lock().create_failures.insert(resource, error);
    }

    /// Every delete of `resource` fails with `error` until cleared with `None`.
    pub fn fail_deletes(&self, resource: ResourceRef, error: Option<ClusterError>) {
        let mut state = self.lock();
        match error {
            Some(error) => state.delete_failures.insert(resource, error),
            None => state.delete_failures.remove(&resource),
        };
    }

    /// Every get and list fails with `error` until cleared with `None`.
    pub fn fail_reads(&self, error: Option<ClusterError>) {
        self.lock().read_failure = error;
    }

    /// Run `hook` synchronously at the start of every create call.
    pub fn on_create(&self, hook: impl Fn(&Manifest) + Send + Sync + 'static) {
        self.lock().create_hooks.push(Box::new(hook));
    }

    /// Place an object directly, bypassing conflict checks.
    pub fn insert_object(&self, resource: ResourceRef, body: Value) -> ClusterObject {
        self.lock().insert(resource, body)
    }

    pub fn insert_manifest(&self, manifest: &Manifest) -> ClusterObject {
        self.insert_object(manifest.resource.clone(), manifest.body.clone())
    }

    pub fn exists(&self, resource: &ResourceRef) -> bool {
        let mut state = self.lock();
        state.finalize();
        state.objects.contains_key(resource)
    }

    pub fn object(&self, resource: &ResourceRef) -> Option<ClusterObject> {
        let mut state = self.lock();
        state.finalize();
        state.objects.get(resource).map(|e| e.object.clone())
    }

    /// All live objects, terminating ones included.
    pub fn resources(&self) -> Vec<ResourceRef> {
        let mut state = self.lock();
        state.finalize();
        state.objects.keys().cloned().collect()
    }

    pub fn calls(&self) -> Vec<ClusterCall> {
        self.lock().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }

    pub fn count_calls(&self, predicate: impl Fn(&ClusterCall) -> bool) -> usize {
        self.lock().calls.iter().filter(|c| predicate(c)).count()
    }
}

/// A running, ready pod carrying the given labels.
pub fn ready_pod(namespace: &str, name: &str, labels: &Value) -> Value {
    json!({
        "apiVersion": "v1",
        "kind": "Pod",
        "metadata": { "name": name, "namespace": namespace, "labels": labels },
        "status": {
            "phase": "Running",
            "conditions": [{ "type": "Ready", "status": "True" }],
            "containerStatuses": [{
                "name": "server",
                "image": "server",
                "imageID": "",
                "ready": true,
                "restartCount": 0,
                "state": { "running": {} }
            }]
        }
    })
}

fn declared_replicas(manifest: &Manifest) -> u64 {
    let body = &manifest.body;
    body["spec"]["replicas"]
        .as_u64()
        .or_else(|| body["spec"]["predictor"]["minReplicas"].as_u64())
        .unwrap_or(1)
}

#[async_trait]
impl ClusterClient for InMemoryCluster {
    async fn get(&self, resource: &ResourceRef) -> ClusterResult<Lookup> {
        let mut state = self.lock();
        state.calls.push(ClusterCall::Get(resource.clone()));
        if let Some(err) = &state.read_failure {
            return Err(err.clone());
        }
        state.finalize();
        Ok(match state.objects.get(resource) {
            Some(entry) => Lookup::Found(entry.object.clone()),
            None => Lookup::NotFound,
        })
    }

    async fn create(&self, manifest: &Manifest) -> ClusterResult<CreateResult> {
        let mut state = self.lock();
        let resource = &manifest.resource;
        state.calls.push(ClusterCall::Create(resource.clone()));
        for hook in &state.create_hooks {
            hook(manifest);
        }
        state.finalize();

        if let Some(remaining) = state.conflicts.get_mut(resource) {
            if *remaining > 0 {
                *remaining -= 1;
                return Ok(CreateResult::AlreadyExists);
            }
        }
        if let Some(err) = state.create_failures.get(resource) {
            return Err(err.clone());
        }
        if state.objects.contains_key(resource) {
            return Ok(CreateResult::AlreadyExists);
        }

        let created = state.insert(resource.clone(), manifest.body.clone());

        let is_primary = matches!(
            resource.kind,
            ResourceKind::Deployment | ResourceKind::InferenceService
        );
        if state.auto_pods && is_primary {
            let labels = manifest.body["metadata"]["labels"].clone();
            for i in 0..declared_replicas(manifest) {
                let name = format!("{}-{i}", resource.name);
                let pod = ResourceRef::new(ResourceKind::Pod, &resource.namespace, &name);
                state.insert(pod, ready_pod(&resource.namespace, &name, &labels));
            }
        }

        Ok(CreateResult::Created(created))
    }

    async fn delete(&self, resource: &ResourceRef, mode: DeleteMode) -> ClusterResult<()> {
        let mut state = self.lock();
        state.calls.push(ClusterCall::Delete(resource.clone(), mode));
        if let Some(err) = state.delete_failures.get(resource) {
            return Err(err.clone());
        }
        state.finalize();

        let cascades = state.auto_pods
            && matches!(
                resource.kind,
                ResourceKind::Deployment | ResourceKind::InferenceService
            );
        if cascades {
            let selector = state.objects.get(resource).and_then(|e| {
                e.object.body["metadata"]["labels"][ENDPOINT_LABEL]
                    .as_str()
                    .map(|v| format!("{ENDPOINT_LABEL}={v}"))
            });
            if let Some(selector) = selector {
                for pod in state.matching(ResourceKind::Pod, &resource.namespace, &selector) {
                    state.delete_one(&pod, mode);
                }
            }
        }

        state.delete_one(resource, mode);
        Ok(())
    }

    async fn list_by_label(
        &self,
        kind: ResourceKind,
        namespace: &str,
        selector: &str,
    ) -> ClusterResult<Vec<ClusterObject>> {
        let mut state = self.lock();
        state
            .calls
            .push(ClusterCall::List(kind, selector.to_string()));
        if let Some(err) = &state.read_failure {
            return Err(err.clone());
        }
        state.finalize();
        let refs = state.matching(kind, namespace, selector);
        Ok(refs
            .iter()
            .filter_map(|r| state.objects.get(r).map(|e| e.object.clone()))
            .collect())
    }
}
