//! Status synchronization.
//!
//! Health is derived from live cluster data only. Rules, in priority order:
//!
//! 1. no backing resource at all: `deploying` (or `terminating` if the row
//!    says so)
//! 2. any pod permanently failed: `failed`
//! 3. all expected replicas ready: `healthy`
//! 4. some ready: `degraded`
//! 5. otherwise: `deploying`

use std::sync::Arc;

use k8s_openapi::api::core::v1::Pod;
use tracing::debug;

use super::cluster::{ClusterClient, ClusterError, ClusterObject, Lookup, ResourceKind};
use super::manifests::{declared_replicas, primary_ref};
use super::model::{EndpointStatus, ServingEndpoint, ServingFramework};
use super::naming::ResourceNames;

/// Waiting reasons that mean a pod will not recover on its own.
const CRASH_LOOP_REASON: &str = "CrashLoopBackOff";

#[derive(Debug, Clone)]
pub struct StatusConfig {
    /// Restarts after which a crash-looping container counts as failed.
    pub crash_loop_restart_threshold: i32,
}

impl Default for StatusConfig {
    fn default() -> Self {
        Self {
            crash_loop_restart_threshold: 5,
        }
    }
}

/// Live data the status rules look at.
#[derive(Debug, Clone, Default)]
pub struct LiveSnapshot {
    pub primary_found: bool,
    pub declared_replicas: Option<u32>,
    pub pods: Vec<Pod>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Observation {
    pub status: EndpointStatus,
    pub ready: u32,
    pub expected: u32,
    pub reason: Option<String>,
}

/// Apply the status rules to a snapshot.
pub fn evaluate(
    snapshot: &LiveSnapshot,
    recorded: EndpointStatus,
    min_replicas: u32,
    config: &StatusConfig,
) -> Observation {
    let live_pods: Vec<&Pod> = snapshot
        .pods
        .iter()
        .filter(|p| p.metadata.deletion_timestamp.is_none())
        .collect();
    let expected = snapshot
        .declared_replicas
        .unwrap_or(min_replicas)
        .max(1);

    if !snapshot.primary_found && live_pods.is_empty() {
        let status = if recorded == EndpointStatus::Terminating {
            EndpointStatus::Terminating
        } else {
            EndpointStatus::Deploying
        };
        return Observation {
            status,
            ready: 0,
            expected,
            reason: Some("no backing resources".to_string()),
        };
    }

    if let Some(reason) = live_pods
        .iter()
        .find_map(|pod| permanent_failure(pod, config))
    {
        return Observation {
            status: EndpointStatus::Failed,
            ready: 0,
            expected,
            reason: Some(reason),
        };
    }

    let ready = live_pods.iter().filter(|p| is_ready(p)).count() as u32;
    let status = if ready >= expected {
        EndpointStatus::Healthy
    } else if ready > 0 {
        EndpointStatus::Degraded
    } else {
        EndpointStatus::Deploying
    };

    Observation {
        status,
        ready,
        expected,
        reason: None,
    }
}

fn is_ready(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .is_some_and(|conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
        })
}

fn permanent_failure(pod: &Pod, config: &StatusConfig) -> Option<String> {
    let name = pod.metadata.name.as_deref().unwrap_or("<unnamed>");
    let status = pod.status.as_ref()?;

    if status.phase.as_deref() == Some("Failed") {
        return Some(format!("pod {name} failed"));
    }

    let unschedulable = status.conditions.as_ref().and_then(|conditions| {
        conditions.iter().find(|c| {
            c.type_ == "PodScheduled"
                && c.status == "False"
                && c.reason.as_deref() == Some("Unschedulable")
        })
    });
    if let Some(condition) = unschedulable {
        return Some(format!(
            "pod {name} unschedulable: {}",
            condition.message.as_deref().unwrap_or("no message")
        ));
    }

    status
        .container_statuses
        .as_ref()?
        .iter()
        .find(|cs| {
            let crash_looping = cs
                .state
                .as_ref()
                .and_then(|s| s.waiting.as_ref())
                .and_then(|w| w.reason.as_deref())
                == Some(CRASH_LOOP_REASON);
            crash_looping && cs.restart_count >= config.crash_loop_restart_threshold
        })
        .map(|cs| {
            format!(
                "container {} in pod {name} crash-looping after {} restarts",
                cs.name, cs.restart_count
            )
        })
}

pub struct StatusSynchronizer {
    cluster: Arc<dyn ClusterClient>,
    config: StatusConfig,
}

impl StatusSynchronizer {
    pub fn new(cluster: Arc<dyn ClusterClient>, config: StatusConfig) -> Self {
        Self { cluster, config }
    }

    /// Collect the live data for an endpoint. Both frameworks' primaries are
    /// checked so a pending framework switch is still seen.
    pub async fn snapshot(&self, endpoint: &ServingEndpoint) -> Result<LiveSnapshot, ClusterError> {
        let names = ResourceNames::for_endpoint(&endpoint.id);
        let mut snapshot = LiveSnapshot::default();

        let frameworks = [
            endpoint.serving_framework,
            match endpoint.serving_framework {
                ServingFramework::Managed => ServingFramework::Raw,
                ServingFramework::Raw => ServingFramework::Managed,
            },
        ];
        for framework in frameworks {
            let primary = primary_ref(framework, &names, &endpoint.namespace);
            if let Lookup::Found(obj) = self.cluster.get(&primary).await? {
                if !obj.is_terminating() {
                    snapshot.primary_found = true;
                    snapshot.declared_replicas = declared_replicas(primary.kind, &obj.body);
                    break;
                }
            }
        }

        let pods = self
            .cluster
            .list_by_label(ResourceKind::Pod, &endpoint.namespace, &names.selector)
            .await?;
        snapshot.pods = pods
            .into_iter()
            .map(decode_pod)
            .collect::<Result<_, _>>()?;

        Ok(snapshot)
    }

    /// Derive the endpoint's current status from live data.
    pub async fn derive(&self, endpoint: &ServingEndpoint) -> Result<Observation, ClusterError> {
        if !endpoint.desired.serve_target().is_cluster() {
            return Ok(Observation {
                status: EndpointStatus::Healthy,
                ready: 0,
                expected: 0,
                reason: None,
            });
        }

        let snapshot = self.snapshot(endpoint).await?;
        let observation = evaluate(
            &snapshot,
            endpoint.status,
            endpoint.desired.min_replicas,
            &self.config,
        );
        debug!(
            endpoint_id = %endpoint.id,
            status = %observation.status,
            ready = observation.ready,
            expected = observation.expected,
            "Derived endpoint status"
        );
        Ok(observation)
    }
}

fn decode_pod(obj: ClusterObject) -> Result<Pod, ClusterError> {
    let resource = obj.resource.clone();
    serde_json::from_value(obj.body).map_err(|e| ClusterError::malformed(&resource, e.to_string()))
}
