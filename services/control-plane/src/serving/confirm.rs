//! Deletion and presence confirmation.
//!
//! Cluster deletes are asynchronous: an accepted delete only marks the object
//! terminating. The confirmer polls until every target (and every pod matching
//! the endpoint selector) is gone, forcing deletion of anything stuck
//! terminating for longer than the stall threshold.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use mserve_reconcile::{Deadline, DEFAULT_POLL_INTERVAL};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::cluster::{ClusterClient, ClusterObject, DeleteMode, Lookup, ResourceKind, ResourceRef};

#[derive(Debug, Clone)]
pub struct ConfirmConfig {
    pub poll_interval: Duration,
    /// How long a resource may sit terminating before a forced re-delete.
    pub stall_threshold: Duration,
}

impl Default for ConfirmConfig {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            stall_threshold: Duration::from_secs(60),
        }
    }
}

/// What must be gone before deletion counts as confirmed.
#[derive(Debug, Clone, Default)]
pub struct DeletionTargets {
    pub resources: Vec<ResourceRef>,
    /// `(namespace, selector)` of dependent pods.
    pub pods: Option<(String, String)>,
}

impl DeletionTargets {
    pub fn single(resource: ResourceRef) -> Self {
        Self {
            resources: vec![resource],
            pods: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeletionOutcome {
    Confirmed { elapsed: Duration, forced: usize },
    TimedOut { elapsed: Duration, remaining: Vec<ResourceRef> },
}

#[derive(Debug, Clone, PartialEq)]
pub enum PresenceOutcome {
    Present(Vec<ClusterObject>),
    Missing { elapsed: Duration, missing: Vec<ResourceRef> },
}

pub struct DeletionConfirmer {
    cluster: Arc<dyn ClusterClient>,
    config: ConfirmConfig,
}

/// Per-run bookkeeping for stalled objects.
#[derive(Default)]
struct StallTracker {
    first_seen_terminating: HashMap<ResourceRef, Instant>,
    forced: HashSet<ResourceRef>,
}

impl DeletionConfirmer {
    pub fn new(cluster: Arc<dyn ClusterClient>, config: ConfirmConfig) -> Self {
        Self { cluster, config }
    }

    pub fn config(&self) -> &ConfirmConfig {
        &self.config
    }

    /// Poll until every target is absent or `timeout` elapses.
    pub async fn confirm_deleted(
        &self,
        targets: &DeletionTargets,
        timeout: Duration,
    ) -> DeletionOutcome {
        let deadline = Deadline::after(timeout);
        let mut stalls = StallTracker::default();

        loop {
            let remaining = self.poll_remaining(targets, &mut stalls).await;
            if remaining.is_empty() {
                debug!(
                    elapsed_ms = deadline.elapsed().as_millis() as u64,
                    forced = stalls.forced.len(),
                    "Deletion confirmed"
                );
                return DeletionOutcome::Confirmed {
                    elapsed: deadline.elapsed(),
                    forced: stalls.forced.len(),
                };
            }

            if !deadline.sleep_within(self.config.poll_interval).await {
                warn!(
                    remaining = remaining.len(),
                    timeout_secs = timeout.as_secs(),
                    "Deletion not confirmed before deadline"
                );
                return DeletionOutcome::TimedOut {
                    elapsed: deadline.elapsed(),
                    remaining,
                };
            }
        }
    }

    async fn poll_remaining(
        &self,
        targets: &DeletionTargets,
        stalls: &mut StallTracker,
    ) -> Vec<ResourceRef> {
        let mut remaining = Vec::new();

        for resource in &targets.resources {
            match self.cluster.get(resource).await {
                Ok(Lookup::NotFound) => {}
                Ok(Lookup::Found(obj)) => {
                    self.check_stall(&obj, stalls).await;
                    remaining.push(resource.clone());
                }
                Err(e) => {
                    warn!(kind = %resource.kind, name = %resource.name, error = %e, "Poll failed; treating as present");
                    remaining.push(resource.clone());
                }
            }
        }

        if let Some((namespace, selector)) = &targets.pods {
            match self
                .cluster
                .list_by_label(ResourceKind::Pod, namespace, selector)
                .await
            {
                Ok(pods) => {
                    for pod in pods {
                        self.check_stall(&pod, stalls).await;
                        remaining.push(pod.resource);
                    }
                }
                Err(e) => {
                    warn!(selector = %selector, error = %e, "Pod listing failed; treating as present");
                    remaining.push(ResourceRef::new(
                        ResourceKind::Pod,
                        namespace,
                        format!("[{selector}]"),
                    ));
                }
            }
        }

        remaining
    }

    /// Force-delete an object once it has been terminating past the threshold.
    async fn check_stall(&self, obj: &ClusterObject, stalls: &mut StallTracker) {
        if !obj.is_terminating() || stalls.forced.contains(&obj.resource) {
            return;
        }

        let since = *stalls
            .first_seen_terminating
            .entry(obj.resource.clone())
            .or_insert_with(Instant::now);
        if since.elapsed() < self.config.stall_threshold {
            return;
        }

        info!(
            kind = %obj.resource.kind,
            name = %obj.resource.name,
            terminating_secs = since.elapsed().as_secs(),
            "Resource stuck terminating; forcing deletion"
        );
        // One forced attempt per run, whatever its result.
        stalls.forced.insert(obj.resource.clone());
        if let Err(e) = self.cluster.delete(&obj.resource, DeleteMode::Force).await {
            warn!(kind = %obj.resource.kind, name = %obj.resource.name, error = %e, "Forced delete failed");
        }
    }

    /// Poll until every resource is observable or `timeout` elapses.
    pub async fn confirm_present(
        &self,
        resources: &[ResourceRef],
        timeout: Duration,
    ) -> PresenceOutcome {
        let deadline = Deadline::after(timeout);

        loop {
            let mut found = Vec::with_capacity(resources.len());
            let mut missing = Vec::new();
            for resource in resources {
                match self.cluster.get(resource).await {
                    Ok(Lookup::Found(obj)) if !obj.is_terminating() => found.push(obj),
                    Ok(_) => missing.push(resource.clone()),
                    Err(e) => {
                        warn!(kind = %resource.kind, name = %resource.name, error = %e, "Presence poll failed");
                        missing.push(resource.clone());
                    }
                }
            }

            if missing.is_empty() {
                return PresenceOutcome::Present(found);
            }
            if !deadline.sleep_within(self.config.poll_interval).await {
                return PresenceOutcome::Missing {
                    elapsed: deadline.elapsed(),
                    missing,
                };
            }
        }
    }
}
