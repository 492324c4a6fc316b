//! Conflict-aware creation.
//!
//! Creates manifests in order. A name conflict means an object from a previous
//! generation is still around: delete it, wait for the deletion to be
//! confirmed, back off and try again, up to `max_attempts` per resource.

use std::time::Duration;

use mserve_reconcile::{Backoff, Deadline, DEFAULT_MAX_ATTEMPTS};
use tracing::{debug, info, warn};

use super::cluster::{
    ClusterClient, ClusterError, ClusterObject, CreateResult, DeleteMode, Manifest, ResourceRef,
};
use super::confirm::{DeletionConfirmer, DeletionOutcome, DeletionTargets};

#[derive(Debug, Clone)]
pub struct CreateConfig {
    pub max_attempts: u32,
    pub backoff: Backoff,
    /// Budget for the whole creation phase.
    pub timeout: Duration,
    /// Budget for confirming deletion of one conflicting object.
    pub conflict_delete_timeout: Duration,
}

impl Default for CreateConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            // Jittered so endpoints that conflict together do not retry in lockstep.
            backoff: Backoff::default().with_jitter(true),
            timeout: Duration::from_secs(120),
            conflict_delete_timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CreateOutcome {
    /// Every manifest was created; objects in manifest order.
    Created(Vec<ClusterObject>),
    ConflictExhausted { resource: ResourceRef, attempts: u32 },
    Failed { resource: ResourceRef, error: ClusterError },
    TimedOut { resource: ResourceRef, elapsed: Duration },
}

pub struct ConflictAwareCreator<'a> {
    confirmer: &'a DeletionConfirmer,
    cluster: &'a dyn ClusterClient,
    config: &'a CreateConfig,
}

impl<'a> ConflictAwareCreator<'a> {
    pub fn new(
        cluster: &'a dyn ClusterClient,
        confirmer: &'a DeletionConfirmer,
        config: &'a CreateConfig,
    ) -> Self {
        Self {
            confirmer,
            cluster,
            config,
        }
    }

    pub async fn create_all(&self, manifests: &[Manifest]) -> CreateOutcome {
        let deadline = Deadline::after(self.config.timeout);
        let mut created = Vec::with_capacity(manifests.len());

        for manifest in manifests {
            match self.create_one(manifest, &deadline).await {
                Ok(obj) => created.push(obj),
                Err(outcome) => return outcome,
            }
        }

        CreateOutcome::Created(created)
    }

    async fn create_one(
        &self,
        manifest: &Manifest,
        deadline: &Deadline,
    ) -> Result<ClusterObject, CreateOutcome> {
        let resource = &manifest.resource;
        let max_attempts = self.config.max_attempts.max(1);

        for attempt in 0..max_attempts {
            // The deadline is only checked between attempts; an issued create
            // always runs to completion.
            if attempt > 0 && deadline.is_expired() {
                return Err(CreateOutcome::TimedOut {
                    resource: resource.clone(),
                    elapsed: deadline.elapsed(),
                });
            }

            match self.cluster.create(manifest).await {
                Ok(CreateResult::Created(obj)) => {
                    info!(kind = %resource.kind, name = %resource.name, attempt = attempt + 1, "Resource created");
                    return Ok(obj);
                }
                Ok(CreateResult::AlreadyExists) => {
                    warn!(kind = %resource.kind, name = %resource.name, attempt = attempt + 1, "Resource already exists");
                    if attempt + 1 == max_attempts {
                        break;
                    }
                    self.clear_conflict(resource, attempt, deadline).await?;
                }
                Err(error) => {
                    warn!(kind = %resource.kind, name = %resource.name, error = %error, "Create failed");
                    return Err(CreateOutcome::Failed {
                        resource: resource.clone(),
                        error,
                    });
                }
            }
        }

        Err(CreateOutcome::ConflictExhausted {
            resource: resource.clone(),
            attempts: max_attempts,
        })
    }

    /// Delete the conflicting object, confirm it is gone and back off.
    async fn clear_conflict(
        &self,
        resource: &ResourceRef,
        attempt: u32,
        deadline: &Deadline,
    ) -> Result<(), CreateOutcome> {
        match self.cluster.delete(resource, DeleteMode::Graceful).await {
            Ok(()) => {
                let budget = self.config.conflict_delete_timeout.min(deadline.remaining());
                let outcome = self
                    .confirmer
                    .confirm_deleted(&DeletionTargets::single(resource.clone()), budget)
                    .await;
                if let DeletionOutcome::TimedOut { elapsed, .. } = outcome {
                    warn!(kind = %resource.kind, name = %resource.name, elapsed_secs = elapsed.as_secs(), "Conflicting resource still present");
                }
            }
            // Transient failures are retried through the next attempt.
            Err(error) if error.is_transient() => {
                warn!(kind = %resource.kind, name = %resource.name, error = %error, "Delete of conflicting resource failed; retrying");
            }
            Err(error) => {
                return Err(CreateOutcome::Failed {
                    resource: resource.clone(),
                    error,
                });
            }
        }

        let delay = self.config.backoff.delay(attempt);
        debug!(kind = %resource.kind, name = %resource.name, delay_ms = delay.as_millis() as u64, "Backing off before retry");
        deadline.sleep_within(delay).await;
        Ok(())
    }
}
