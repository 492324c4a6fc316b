//! The endpoint state machine.
//!
//! ```text
//! Idle → Locking → BackingUp → Deleting → ConfirmingDeletion → ResolvingSpec
//!      → Creating → ConfirmingCreate → Committing → SyncingStatus → Idle
//! ```
//!
//! Any failure after the lock is taken goes through `RollingBack`, which
//! restores the desired state from the backup, marks the endpoint failed and
//! releases the lock. Delete runs the same machine without the creation half
//! and removes the row at the end; Deploy starts from an already locked row
//! and skips the deletion half.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::{stream, FutureExt, StreamExt};
use mserve_events::{Actor, AuditEvent, AuditOutcome, Operation};
use mserve_id::{EndpointId, RequestId};
use tracing::{debug, error, info, instrument, warn};

use super::audit::AuditSink;
use super::catalog::ModelCatalog;
use super::cluster::{ClusterClient, DeleteMode, ResourceKind, ResourceRef};
use super::confirm::{
    ConfirmConfig, DeletionConfirmer, DeletionOutcome, DeletionTargets, PresenceOutcome,
};
use super::create::{ConflictAwareCreator, CreateConfig, CreateOutcome};
use super::error::ReconcileError;
use super::manifests::{all_known_refs, render, RenderInput};
use super::model::{
    DeployRequest, DesiredState, DesiredStateOverrides, EndpointStatus, ServingEndpoint,
    ServingFramework,
};
use super::naming::{is_dns1123_label, normalize_route, ResourceNames};
use super::resolve::{RuntimeImages, SpecDefaults, SpecResolver};
use super::status::{StatusConfig, StatusSynchronizer};
use super::store::EndpointStore;

/// Lock acquisitions lost to concurrent row updates before giving up.
const LOCK_ATTEMPTS: u32 = 3;

/// Endpoints synchronized concurrently by one sync pass.
const SYNC_CONCURRENCY: usize = 8;

#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    pub default_namespace: String,
    pub default_framework: ServingFramework,
    pub confirm: ConfirmConfig,
    pub create: CreateConfig,
    pub deletion_timeout: Duration,
    pub confirm_create_timeout: Duration,
    pub status: StatusConfig,
    /// Minimum age of an in-flight lock before an operator may break it.
    pub unlock_grace: Duration,
    pub spec_defaults: SpecDefaults,
    pub runtime_images: RuntimeImages,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            default_namespace: "mserve".to_string(),
            default_framework: ServingFramework::Managed,
            confirm: ConfirmConfig::default(),
            create: CreateConfig::default(),
            deletion_timeout: Duration::from_secs(120),
            confirm_create_timeout: Duration::from_secs(60),
            status: StatusConfig::default(),
            unlock_grace: Duration::from_secs(300),
            spec_defaults: SpecDefaults::default(),
            runtime_images: RuntimeImages::default(),
        }
    }
}

/// State machine phases, for logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Locking,
    BackingUp,
    Deleting,
    ConfirmingDeletion,
    ResolvingSpec,
    Creating,
    ConfirmingCreate,
    Committing,
    SyncingStatus,
    RollingBack,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Locking => "locking",
            Phase::BackingUp => "backing_up",
            Phase::Deleting => "deleting",
            Phase::ConfirmingDeletion => "confirming_deletion",
            Phase::ResolvingSpec => "resolving_spec",
            Phase::Creating => "creating",
            Phase::ConfirmingCreate => "confirming_create",
            Phase::Committing => "committing",
            Phase::SyncingStatus => "syncing_status",
            Phase::RollingBack => "rolling_back",
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Who triggered an operation.
#[derive(Debug, Clone)]
pub struct OperationContext {
    pub actor: Actor,
    pub request_id: Option<RequestId>,
}

impl OperationContext {
    pub fn user(id: impl Into<String>) -> Self {
        Self {
            actor: Actor::user(id),
            request_id: None,
        }
    }

    pub fn system(component: impl Into<String>) -> Self {
        Self {
            actor: Actor::system(component),
            request_id: None,
        }
    }

    pub fn with_request_id(mut self, request_id: Option<RequestId>) -> Self {
        self.request_id = request_id;
        self
    }
}

/// Result of one status sync pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SyncStats {
    pub checked: usize,
    pub updated: usize,
    pub skipped: usize,
    pub failed: usize,
}

enum SyncResult {
    Updated,
    Unchanged,
    Skipped,
    Failed,
}

/// External collaborators of the orchestrator.
pub struct OrchestratorDeps {
    pub store: Arc<dyn EndpointStore>,
    pub cluster: Arc<dyn ClusterClient>,
    pub catalog: Arc<dyn ModelCatalog>,
    pub audit: Arc<dyn AuditSink>,
}

pub struct Orchestrator {
    store: Arc<dyn EndpointStore>,
    cluster: Arc<dyn ClusterClient>,
    audit: Arc<dyn AuditSink>,
    resolver: SpecResolver,
    confirmer: DeletionConfirmer,
    status: StatusSynchronizer,
    config: ReconcilerConfig,
}

impl Orchestrator {
    pub fn new(deps: OrchestratorDeps, config: ReconcilerConfig) -> Self {
        let resolver = SpecResolver::new(
            deps.catalog,
            config.spec_defaults.clone(),
            config.runtime_images.clone(),
        );
        let confirmer = DeletionConfirmer::new(deps.cluster.clone(), config.confirm.clone());
        let status = StatusSynchronizer::new(deps.cluster.clone(), config.status.clone());
        Self {
            store: deps.store,
            cluster: deps.cluster,
            audit: deps.audit,
            resolver,
            confirmer,
            status,
            config,
        }
    }

    pub fn config(&self) -> &ReconcilerConfig {
        &self.config
    }

    /// Create a new endpoint and its cluster resources.
    #[instrument(skip(self, ctx, request), fields(actor = %ctx.actor, route = %request.route))]
    pub async fn deploy(
        &self,
        ctx: &OperationContext,
        request: DeployRequest,
    ) -> Result<ServingEndpoint, ReconcileError> {
        let route = normalize_route(&request.route)
            .map_err(|e| ReconcileError::Validation(e.to_string()))?;
        let name = request.name.trim().to_string();
        if name.is_empty() {
            return Err(ReconcileError::Validation("name must not be empty".to_string()));
        }
        let namespace = request
            .namespace
            .clone()
            .unwrap_or_else(|| self.config.default_namespace.clone());
        if !is_dns1123_label(&namespace) {
            return Err(ReconcileError::Validation(format!(
                "namespace {namespace:?} is not a valid DNS-1123 label"
            )));
        }
        let framework = request
            .spec
            .serving_framework
            .unwrap_or(self.config.default_framework);

        let desired = self.resolver.resolve(None, &request.spec).await?;

        let now = Utc::now();
        let endpoint = ServingEndpoint {
            id: EndpointId::new(),
            name,
            route,
            namespace,
            serving_framework: framework,
            desired: desired.clone(),
            // Inserted already locked; nothing else may touch it until commit.
            status: EndpointStatus::Deploying,
            status_message: None,
            last_resource_ref: None,
            last_health_check_at: None,
            backup_config: Some(desired.clone()),
            resource_version: 1,
            created_by: ctx.actor.to_string(),
            created_at: now,
            updated_at: now,
        };
        self.store.insert(&endpoint).await?;
        info!(endpoint_id = %endpoint.id, phase = %Phase::Locking, "Endpoint row created locked");

        let run = guarded(self.apply(&endpoint, desired, framework)).await;
        self.finish(ctx, Operation::Deploy, &endpoint, run).await
    }

    /// Move an existing endpoint to a new configuration.
    #[instrument(skip(self, ctx, overrides), fields(endpoint_id = %id, actor = %ctx.actor))]
    pub async fn redeploy(
        &self,
        ctx: &OperationContext,
        id: &EndpointId,
        overrides: DesiredStateOverrides,
    ) -> Result<ServingEndpoint, ReconcileError> {
        let current = self.load(id).await?;
        if current.status.is_locked() {
            return Err(in_progress(&current));
        }
        // Resolved before the lock so bad input never tears anything down.
        let resolved = self.resolver.resolve(Some(&current.desired), &overrides).await?;

        let locked = self.lock(id, EndpointStatus::Deploying).await?;
        let framework = overrides
            .serving_framework
            .unwrap_or(locked.serving_framework);

        let run = guarded(async {
            self.teardown(&locked).await?;

            self.enter(id, Phase::ResolvingSpec);
            // Only a commit that slipped in between the read and the lock
            // changes the base the overrides apply to.
            let desired = if locked.desired == current.desired {
                resolved
            } else {
                self.resolver.resolve(Some(&locked.desired), &overrides).await?
            };

            self.apply(&locked, desired, framework).await
        })
        .await;
        self.finish(ctx, Operation::Redeploy, &locked, run).await
    }

    /// Tear down an endpoint's resources and remove its row.
    #[instrument(skip(self, ctx), fields(endpoint_id = %id, actor = %ctx.actor))]
    pub async fn delete(&self, ctx: &OperationContext, id: &EndpointId) -> Result<(), ReconcileError> {
        let current = self.load(id).await?;
        if current.status.is_locked() {
            return Err(in_progress(&current));
        }

        let locked = self.lock(id, EndpointStatus::Terminating).await?;
        let run = guarded(async {
            self.teardown(&locked).await?;
            self.store.remove(id).await?;
            Ok(())
        })
        .await;

        match run {
            Ok(()) => {
                info!(endpoint_id = %id, "Endpoint deleted");
                self.emit_audit(ctx, id, AuditOutcome::Deleted, Operation::Delete, None, None);
                Ok(())
            }
            Err(err) => Err(self.roll_back(ctx, Operation::Delete, &locked, err).await),
        }
    }

    /// Read an endpoint, refreshing its observed status first when no
    /// mutation is in flight.
    #[instrument(skip(self), fields(endpoint_id = %id))]
    pub async fn get_status(&self, id: &EndpointId) -> Result<ServingEndpoint, ReconcileError> {
        let endpoint = self.load(id).await?;
        match self.sync_one(&endpoint).await {
            SyncResult::Updated => self.load(id).await,
            _ => Ok(endpoint),
        }
    }

    pub async fn list(&self) -> Result<Vec<ServingEndpoint>, ReconcileError> {
        Ok(self.store.list().await?)
    }

    /// Break a lock left behind by a crashed operation.
    #[instrument(skip(self, ctx), fields(endpoint_id = %id, actor = %ctx.actor))]
    pub async fn unlock(
        &self,
        ctx: &OperationContext,
        id: &EndpointId,
    ) -> Result<ServingEndpoint, ReconcileError> {
        let endpoint = self.load(id).await?;
        if !endpoint.status.is_locked() {
            return Ok(endpoint);
        }

        let age = (Utc::now() - endpoint.updated_at)
            .to_std()
            .unwrap_or_default();
        if endpoint.mutation_in_flight() && age < self.config.unlock_grace {
            return Err(in_progress(&endpoint));
        }

        warn!(endpoint_id = %id, status = %endpoint.status, age_secs = age.as_secs(), "Breaking endpoint lock");
        let reason = format!("lock ({}) released by {}", endpoint.status, ctx.actor);
        let unlocked = self.store.roll_back(id, &reason).await?;
        self.emit_audit(
            ctx,
            id,
            AuditOutcome::RolledBack,
            Operation::Unlock,
            Some(("operator_unlock", reason.as_str())),
            Some(unlocked.desired.spec_hash().to_string()),
        );
        Ok(unlocked)
    }

    /// Run the status synchronizer over every endpoint.
    pub async fn sync_all(&self) -> Result<SyncStats, ReconcileError> {
        let endpoints = self.store.list().await?;
        let syncs: Vec<_> = endpoints
            .iter()
            .map(|endpoint| self.sync_one(endpoint))
            .collect();
        let results: Vec<SyncResult> = stream::iter(syncs)
            .buffer_unordered(SYNC_CONCURRENCY)
            .collect()
            .await;

        let mut stats = SyncStats {
            checked: results.len(),
            ..SyncStats::default()
        };
        for result in results {
            match result {
                SyncResult::Updated => stats.updated += 1,
                SyncResult::Unchanged => {}
                SyncResult::Skipped => stats.skipped += 1,
                SyncResult::Failed => stats.failed += 1,
            }
        }
        Ok(stats)
    }

    async fn sync_one(&self, endpoint: &ServingEndpoint) -> SyncResult {
        // Rows with a backup are either mid-mutation or failed awaiting a
        // redeploy; terminating rows belong to a delete.
        if endpoint.backup_config.is_some() || endpoint.status == EndpointStatus::Terminating {
            return SyncResult::Skipped;
        }

        let observation = match self.status.derive(endpoint).await {
            Ok(observation) => observation,
            Err(e) => {
                debug!(endpoint_id = %endpoint.id, error = %e, "Status sync failed; keeping recorded status");
                return SyncResult::Failed;
            }
        };

        match self
            .store
            .record_observation(
                &endpoint.id,
                endpoint.resource_version,
                observation.status,
                Utc::now(),
            )
            .await
        {
            Ok(true) if observation.status != endpoint.status => {
                info!(
                    endpoint_id = %endpoint.id,
                    from = %endpoint.status,
                    to = %observation.status,
                    reason = observation.reason.as_deref().unwrap_or(""),
                    "Endpoint status changed"
                );
                SyncResult::Updated
            }
            Ok(true) => SyncResult::Updated,
            Ok(false) => SyncResult::Unchanged,
            Err(e) => {
                warn!(endpoint_id = %endpoint.id, error = %e, "Failed to record status");
                SyncResult::Failed
            }
        }
    }

    async fn load(&self, id: &EndpointId) -> Result<ServingEndpoint, ReconcileError> {
        self.store
            .get(id)
            .await?
            .ok_or(ReconcileError::NotFound(*id))
    }

    /// Locking and BackingUp: one compare-and-set write.
    async fn lock(
        &self,
        id: &EndpointId,
        lock: EndpointStatus,
    ) -> Result<ServingEndpoint, ReconcileError> {
        self.enter(id, Phase::Locking);
        for _ in 0..LOCK_ATTEMPTS {
            let current = self.load(id).await?;
            if current.status.is_locked() {
                return Err(in_progress(&current));
            }
            if let Some(locked) = self
                .store
                .acquire_lock(id, current.resource_version, lock, &current.desired)
                .await?
            {
                self.enter(id, Phase::BackingUp);
                return Ok(locked);
            }
            debug!(endpoint_id = %id, "Lost lock race; re-reading");
        }
        Err(ReconcileError::Transient(format!(
            "endpoint {id} kept changing while acquiring the lock"
        )))
    }

    /// Deleting and ConfirmingDeletion across both frameworks.
    async fn teardown(&self, endpoint: &ServingEndpoint) -> Result<(), ReconcileError> {
        let names = ResourceNames::for_endpoint(&endpoint.id);
        let namespace = endpoint.namespace.as_str();

        self.enter(&endpoint.id, Phase::Deleting);
        let refs = all_known_refs(&names, namespace);
        for resource in &refs {
            self.cluster.delete(resource, DeleteMode::Graceful).await?;
        }
        let pods = self
            .cluster
            .list_by_label(ResourceKind::Pod, namespace, &names.selector)
            .await?;
        for pod in &pods {
            self.cluster
                .delete(&pod.resource, DeleteMode::Graceful)
                .await?;
        }

        self.enter(&endpoint.id, Phase::ConfirmingDeletion);
        let targets = DeletionTargets {
            resources: refs,
            pods: Some((namespace.to_string(), names.selector.clone())),
        };
        match self
            .confirmer
            .confirm_deleted(&targets, self.config.deletion_timeout)
            .await
        {
            DeletionOutcome::Confirmed { elapsed, forced } => {
                info!(endpoint_id = %endpoint.id, elapsed_ms = elapsed.as_millis() as u64, forced, "Previous resources gone");
                Ok(())
            }
            DeletionOutcome::TimedOut { elapsed, remaining } => {
                Err(ReconcileError::DeletionTimeout {
                    elapsed,
                    remaining: remaining.iter().map(ResourceRef::to_string).collect(),
                })
            }
        }
    }

    /// Creating, ConfirmingCreate, Committing and SyncingStatus.
    async fn apply(
        &self,
        endpoint: &ServingEndpoint,
        desired: DesiredState,
        framework: ServingFramework,
    ) -> Result<ServingEndpoint, ReconcileError> {
        let mut resource_uid = None;

        if desired.serve_target().is_cluster() {
            self.enter(&endpoint.id, Phase::Creating);
            let manifests = render(&RenderInput {
                endpoint,
                desired: &desired,
                framework,
            })?;
            let creator =
                ConflictAwareCreator::new(self.cluster.as_ref(), &self.confirmer, &self.config.create);
            match creator.create_all(&manifests).await {
                CreateOutcome::Created(_) => {}
                CreateOutcome::ConflictExhausted { resource, attempts } => {
                    return Err(ReconcileError::CreationConflictExhausted {
                        resource: resource.to_string(),
                        attempts,
                    });
                }
                CreateOutcome::Failed { error, .. } => return Err(error.into()),
                CreateOutcome::TimedOut { resource, elapsed } => {
                    return Err(ReconcileError::Transient(format!(
                        "creation of {resource} did not finish within {}s",
                        elapsed.as_secs()
                    )));
                }
            }

            self.enter(&endpoint.id, Phase::ConfirmingCreate);
            let refs: Vec<ResourceRef> = manifests.iter().map(|m| m.resource.clone()).collect();
            match self
                .confirmer
                .confirm_present(&refs, self.config.confirm_create_timeout)
                .await
            {
                PresenceOutcome::Present(objects) => {
                    resource_uid = objects.first().and_then(|o| o.uid.clone());
                }
                PresenceOutcome::Missing { elapsed, missing } => {
                    let missing: Vec<String> = missing.iter().map(ResourceRef::to_string).collect();
                    return Err(ReconcileError::Fatal(format!(
                        "created resources not observable after {}s: {}",
                        elapsed.as_secs(),
                        missing.join(", ")
                    )));
                }
            }
        } else {
            info!(endpoint_id = %endpoint.id, "External target; no cluster resources to create");
        }

        self.enter(&endpoint.id, Phase::Committing);
        let committed = self
            .store
            .commit(&endpoint.id, &desired, framework, resource_uid.as_deref())
            .await?;

        self.enter(&endpoint.id, Phase::SyncingStatus);
        let released = match self.status.derive(&committed).await {
            Ok(observation) => {
                self.store
                    .release(&endpoint.id, observation.status, Some(Utc::now()))
                    .await?
            }
            Err(e) => {
                warn!(endpoint_id = %endpoint.id, error = %e, "Status sync after commit failed");
                self.store
                    .release(&endpoint.id, committed.status, None)
                    .await?
            }
        };
        Ok(released)
    }

    async fn finish(
        &self,
        ctx: &OperationContext,
        operation: Operation,
        endpoint: &ServingEndpoint,
        run: Result<ServingEndpoint, ReconcileError>,
    ) -> Result<ServingEndpoint, ReconcileError> {
        match run {
            Ok(applied) => {
                info!(endpoint_id = %applied.id, status = %applied.status, "Endpoint committed");
                self.emit_audit(
                    ctx,
                    &applied.id,
                    AuditOutcome::Committed,
                    operation,
                    None,
                    Some(applied.desired.spec_hash().to_string()),
                );
                Ok(applied)
            }
            Err(err) => Err(self.roll_back(ctx, operation, endpoint, err).await),
        }
    }

    async fn roll_back(
        &self,
        ctx: &OperationContext,
        operation: Operation,
        endpoint: &ServingEndpoint,
        err: ReconcileError,
    ) -> ReconcileError {
        self.enter(&endpoint.id, Phase::RollingBack);
        warn!(endpoint_id = %endpoint.id, code = err.code(), error = %err, "Rolling back");

        let message = err.to_string();
        if let Err(store_err) = self.store.roll_back(&endpoint.id, &message).await {
            error!(
                endpoint_id = %endpoint.id,
                error = %store_err,
                "Rollback could not be persisted; endpoint stays locked until unlocked"
            );
        }

        let spec_hash = endpoint
            .backup_config
            .as_ref()
            .unwrap_or(&endpoint.desired)
            .spec_hash()
            .to_string();
        self.emit_audit(
            ctx,
            &endpoint.id,
            AuditOutcome::RolledBack,
            operation,
            Some((err.code(), message.as_str())),
            Some(spec_hash),
        );
        err
    }

    fn enter(&self, id: &EndpointId, phase: Phase) {
        info!(endpoint_id = %id, phase = %phase, "Entering phase");
    }

    fn emit_audit(
        &self,
        ctx: &OperationContext,
        id: &EndpointId,
        outcome: AuditOutcome,
        operation: Operation,
        failure: Option<(&str, &str)>,
        spec_hash: Option<String>,
    ) {
        let mut builder = AuditEvent::builder()
            .endpoint(*id)
            .outcome(outcome)
            .actor(ctx.actor.clone())
            .request_id(ctx.request_id)
            .operation(operation);
        if let Some((code, reason)) = failure {
            builder = builder.failure(code, reason);
        }
        if let Some(hash) = spec_hash {
            builder = builder.spec_hash(hash);
        }
        match builder.build() {
            Ok(event) => self.audit.emit(event),
            Err(e) => warn!(endpoint_id = %id, error = %e, "Dropping malformed audit event"),
        }
    }
}

fn in_progress(endpoint: &ServingEndpoint) -> ReconcileError {
    ReconcileError::AlreadyInProgress {
        id: endpoint.id,
        status: endpoint.status.to_string(),
    }
}

/// Convert a panic inside an operation into a fatal error.
async fn guarded<T, F>(future: F) -> Result<T, ReconcileError>
where
    F: Future<Output = Result<T, ReconcileError>>,
{
    match AssertUnwindSafe(future).catch_unwind().await {
        Ok(result) => result,
        Err(panic) => {
            let message = panic_message(panic.as_ref());
            error!(panic = %message, "Operation panicked");
            Err(ReconcileError::Fatal(format!("operation panicked: {message}")))
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
