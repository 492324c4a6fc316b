//! End-to-end reconciler scenarios against the in-memory cluster and store.
//!
//! Time is paused, so the multi-minute confirmation budgets run instantly.

mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use common::{concurrency, ctx, deploy_request, Harness, MODEL};
use futures_util::future::join_all;
use mserve_control_plane::serving::{
    cluster::{ClusterCall, ClusterClient, ClusterError, DeleteMode, ResourceKind, StuckDeletion},
    model::{DesiredStateOverrides, EndpointStatus, ServeTarget, ServingFramework},
    ReconcileError,
};
use mserve_events::{AuditOutcome, Operation};
use tokio::time::Instant;

#[tokio::test(start_paused = true)]
async fn deploy_creates_resources_and_commits() {
    let h = Harness::new();
    let endpoint = h.deploy("/chat/llama").await;

    assert_eq!(endpoint.status, EndpointStatus::Healthy);
    assert_eq!(endpoint.backup_config, None);
    assert_eq!(endpoint.status_message, None);
    assert!(endpoint.last_resource_ref.is_some());
    assert!(endpoint.last_health_check_at.is_some());
    assert_eq!(endpoint.desired.deployment_spec.model_ref, MODEL);
    assert_eq!(endpoint.desired.deployment_spec.model_family, "llama");
    assert_eq!(endpoint.desired.deployment_spec.runtime.max_input_tokens, 8192);
    assert_eq!(endpoint.created_by, "user:alice");

    for resource in h.refs(&endpoint, ServingFramework::Raw) {
        assert!(h.cluster.exists(&resource), "{resource} should exist");
    }
    let uid = h
        .cluster
        .object(&h.deployment_ref(&endpoint))
        .and_then(|o| o.uid);
    assert_eq!(endpoint.last_resource_ref, uid);

    let events = h.audit.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].outcome, AuditOutcome::Committed);
    assert_eq!(events[0].payload.operation, Operation::Deploy);
    assert_eq!(
        events[0].payload.spec_hash.as_deref(),
        Some(endpoint.desired.spec_hash().to_string().as_str())
    );
}

#[tokio::test(start_paused = true)]
async fn deploy_managed_framework_creates_inference_service() {
    let h = Harness::new();
    let endpoint = h
        .orchestrator
        .deploy(&ctx(), deploy_request("/chat/managed", ServingFramework::Managed))
        .await
        .unwrap();

    assert_eq!(endpoint.serving_framework, ServingFramework::Managed);
    assert_eq!(endpoint.status, EndpointStatus::Healthy);
    let isvc = h.refs(&endpoint, ServingFramework::Managed);
    assert_eq!(isvc.len(), 1);
    assert!(h.cluster.exists(&isvc[0]));
    assert!(!h.cluster.exists(&h.deployment_ref(&endpoint)));
}

#[tokio::test(start_paused = true)]
async fn deploy_rejects_bad_input_without_side_effects() {
    let h = Harness::new();

    let err = h
        .orchestrator
        .deploy(&ctx(), deploy_request("/chat/../etc", ServingFramework::Raw))
        .await
        .unwrap_err();
    assert!(matches!(err, ReconcileError::Validation(_)));

    let mut unknown = deploy_request("/chat/unknown", ServingFramework::Raw);
    unknown.spec.model_ref = Some("not-in-catalog".to_string());
    let err = h.orchestrator.deploy(&ctx(), unknown).await.unwrap_err();
    assert!(matches!(err, ReconcileError::Validation(_)));

    assert!(h.orchestrator.list().await.unwrap().is_empty());
    assert!(h.cluster.calls().is_empty());
    assert!(h.audit.events().is_empty());
}

#[tokio::test(start_paused = true)]
async fn deploy_rejects_taken_route() {
    let h = Harness::new();
    h.deploy("/chat/llama").await;

    let err = h
        .orchestrator
        .deploy(&ctx(), deploy_request("/chat//llama/", ServingFramework::Raw))
        .await
        .unwrap_err();
    assert!(matches!(err, ReconcileError::Validation(ref m) if m.contains("/chat/llama")));
    assert_eq!(h.orchestrator.list().await.unwrap().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn external_target_skips_cluster_creation() {
    let h = Harness::new();
    let mut request = deploy_request("/chat/hosted", ServingFramework::Raw);
    request.spec.serve_target = Some(ServeTarget::External);
    request.spec.external_url = Some("https://api.example.com/v1".to_string());

    let endpoint = h.orchestrator.deploy(&ctx(), request).await.unwrap();
    assert_eq!(endpoint.status, EndpointStatus::Healthy);
    assert_eq!(endpoint.desired.runtime_image, None);
    assert_eq!(
        h.cluster
            .count_calls(|c| matches!(c, ClusterCall::Create(_))),
        0
    );
}

#[tokio::test(start_paused = true)]
async fn redeploy_happy_path_keeps_names_and_clears_backup() {
    let h = Harness::new();
    let endpoint = h.deploy("/chat/llama").await;
    let old_uid = endpoint.last_resource_ref.clone();

    let updated = h
        .orchestrator
        .redeploy(&ctx(), &endpoint.id, concurrency(64))
        .await
        .unwrap();

    assert_eq!(updated.status, EndpointStatus::Healthy);
    assert_eq!(updated.backup_config, None);
    assert_eq!(
        updated.desired.deployment_spec.runtime.max_concurrent_requests,
        64
    );
    // Untouched fields carry over.
    assert_eq!(
        updated.desired.deployment_spec.runtime.max_input_tokens,
        endpoint.desired.deployment_spec.runtime.max_input_tokens
    );
    assert!(h.cluster.exists(&h.deployment_ref(&endpoint)));
    assert_ne!(updated.last_resource_ref, old_uid);

    let outcomes: Vec<_> = h.audit.events().iter().map(|e| e.outcome).collect();
    assert_eq!(outcomes, vec![AuditOutcome::Committed, AuditOutcome::Committed]);
}

#[tokio::test(start_paused = true)]
async fn redeploy_confirms_deletion_before_creating() {
    let h = Harness::new();
    let endpoint = h.deploy("/chat/llama").await;
    h.cluster.set_deletion_delay(Duration::from_secs(7));
    h.cluster.clear_calls();

    h.orchestrator
        .redeploy(&ctx(), &endpoint.id, concurrency(48))
        .await
        .unwrap();

    let calls = h.cluster.calls();
    let first_create = calls
        .iter()
        .position(|c| matches!(c, ClusterCall::Create(_)))
        .unwrap();
    let last_delete = calls
        .iter()
        .rposition(|c| matches!(c, ClusterCall::Delete(..)))
        .unwrap();
    assert!(last_delete < first_create);
}

#[tokio::test(start_paused = true)]
async fn no_premature_commit() {
    let h = Harness::new();
    let endpoint = h.deploy("/chat/llama").await;

    let seen = Arc::new(Mutex::new(Vec::new()));
    {
        let store = h.store.clone();
        let seen = seen.clone();
        let id = endpoint.id;
        h.cluster.on_create(move |_| {
            if let Some(row) = store.snapshot(&id) {
                seen.lock().unwrap().push((
                    row.desired.deployment_spec.runtime.max_concurrent_requests,
                    row.mutation_in_flight(),
                ));
            }
        });
    }

    h.orchestrator
        .redeploy(&ctx(), &endpoint.id, concurrency(64))
        .await
        .unwrap();

    let seen = seen.lock().unwrap().clone();
    assert!(!seen.is_empty());
    for (limit, in_flight) in seen {
        assert_eq!(limit, 32, "row must keep the old spec while creating");
        assert!(in_flight);
    }
    let row = h.store.snapshot(&endpoint.id).unwrap();
    assert_eq!(row.desired.deployment_spec.runtime.max_concurrent_requests, 64);
}

#[tokio::test(start_paused = true)]
async fn at_most_one_writer() {
    let h = Harness::new();
    let endpoint = h.deploy("/chat/llama").await;
    // Keep the first redeploy busy confirming deletion.
    h.cluster.set_deletion_delay(Duration::from_secs(10));

    let attempts = (0..5).map(|i| {
        let orchestrator = h.orchestrator.clone();
        let id = endpoint.id;
        async move {
            orchestrator
                .redeploy(&ctx(), &id, concurrency(40 + i))
                .await
        }
    });
    let results = join_all(attempts).await;

    let succeeded = results.iter().filter(|r| r.is_ok()).count();
    let rejected = results
        .iter()
        .filter(|r| matches!(r, Err(ReconcileError::AlreadyInProgress { .. })))
        .count();
    assert_eq!(succeeded, 1);
    assert_eq!(rejected, 4);

    // The rejected callers changed nothing.
    let row = h.store.snapshot(&endpoint.id).unwrap();
    assert_eq!(row.desired.deployment_spec.runtime.max_concurrent_requests, 40);
}

#[tokio::test(start_paused = true)]
async fn delete_during_redeploy_is_rejected() {
    let h = Harness::new();
    let endpoint = h.deploy("/chat/llama").await;
    h.cluster.set_deletion_delay(Duration::from_secs(10));

    let id = endpoint.id;
    let (redeploy_ctx, delete_ctx) = (ctx(), ctx());
    let (redeploy, delete) = tokio::join!(
        h.orchestrator.redeploy(&redeploy_ctx, &id, concurrency(64)),
        h.orchestrator.delete(&delete_ctx, &id),
    );
    assert!(redeploy.is_ok());
    assert!(matches!(delete, Err(ReconcileError::AlreadyInProgress { ref status, .. }) if status == "deploying"));
}

#[tokio::test(start_paused = true)]
async fn delete_removes_everything() {
    let h = Harness::new();
    let endpoint = h.deploy("/chat/llama").await;

    h.orchestrator.delete(&ctx(), &endpoint.id).await.unwrap();

    assert!(h.store.snapshot(&endpoint.id).is_none());
    assert!(h.cluster.resources().is_empty());
    let last = h.audit.events().pop().unwrap();
    assert_eq!(last.outcome, AuditOutcome::Deleted);
    assert_eq!(last.payload.operation, Operation::Delete);
}

#[tokio::test(start_paused = true)]
async fn delete_is_idempotent() {
    let h = Harness::new();
    let endpoint = h.deploy("/chat/llama").await;

    // Resources already gone out of band: still succeeds.
    for resource in h.refs(&endpoint, ServingFramework::Raw) {
        h.cluster
            .delete(&resource, DeleteMode::Graceful)
            .await
            .unwrap();
    }
    h.orchestrator.delete(&ctx(), &endpoint.id).await.unwrap();

    // Once the row is gone the endpoint is simply unknown.
    let err = h
        .orchestrator
        .delete(&ctx(), &endpoint.id)
        .await
        .unwrap_err();
    assert_eq!(err, ReconcileError::NotFound(endpoint.id));
}

#[tokio::test(start_paused = true)]
async fn conflicts_within_budget_converge() {
    let h = Harness::new();
    let endpoint = h.deploy("/chat/llama").await;
    // Succeeds on the third and last attempt.
    h.cluster.inject_conflicts(h.deployment_ref(&endpoint), 2);

    let updated = h
        .orchestrator
        .redeploy(&ctx(), &endpoint.id, concurrency(64))
        .await
        .unwrap();
    assert_eq!(updated.status, EndpointStatus::Healthy);
}

#[tokio::test(start_paused = true)]
async fn conflicts_beyond_budget_exhaust_and_roll_back() {
    let h = Harness::new();
    let endpoint = h.deploy("/chat/llama").await;
    h.cluster.inject_conflicts(h.deployment_ref(&endpoint), 3);

    let err = h
        .orchestrator
        .redeploy(&ctx(), &endpoint.id, concurrency(64))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ReconcileError::CreationConflictExhausted { attempts: 3, .. }
    ));

    let row = h.store.snapshot(&endpoint.id).unwrap();
    assert_eq!(row.status, EndpointStatus::Failed);
    assert_eq!(row.desired, endpoint.desired);
}

#[tokio::test(start_paused = true)]
async fn rollback_restores_prior_spec() {
    let h = Harness::new();
    let endpoint = h.deploy("/chat/llama").await;
    let service = h
        .refs(&endpoint, ServingFramework::Raw)
        .into_iter()
        .find(|r| r.kind == ResourceKind::Service)
        .unwrap();
    h.cluster.fail_creates(
        service.clone(),
        ClusterError::from_status(&service, 422, "spec.ports: Invalid value"),
    );

    let err = h
        .orchestrator
        .redeploy(&ctx(), &endpoint.id, concurrency(64))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "fatal");

    let row = h.store.snapshot(&endpoint.id).unwrap();
    assert_eq!(row.status, EndpointStatus::Failed);
    assert_eq!(row.desired, endpoint.desired);
    assert_eq!(row.backup_config, Some(endpoint.desired.clone()));
    assert!(row.status_message.unwrap().contains("Invalid value"));
    assert!(!row.status.is_locked());

    let last = h.audit.events().pop().unwrap();
    assert_eq!(last.outcome, AuditOutcome::RolledBack);
    assert_eq!(last.payload.error_code.as_deref(), Some("fatal"));
}

#[tokio::test(start_paused = true)]
async fn failed_endpoint_recovers_on_next_redeploy() {
    let h = Harness::new();
    let endpoint = h.deploy("/chat/llama").await;
    h.cluster.inject_conflicts(h.deployment_ref(&endpoint), 3);
    h.orchestrator
        .redeploy(&ctx(), &endpoint.id, concurrency(64))
        .await
        .unwrap_err();

    // The sync worker leaves failed rows with a backup alone.
    let stats = h.orchestrator.sync_all().await.unwrap();
    assert_eq!(stats.skipped, 1);

    let recovered = h
        .orchestrator
        .redeploy(&ctx(), &endpoint.id, DesiredStateOverrides::default())
        .await
        .unwrap();
    assert_eq!(recovered.status, EndpointStatus::Healthy);
    assert_eq!(recovered.backup_config, None);
    assert_eq!(recovered.status_message, None);
}

#[tokio::test(start_paused = true)]
async fn commit_failure_rolls_back() {
    let h = Harness::new();
    let endpoint = h.deploy("/chat/llama").await;
    h.store.fail_commits(true);

    let err = h
        .orchestrator
        .redeploy(&ctx(), &endpoint.id, concurrency(64))
        .await
        .unwrap_err();
    assert!(matches!(err, ReconcileError::Fatal(_)));

    let row = h.store.snapshot(&endpoint.id).unwrap();
    assert_eq!(row.status, EndpointStatus::Failed);
    assert_eq!(row.desired, endpoint.desired);
}

#[tokio::test(start_paused = true)]
async fn stuck_terminating_is_forced_once() {
    let h = Harness::new();
    let endpoint = h.deploy("/chat/llama").await;
    let deployment = h.deployment_ref(&endpoint);
    h.cluster.set_stuck(deployment.clone(), StuckDeletion::UntilForced);

    let start = Instant::now();
    let updated = h
        .orchestrator
        .redeploy(&ctx(), &endpoint.id, concurrency(64))
        .await
        .unwrap();

    assert_eq!(updated.status, EndpointStatus::Healthy);
    assert_eq!(
        h.cluster.count_calls(
            |c| matches!(c, ClusterCall::Delete(r, DeleteMode::Force) if r == &deployment)
        ),
        1
    );
    let elapsed = start.elapsed();
    assert!(elapsed >= Duration::from_secs(60), "forced only after the stall threshold");
    assert!(elapsed < Duration::from_secs(120));
}

#[tokio::test(start_paused = true)]
async fn deletion_timeout_rolls_back_and_leaves_resource() {
    let h = Harness::new();
    let endpoint = h.deploy("/chat/llama").await;
    let deployment = h.deployment_ref(&endpoint);
    h.cluster.set_stuck(deployment.clone(), StuckDeletion::Forever);

    let start = Instant::now();
    let err = h
        .orchestrator
        .redeploy(&ctx(), &endpoint.id, concurrency(64))
        .await
        .unwrap_err();

    assert!(start.elapsed() >= Duration::from_secs(120));
    match &err {
        ReconcileError::DeletionTimeout { remaining, .. } => {
            assert_eq!(remaining, &vec![deployment.to_string()]);
        }
        other => panic!("expected deletion timeout, got {other:?}"),
    }
    assert!(err.to_string().starts_with(
        "deletion of previous resources timed out after 120s; resources may require manual cleanup"
    ));

    let row = h.store.snapshot(&endpoint.id).unwrap();
    assert_eq!(row.status, EndpointStatus::Failed);
    assert_eq!(row.desired, endpoint.desired);
    assert!(h.cluster.exists(&deployment));
}

#[tokio::test(start_paused = true)]
async fn framework_switch_sweeps_old_resources() {
    let h = Harness::new();
    let endpoint = h.deploy("/chat/llama").await;

    let switched = h
        .orchestrator
        .redeploy(
            &ctx(),
            &endpoint.id,
            DesiredStateOverrides {
                serving_framework: Some(ServingFramework::Managed),
                ..DesiredStateOverrides::default()
            },
        )
        .await
        .unwrap();

    assert_eq!(switched.serving_framework, ServingFramework::Managed);
    for raw in h.refs(&endpoint, ServingFramework::Raw) {
        assert!(!h.cluster.exists(&raw), "{raw} should be gone");
    }
    for managed in h.refs(&endpoint, ServingFramework::Managed) {
        assert!(h.cluster.exists(&managed));
    }
}

#[tokio::test(start_paused = true)]
async fn model_change_consults_catalog() {
    let h = Harness::new();
    let endpoint = h.deploy("/chat/llama").await;
    let lookups = h.catalog.lookups();

    let updated = h
        .orchestrator
        .redeploy(
            &ctx(),
            &endpoint.id,
            DesiredStateOverrides {
                model_ref: Some("mistral-7b".to_string()),
                ..DesiredStateOverrides::default()
            },
        )
        .await
        .unwrap();

    let spec = &updated.desired.deployment_spec;
    assert_eq!(spec.model_family, "mistral");
    assert_eq!(spec.storage_uri.as_deref(), Some("s3://models/mistral-7b"));
    assert_eq!(spec.resources, endpoint.desired.deployment_spec.resources);
    // Resolved once, before the lock.
    assert_eq!(h.catalog.lookups(), lookups + 1);
}

#[tokio::test(start_paused = true)]
async fn invalid_redeploy_leaves_resources_alone() {
    let h = Harness::new();
    let endpoint = h.deploy("/chat/llama").await;
    h.cluster.clear_calls();

    let err = h
        .orchestrator
        .redeploy(
            &ctx(),
            &endpoint.id,
            DesiredStateOverrides {
                min_replicas: Some(5),
                max_replicas: Some(2),
                ..DesiredStateOverrides::default()
            },
        )
        .await
        .unwrap_err();

    assert!(matches!(err, ReconcileError::Validation(_)));
    assert_eq!(
        h.cluster
            .count_calls(|c| matches!(c, ClusterCall::Delete(..))),
        0
    );
    assert_eq!(h.store.snapshot(&endpoint.id).unwrap(), endpoint);
}

#[tokio::test(start_paused = true)]
async fn unrenderable_limits_are_rejected_before_teardown() {
    let h = Harness::new();
    let endpoint = h.deploy("/chat/llama").await;
    h.cluster.clear_calls();

    for overrides in [
        DesiredStateOverrides {
            max_input_tokens: Some(u32::MAX),
            max_output_tokens: Some(1),
            ..DesiredStateOverrides::default()
        },
        DesiredStateOverrides {
            max_replicas: Some(u32::MAX),
            ..DesiredStateOverrides::default()
        },
    ] {
        let err = h
            .orchestrator
            .redeploy(&ctx(), &endpoint.id, overrides)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "validation_error", "{err}");
    }

    assert_eq!(
        h.cluster
            .count_calls(|c| matches!(c, ClusterCall::Delete(..))),
        0
    );
    assert!(h.cluster.exists(&h.deployment_ref(&endpoint)));
    assert_eq!(h.store.snapshot(&endpoint.id).unwrap(), endpoint);
}

#[tokio::test(start_paused = true)]
async fn transient_delete_failure_rolls_back() {
    let h = Harness::new();
    let endpoint = h.deploy("/chat/llama").await;
    let deployment = h.deployment_ref(&endpoint);
    h.cluster.clear_calls();
    h.cluster.fail_deletes(
        deployment.clone(),
        Some(ClusterError::transient(&deployment, "connection reset")),
    );

    let err = h
        .orchestrator
        .redeploy(&ctx(), &endpoint.id, concurrency(64))
        .await
        .unwrap_err();
    assert!(matches!(err, ReconcileError::Transient(_)), "{err}");
    assert!(err.is_retryable());

    let row = h.store.snapshot(&endpoint.id).unwrap();
    assert_eq!(row.status, EndpointStatus::Failed);
    assert_eq!(row.desired, endpoint.desired);
    assert!(row.status_message.unwrap().contains("connection reset"));
    assert!(h.cluster.exists(&deployment));
    assert_eq!(
        h.cluster
            .count_calls(|c| matches!(c, ClusterCall::Create(..))),
        0
    );

    let last = h.audit.events().pop().unwrap();
    assert_eq!(last.outcome, AuditOutcome::RolledBack);

    h.cluster.fail_deletes(deployment, None);
    let recovered = h
        .orchestrator
        .redeploy(&ctx(), &endpoint.id, concurrency(64))
        .await
        .unwrap();
    assert_eq!(recovered.backup_config, None);
}

#[tokio::test(start_paused = true)]
async fn panic_during_create_becomes_fatal() {
    let h = Harness::new();
    let endpoint = h.deploy("/chat/llama").await;
    h.cluster.on_create(|_| panic!("admission webhook exploded"));

    let err = h
        .orchestrator
        .redeploy(&ctx(), &endpoint.id, concurrency(64))
        .await
        .unwrap_err();
    assert!(matches!(err, ReconcileError::Fatal(ref m) if m.contains("admission webhook exploded")));

    let row = h.store.snapshot(&endpoint.id).unwrap();
    assert_eq!(row.status, EndpointStatus::Failed);
    assert_eq!(row.desired, endpoint.desired);
}

#[tokio::test(start_paused = true)]
async fn get_status_reflects_live_pods() {
    let h = Harness::new();
    let endpoint = h.deploy("/chat/llama").await;

    let pods = h
        .cluster
        .resources()
        .into_iter()
        .filter(|r| r.kind == ResourceKind::Pod);
    for pod in pods {
        h.cluster.delete(&pod, DeleteMode::Graceful).await.unwrap();
    }

    let observed = h.orchestrator.get_status(&endpoint.id).await.unwrap();
    assert_eq!(observed.status, EndpointStatus::Deploying);
    assert!(observed.resource_version > endpoint.resource_version);
}

#[tokio::test(start_paused = true)]
async fn get_status_keeps_recorded_status_when_cluster_is_unreachable() {
    let h = Harness::new();
    let endpoint = h.deploy("/chat/llama").await;
    let deployment = h.deployment_ref(&endpoint);
    h.cluster
        .fail_reads(Some(ClusterError::transient(&deployment, "connection reset")));

    let observed = h.orchestrator.get_status(&endpoint.id).await.unwrap();
    assert_eq!(observed, endpoint);
}

#[tokio::test(start_paused = true)]
async fn unlock_breaks_stale_lock() {
    let h = Harness::new();
    let endpoint = h.deploy("/chat/llama").await;

    // A crashed redeploy left the row locked with a half-applied spec.
    let mut stuck = endpoint.clone();
    stuck.status = EndpointStatus::Deploying;
    stuck.backup_config = Some(endpoint.desired.clone());
    stuck.desired.deployment_spec.runtime.max_concurrent_requests = 99;
    stuck.updated_at = Utc::now() - chrono::Duration::minutes(10);
    h.store.put(stuck);

    let unlocked = h.orchestrator.unlock(&ctx(), &endpoint.id).await.unwrap();
    assert_eq!(unlocked.status, EndpointStatus::Failed);
    assert_eq!(unlocked.desired, endpoint.desired);

    let last = h.audit.events().pop().unwrap();
    assert_eq!(last.outcome, AuditOutcome::RolledBack);
    assert_eq!(last.payload.operation, Operation::Unlock);
    assert_eq!(last.payload.error_code.as_deref(), Some("operator_unlock"));
}

#[tokio::test(start_paused = true)]
async fn unlock_refuses_fresh_lock() {
    let h = Harness::new();
    let endpoint = h.deploy("/chat/llama").await;

    let mut locked = endpoint.clone();
    locked.status = EndpointStatus::Deploying;
    locked.backup_config = Some(endpoint.desired.clone());
    locked.updated_at = Utc::now();
    h.store.put(locked);

    let err = h
        .orchestrator
        .unlock(&ctx(), &endpoint.id)
        .await
        .unwrap_err();
    assert!(matches!(err, ReconcileError::AlreadyInProgress { .. }));
}

#[tokio::test(start_paused = true)]
async fn unlock_of_idle_endpoint_is_a_no_op() {
    let h = Harness::new();
    let endpoint = h.deploy("/chat/llama").await;
    let events_before = h.audit.events().len();

    let same = h.orchestrator.unlock(&ctx(), &endpoint.id).await.unwrap();
    assert_eq!(same, endpoint);
    assert_eq!(h.audit.events().len(), events_before);
}

#[tokio::test(start_paused = true)]
async fn sync_all_skips_in_flight_rows() {
    let h = Harness::new();
    let a = h.deploy("/chat/a").await;
    let b = h.deploy("/chat/b").await;

    let mut in_flight = b.clone();
    in_flight.status = EndpointStatus::Terminating;
    in_flight.backup_config = Some(b.desired.clone());
    h.store.put(in_flight.clone());

    let stats = h.orchestrator.sync_all().await.unwrap();
    assert_eq!(stats.checked, 2);
    assert_eq!(stats.skipped, 1);
    assert_eq!(stats.updated, 1);
    assert_eq!(h.store.snapshot(&b.id).unwrap(), in_flight);
    assert_eq!(
        h.store.snapshot(&a.id).unwrap().status,
        EndpointStatus::Healthy
    );
}
