//! Endpoint persistence.
//!
//! The persisted `status` column is the only serialization point between
//! writers. Every write bumps `resource_version`; the lock acquisition and the
//! status synchronizer's writes are compare-and-set on it.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mserve_id::EndpointId;
use thiserror::Error;

use super::model::{DesiredState, EndpointStatus, ServingEndpoint, ServingFramework};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("endpoint {0} not found")]
    NotFound(EndpointId),

    #[error("endpoint {0} already exists")]
    AlreadyExists(EndpointId),

    #[error("route {0} is already in use")]
    RouteTaken(String),

    #[error("stored endpoint {id} is corrupt: {message}")]
    Corrupt { id: String, message: String },

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

#[async_trait]
pub trait EndpointStore: Send + Sync {
    /// Insert a new endpoint row. Fails if the id or route is taken.
    async fn insert(&self, endpoint: &ServingEndpoint) -> StoreResult<()>;

    async fn get(&self, id: &EndpointId) -> StoreResult<Option<ServingEndpoint>>;

    async fn list(&self) -> StoreResult<Vec<ServingEndpoint>>;

    /// Atomically set the lock status and write `backup`, provided the row is
    /// still at `expected_version` and not already locked.
    ///
    /// Returns `None` when the compare-and-set lost.
    async fn acquire_lock(
        &self,
        id: &EndpointId,
        expected_version: i64,
        lock: EndpointStatus,
        backup: &DesiredState,
    ) -> StoreResult<Option<ServingEndpoint>>;

    /// Persist the newly applied desired state and clear the backup. The lock
    /// status is left in place for the status sync that follows.
    async fn commit(
        &self,
        id: &EndpointId,
        desired: &DesiredState,
        framework: ServingFramework,
        resource_ref: Option<&str>,
    ) -> StoreResult<ServingEndpoint>;

    /// Restore desired fields from the backup, mark the endpoint failed and
    /// release the lock. The backup is kept.
    async fn roll_back(&self, id: &EndpointId, message: &str) -> StoreResult<ServingEndpoint>;

    /// Release the lock with an observed status.
    async fn release(
        &self,
        id: &EndpointId,
        status: EndpointStatus,
        checked_at: Option<DateTime<Utc>>,
    ) -> StoreResult<ServingEndpoint>;

    /// Write an observed status if the row is still at `expected_version`.
    async fn record_observation(
        &self,
        id: &EndpointId,
        expected_version: i64,
        status: EndpointStatus,
        checked_at: DateTime<Utc>,
    ) -> StoreResult<bool>;

    async fn remove(&self, id: &EndpointId) -> StoreResult<()>;
}

#[derive(Default)]
struct MemoryState {
    rows: BTreeMap<EndpointId, ServingEndpoint>,
    fail_commits: bool,
}

/// In-memory endpoint store.
#[derive(Default)]
pub struct InMemoryEndpointStore {
    state: Mutex<MemoryState>,
}

impl InMemoryEndpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Synchronous read, usable from inside cluster callbacks.
    pub fn snapshot(&self, id: &EndpointId) -> Option<ServingEndpoint> {
        self.lock().rows.get(id).cloned()
    }

    /// Overwrite a row as-is.
    pub fn put(&self, endpoint: ServingEndpoint) {
        self.lock().rows.insert(endpoint.id, endpoint);
    }

    /// Make every `commit` fail until reset.
    pub fn fail_commits(&self, fail: bool) {
        self.lock().fail_commits = fail;
    }

    fn update<F>(&self, id: &EndpointId, apply: F) -> StoreResult<ServingEndpoint>
    where
        F: FnOnce(&mut ServingEndpoint),
    {
        let mut state = self.lock();
        let row = state.rows.get_mut(id).ok_or(StoreError::NotFound(*id))?;
        apply(row);
        row.resource_version += 1;
        row.updated_at = Utc::now();
        Ok(row.clone())
    }
}

#[async_trait]
impl EndpointStore for InMemoryEndpointStore {
    async fn insert(&self, endpoint: &ServingEndpoint) -> StoreResult<()> {
        let mut state = self.lock();
        if state.rows.contains_key(&endpoint.id) {
            return Err(StoreError::AlreadyExists(endpoint.id));
        }
        if state.rows.values().any(|r| r.route == endpoint.route) {
            return Err(StoreError::RouteTaken(endpoint.route.clone()));
        }
        state.rows.insert(endpoint.id, endpoint.clone());
        Ok(())
    }

    async fn get(&self, id: &EndpointId) -> StoreResult<Option<ServingEndpoint>> {
        Ok(self.snapshot(id))
    }

    async fn list(&self) -> StoreResult<Vec<ServingEndpoint>> {
        Ok(self.lock().rows.values().cloned().collect())
    }

    async fn acquire_lock(
        &self,
        id: &EndpointId,
        expected_version: i64,
        lock: EndpointStatus,
        backup: &DesiredState,
    ) -> StoreResult<Option<ServingEndpoint>> {
        let mut state = self.lock();
        let row = state.rows.get_mut(id).ok_or(StoreError::NotFound(*id))?;
        if row.resource_version != expected_version || row.status.is_locked() {
            return Ok(None);
        }
        row.status = lock;
        row.backup_config = Some(backup.clone());
        row.resource_version += 1;
        row.updated_at = Utc::now();
        Ok(Some(row.clone()))
    }

    async fn commit(
        &self,
        id: &EndpointId,
        desired: &DesiredState,
        framework: ServingFramework,
        resource_ref: Option<&str>,
    ) -> StoreResult<ServingEndpoint> {
        if self.lock().fail_commits {
            return Err(StoreError::Unavailable("commit rejected".to_string()));
        }
        self.update(id, |row| {
            row.desired = desired.clone();
            row.serving_framework = framework;
            row.last_resource_ref = resource_ref.map(str::to_string);
            row.backup_config = None;
            row.status_message = None;
        })
    }

    async fn roll_back(&self, id: &EndpointId, message: &str) -> StoreResult<ServingEndpoint> {
        self.update(id, |row| {
            if let Some(backup) = &row.backup_config {
                row.desired = backup.clone();
            }
            row.status = EndpointStatus::Failed;
            row.status_message = Some(message.to_string());
        })
    }

    async fn release(
        &self,
        id: &EndpointId,
        status: EndpointStatus,
        checked_at: Option<DateTime<Utc>>,
    ) -> StoreResult<ServingEndpoint> {
        self.update(id, |row| {
            row.status = status;
            if checked_at.is_some() {
                row.last_health_check_at = checked_at;
            }
        })
    }

    async fn record_observation(
        &self,
        id: &EndpointId,
        expected_version: i64,
        status: EndpointStatus,
        checked_at: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let mut state = self.lock();
        let Some(row) = state.rows.get_mut(id) else {
            return Ok(false);
        };
        if row.resource_version != expected_version {
            return Ok(false);
        }
        row.status = status;
        row.last_health_check_at = Some(checked_at);
        row.resource_version += 1;
        row.updated_at = Utc::now();
        Ok(true)
    }

    async fn remove(&self, id: &EndpointId) -> StoreResult<()> {
        self.lock().rows.remove(id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serving::fixtures::{sample_desired, sample_endpoint};

    #[tokio::test]
    async fn test_insert_rejects_duplicate_route() {
        let store = InMemoryEndpointStore::new();
        let a = sample_endpoint();
        store.insert(&a).await.unwrap();

        let mut b = sample_endpoint();
        b.route = a.route.clone();
        assert!(matches!(
            store.insert(&b).await,
            Err(StoreError::RouteTaken(_))
        ));
    }

    #[tokio::test]
    async fn test_lock_is_compare_and_set() {
        let store = InMemoryEndpointStore::new();
        let ep = sample_endpoint();
        store.insert(&ep).await.unwrap();

        let backup = sample_desired();
        let locked = store
            .acquire_lock(&ep.id, ep.resource_version, EndpointStatus::Deploying, &backup)
            .await
            .unwrap()
            .expect("first lock wins");
        assert_eq!(locked.status, EndpointStatus::Deploying);
        assert_eq!(locked.backup_config, Some(backup.clone()));
        assert!(locked.mutation_in_flight());

        // Stale version loses.
        assert!(store
            .acquire_lock(&ep.id, ep.resource_version, EndpointStatus::Terminating, &backup)
            .await
            .unwrap()
            .is_none());

        // Current version but already locked also loses.
        assert!(store
            .acquire_lock(&ep.id, locked.resource_version, EndpointStatus::Terminating, &backup)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_roll_back_restores_backup() {
        let store = InMemoryEndpointStore::new();
        let ep = sample_endpoint();
        store.insert(&ep).await.unwrap();

        let prior = ep.desired.clone();
        store
            .acquire_lock(&ep.id, ep.resource_version, EndpointStatus::Deploying, &prior)
            .await
            .unwrap();

        // Simulate a desired state that drifted while locked.
        let mut drifted = store.snapshot(&ep.id).unwrap();
        drifted.desired.max_replicas = 9;
        store.put(drifted);

        let rolled = store.roll_back(&ep.id, "boom").await.unwrap();
        assert_eq!(rolled.desired, prior);
        assert_eq!(rolled.status, EndpointStatus::Failed);
        assert_eq!(rolled.status_message.as_deref(), Some("boom"));
        assert!(rolled.backup_config.is_some());
    }

    #[tokio::test]
    async fn test_observation_is_compare_and_set() {
        let store = InMemoryEndpointStore::new();
        let ep = sample_endpoint();
        store.insert(&ep).await.unwrap();

        let now = Utc::now();
        assert!(store
            .record_observation(&ep.id, ep.resource_version, EndpointStatus::Degraded, now)
            .await
            .unwrap());
        assert!(!store
            .record_observation(&ep.id, ep.resource_version, EndpointStatus::Healthy, now)
            .await
            .unwrap());
        assert_eq!(
            store.snapshot(&ep.id).unwrap().status,
            EndpointStatus::Degraded
        );
    }
}
