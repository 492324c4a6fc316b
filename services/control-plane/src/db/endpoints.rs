//! Postgres-backed endpoint store.
//!
//! `deployment_spec`, `autoscale_policy` and `backup_config` are JSONB.
//! Lock acquisition and status observations are single compare-and-set
//! statements on `resource_version`; the other writes read the row `FOR
//! UPDATE` inside a transaction and write it back.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mserve_id::EndpointId;
use sqlx::{postgres::PgPool, postgres::PgRow, Postgres, Row, Transaction};

use crate::serving::model::{
    AutoscalePolicy, DeploymentSpec, DesiredState, EndpointStatus, ServingEndpoint,
    ServingFramework,
};
use crate::serving::store::{EndpointStore, StoreError, StoreResult};

const COLUMNS: &str = "id, name, route, namespace, serving_framework, deployment_spec, \
    runtime_image, min_replicas, max_replicas, autoscale_policy, status, status_message, \
    last_resource_ref, last_health_check_at, backup_config, resource_version, created_by, \
    created_at, updated_at";

const ROUTE_CONSTRAINT: &str = "serving_endpoints_route_key";

/// A row from the serving_endpoints table.
#[derive(Debug, Clone)]
struct EndpointRow {
    id: String,
    name: String,
    route: String,
    namespace: String,
    serving_framework: String,
    deployment_spec: serde_json::Value,
    runtime_image: Option<String>,
    min_replicas: i64,
    max_replicas: i64,
    autoscale_policy: serde_json::Value,
    status: String,
    status_message: Option<String>,
    last_resource_ref: Option<String>,
    last_health_check_at: Option<DateTime<Utc>>,
    backup_config: Option<serde_json::Value>,
    resource_version: i64,
    created_by: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl<'r> sqlx::FromRow<'r, PgRow> for EndpointRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            route: row.try_get("route")?,
            namespace: row.try_get("namespace")?,
            serving_framework: row.try_get("serving_framework")?,
            deployment_spec: row.try_get("deployment_spec")?,
            runtime_image: row.try_get("runtime_image")?,
            min_replicas: row.try_get("min_replicas")?,
            max_replicas: row.try_get("max_replicas")?,
            autoscale_policy: row.try_get("autoscale_policy")?,
            status: row.try_get("status")?,
            status_message: row.try_get("status_message")?,
            last_resource_ref: row.try_get("last_resource_ref")?,
            last_health_check_at: row.try_get("last_health_check_at")?,
            backup_config: row.try_get("backup_config")?,
            resource_version: row.try_get("resource_version")?,
            created_by: row.try_get("created_by")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl EndpointRow {
    fn into_endpoint(self) -> StoreResult<ServingEndpoint> {
        let corrupt = |message: String| StoreError::Corrupt {
            id: self.id.clone(),
            message,
        };

        let id = EndpointId::parse(&self.id).map_err(|e| corrupt(e.to_string()))?;
        let serving_framework: ServingFramework =
            self.serving_framework.parse().map_err(corrupt)?;
        let status: EndpointStatus = self.status.parse().map_err(corrupt)?;
        let deployment_spec: DeploymentSpec =
            serde_json::from_value(self.deployment_spec.clone())
                .map_err(|e| corrupt(format!("deployment_spec: {e}")))?;
        let autoscale_policy: AutoscalePolicy =
            serde_json::from_value(self.autoscale_policy.clone())
                .map_err(|e| corrupt(format!("autoscale_policy: {e}")))?;
        let backup_config = self
            .backup_config
            .clone()
            .map(serde_json::from_value::<DesiredState>)
            .transpose()
            .map_err(|e| corrupt(format!("backup_config: {e}")))?;
        let min_replicas =
            u32::try_from(self.min_replicas).map_err(|e| corrupt(format!("min_replicas: {e}")))?;
        let max_replicas =
            u32::try_from(self.max_replicas).map_err(|e| corrupt(format!("max_replicas: {e}")))?;

        Ok(ServingEndpoint {
            id,
            name: self.name,
            route: self.route,
            namespace: self.namespace,
            serving_framework,
            desired: DesiredState {
                deployment_spec,
                runtime_image: self.runtime_image,
                min_replicas,
                max_replicas,
                autoscale_policy,
            },
            status,
            status_message: self.status_message,
            last_resource_ref: self.last_resource_ref,
            last_health_check_at: self.last_health_check_at,
            backup_config,
            resource_version: self.resource_version,
            created_by: self.created_by,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

fn to_json<T: serde::Serialize>(value: &T) -> StoreResult<serde_json::Value> {
    serde_json::to_value(value).map_err(|e| StoreError::Unavailable(format!("encode: {e}")))
}

/// Endpoint store backed by the serving_endpoints table.
#[derive(Clone)]
pub struct PgEndpointStore {
    pool: PgPool,
}

impl PgEndpointStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn fetch_for_update(
        tx: &mut Transaction<'_, Postgres>,
        id: &EndpointId,
    ) -> StoreResult<ServingEndpoint> {
        let sql = format!("SELECT {COLUMNS} FROM serving_endpoints WHERE id = $1 FOR UPDATE");
        let row: Option<EndpointRow> = sqlx::query_as(&sql)
            .bind(id.to_string())
            .fetch_optional(&mut **tx)
            .await?;
        row.ok_or(StoreError::NotFound(*id))?.into_endpoint()
    }

    /// Write back every mutable column, bumping the version.
    async fn write_back(
        tx: &mut Transaction<'_, Postgres>,
        endpoint: &ServingEndpoint,
    ) -> StoreResult<ServingEndpoint> {
        let backup = endpoint.backup_config.as_ref().map(to_json).transpose()?;
        let sql = format!(
            r#"
            UPDATE serving_endpoints SET
                serving_framework = $2,
                deployment_spec = $3,
                runtime_image = $4,
                min_replicas = $5,
                max_replicas = $6,
                autoscale_policy = $7,
                status = $8,
                status_message = $9,
                last_resource_ref = $10,
                last_health_check_at = $11,
                backup_config = $12,
                resource_version = resource_version + 1,
                updated_at = now()
            WHERE id = $1
            RETURNING {COLUMNS}
            "#
        );
        let row: EndpointRow = sqlx::query_as(&sql)
            .bind(endpoint.id.to_string())
            .bind(endpoint.serving_framework.as_str())
            .bind(to_json(&endpoint.desired.deployment_spec)?)
            .bind(&endpoint.desired.runtime_image)
            .bind(i64::from(endpoint.desired.min_replicas))
            .bind(i64::from(endpoint.desired.max_replicas))
            .bind(to_json(&endpoint.desired.autoscale_policy)?)
            .bind(endpoint.status.as_str())
            .bind(&endpoint.status_message)
            .bind(&endpoint.last_resource_ref)
            .bind(endpoint.last_health_check_at)
            .bind(backup)
            .fetch_one(&mut **tx)
            .await?;
        row.into_endpoint()
    }

    async fn update<F>(&self, id: &EndpointId, apply: F) -> StoreResult<ServingEndpoint>
    where
        F: FnOnce(&mut ServingEndpoint) + Send,
    {
        let mut tx = self.pool.begin().await?;
        let mut endpoint = Self::fetch_for_update(&mut tx, id).await?;
        apply(&mut endpoint);
        let updated = Self::write_back(&mut tx, &endpoint).await?;
        tx.commit().await?;
        Ok(updated)
    }

    async fn exists(&self, id: &EndpointId) -> StoreResult<bool> {
        let row = sqlx::query("SELECT 1 FROM serving_endpoints WHERE id = $1")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }
}

#[async_trait]
impl EndpointStore for PgEndpointStore {
    async fn insert(&self, endpoint: &ServingEndpoint) -> StoreResult<()> {
        let backup = endpoint.backup_config.as_ref().map(to_json).transpose()?;
        sqlx::query(
            r#"
            INSERT INTO serving_endpoints (
                id, name, route, namespace, serving_framework,
                deployment_spec, runtime_image, min_replicas, max_replicas, autoscale_policy,
                status, status_message, last_resource_ref, last_health_check_at,
                backup_config, resource_version, created_by, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19)
            "#,
        )
        .bind(endpoint.id.to_string())
        .bind(&endpoint.name)
        .bind(&endpoint.route)
        .bind(&endpoint.namespace)
        .bind(endpoint.serving_framework.as_str())
        .bind(to_json(&endpoint.desired.deployment_spec)?)
        .bind(&endpoint.desired.runtime_image)
        .bind(i64::from(endpoint.desired.min_replicas))
        .bind(i64::from(endpoint.desired.max_replicas))
        .bind(to_json(&endpoint.desired.autoscale_policy)?)
        .bind(endpoint.status.as_str())
        .bind(&endpoint.status_message)
        .bind(&endpoint.last_resource_ref)
        .bind(endpoint.last_health_check_at)
        .bind(backup)
        .bind(endpoint.resource_version)
        .bind(&endpoint.created_by)
        .bind(endpoint.created_at)
        .bind(endpoint.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if let sqlx::Error::Database(ref db_err) = e {
                if db_err.code().as_deref() == Some("23505") {
                    if db_err.constraint() == Some(ROUTE_CONSTRAINT) {
                        return StoreError::RouteTaken(endpoint.route.clone());
                    }
                    return StoreError::AlreadyExists(endpoint.id);
                }
            }
            StoreError::Database(e)
        })?;
        Ok(())
    }

    async fn get(&self, id: &EndpointId) -> StoreResult<Option<ServingEndpoint>> {
        let sql = format!("SELECT {COLUMNS} FROM serving_endpoints WHERE id = $1");
        let row: Option<EndpointRow> = sqlx::query_as(&sql)
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.map(EndpointRow::into_endpoint).transpose()
    }

    async fn list(&self) -> StoreResult<Vec<ServingEndpoint>> {
        let sql = format!("SELECT {COLUMNS} FROM serving_endpoints ORDER BY created_at, id");
        let rows: Vec<EndpointRow> = sqlx::query_as(&sql).fetch_all(&self.pool).await?;
        rows.into_iter().map(EndpointRow::into_endpoint).collect()
    }

    async fn acquire_lock(
        &self,
        id: &EndpointId,
        expected_version: i64,
        lock: EndpointStatus,
        backup: &DesiredState,
    ) -> StoreResult<Option<ServingEndpoint>> {
        let sql = format!(
            r#"
            UPDATE serving_endpoints SET
                status = $3,
                backup_config = $4,
                resource_version = resource_version + 1,
                updated_at = now()
            WHERE id = $1
              AND resource_version = $2
              AND status NOT IN ('deploying', 'terminating')
            RETURNING {COLUMNS}
            "#
        );
        let row: Option<EndpointRow> = sqlx::query_as(&sql)
            .bind(id.to_string())
            .bind(expected_version)
            .bind(lock.as_str())
            .bind(to_json(backup)?)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => Ok(Some(row.into_endpoint()?)),
            None if self.exists(id).await? => Ok(None),
            None => Err(StoreError::NotFound(*id)),
        }
    }

    async fn commit(
        &self,
        id: &EndpointId,
        desired: &DesiredState,
        framework: ServingFramework,
        resource_ref: Option<&str>,
    ) -> StoreResult<ServingEndpoint> {
        let desired = desired.clone();
        let resource_ref = resource_ref.map(str::to_string);
        self.update(id, move |row| {
            row.desired = desired;
            row.serving_framework = framework;
            row.last_resource_ref = resource_ref;
            row.backup_config = None;
            row.status_message = None;
        })
        .await
    }

    async fn roll_back(&self, id: &EndpointId, message: &str) -> StoreResult<ServingEndpoint> {
        let message = message.to_string();
        self.update(id, move |row| {
            if let Some(backup) = &row.backup_config {
                row.desired = backup.clone();
            }
            row.status = EndpointStatus::Failed;
            row.status_message = Some(message);
        })
        .await
    }

    async fn release(
        &self,
        id: &EndpointId,
        status: EndpointStatus,
        checked_at: Option<DateTime<Utc>>,
    ) -> StoreResult<ServingEndpoint> {
        self.update(id, move |row| {
            row.status = status;
            if checked_at.is_some() {
                row.last_health_check_at = checked_at;
            }
        })
        .await
    }

    async fn record_observation(
        &self,
        id: &EndpointId,
        expected_version: i64,
        status: EndpointStatus,
        checked_at: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE serving_endpoints SET
                status = $3,
                last_health_check_at = $4,
                resource_version = resource_version + 1,
                updated_at = now()
            WHERE id = $1 AND resource_version = $2
            "#,
        )
        .bind(id.to_string())
        .bind(expected_version)
        .bind(status.as_str())
        .bind(checked_at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn remove(&self, id: &EndpointId) -> StoreResult<()> {
        sqlx::query("DELETE FROM serving_endpoints WHERE id = $1")
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
