//! Postgres audit sink.

use mserve_events::AuditEvent;
use sqlx::postgres::PgPool;
use tracing::{debug, warn};

use crate::serving::audit::AuditSink;

/// Inserts audit events into the audit_events table from a spawned task.
#[derive(Clone)]
pub struct PgAuditSink {
    pool: PgPool,
}

impl PgAuditSink {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn insert(pool: &PgPool, event: &AuditEvent) -> Result<i64, sqlx::Error> {
        let payload = serde_json::to_value(&event.payload)
            .map_err(|e| sqlx::Error::Encode(Box::new(e)))?;
        sqlx::query_scalar(
            r#"
            INSERT INTO audit_events (
                occurred_at, endpoint_id, event_type, actor_type, actor_id, request_id, payload
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING event_id
            "#,
        )
        .bind(event.occurred_at)
        .bind(event.endpoint_id.to_string())
        .bind(event.event_type())
        .bind(event.actor.actor_type.to_string())
        .bind(&event.actor.actor_id)
        .bind(event.request_id.map(|id| id.to_string()))
        .bind(payload)
        .fetch_one(pool)
        .await
    }
}

impl AuditSink for PgAuditSink {
    fn emit(&self, event: AuditEvent) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!(endpoint_id = %event.endpoint_id, "No runtime to record audit event; dropping");
            return;
        };
        let pool = self.pool.clone();
        handle.spawn(async move {
            match Self::insert(&pool, &event).await {
                Ok(event_id) => debug!(event_id, endpoint_id = %event.endpoint_id, "Audit event stored"),
                Err(e) => warn!(
                    error = %e,
                    endpoint_id = %event.endpoint_id,
                    event_type = event.event_type(),
                    "Failed to store audit event"
                ),
            }
        });
    }
}
