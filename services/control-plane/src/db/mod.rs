//! Postgres persistence.
//!
//! One pool backs both the endpoint store (`serving_endpoints`) and the
//! audit sink (`audit_events`). Queries are checked at runtime; the schema
//! lives in `services/control-plane/migrations`.

mod audit;
mod endpoints;
mod error;

pub use audit::PgAuditSink;
pub use endpoints::PgEndpointStore;
pub use error::DbError;

use std::path::{Path, PathBuf};
use std::time::Duration;

use sqlx::migrate::Migrator;
use sqlx::postgres::{PgPool, PgPoolOptions};
use tracing::{debug, info};

/// Connection pool settings.
#[derive(Debug, Clone)]
pub struct DbConfig {
    pub database_url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    /// How long a query waits for a free connection.
    pub acquire_timeout: Duration,
    pub idle_timeout: Duration,
    pub max_lifetime: Duration,
    /// Overrides the migrations directory search.
    pub migrations_dir: Option<PathBuf>,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            database_url: "postgres://localhost/mserve".to_string(),
            max_connections: 10,
            min_connections: 1,
            acquire_timeout: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(600),
            max_lifetime: Duration::from_secs(1800),
            migrations_dir: None,
        }
    }
}

#[derive(Clone)]
pub struct Database {
    pool: PgPool,
    migrations_dir: Option<PathBuf>,
}

impl Database {
    pub async fn connect(config: &DbConfig) -> Result<Self, DbError> {
        info!(
            max_connections = config.max_connections,
            min_connections = config.min_connections,
            "Connecting to database"
        );

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(config.acquire_timeout)
            .idle_timeout(Some(config.idle_timeout))
            .max_lifetime(Some(config.max_lifetime))
            .connect(&config.database_url)
            .await
            .map_err(DbError::Connect)?;

        Ok(Self {
            pool,
            migrations_dir: config.migrations_dir.clone(),
        })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Round-trip a trivial query; backs `/readyz`.
    pub async fn health_check(&self) -> Result<(), DbError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(DbError::Query)?;
        Ok(())
    }

    /// Apply pending migrations. Only dev mode calls this; deployments run
    /// migrations out of band.
    pub async fn run_migrations(&self) -> Result<(), DbError> {
        let dir = self.find_migrations()?;
        info!(migrations_dir = %dir.display(), "Running database migrations");

        let migrator = Migrator::new(dir.clone())
            .await
            .map_err(DbError::Migration)?;
        migrator.run(&self.pool).await.map_err(DbError::Migration)?;

        info!("Database migrations complete");
        Ok(())
    }

    fn find_migrations(&self) -> Result<PathBuf, DbError> {
        let candidates: Vec<PathBuf> = match &self.migrations_dir {
            Some(dir) => vec![dir.clone()],
            None => vec![
                PathBuf::from("migrations"),
                PathBuf::from("services/control-plane/migrations"),
                Path::new(env!("CARGO_MANIFEST_DIR")).join("migrations"),
            ],
        };

        for dir in &candidates {
            if dir.is_dir() {
                return Ok(dir.clone());
            }
            debug!(candidate = %dir.display(), "No migrations here");
        }

        Err(DbError::MigrationDirNotFound {
            tried: candidates
                .iter()
                .map(|d| d.display().to_string())
                .collect::<Vec<_>>()
                .join(", "),
        })
    }

    pub fn endpoint_store(&self) -> PgEndpointStore {
        PgEndpointStore::new(self.pool.clone())
    }

    pub fn audit_sink(&self) -> PgAuditSink {
        PgAuditSink::new(self.pool.clone())
    }
}
