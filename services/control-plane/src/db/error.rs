use thiserror::Error;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("failed to connect to database: {0}")]
    Connect(#[source] sqlx::Error),

    #[error("query failed: {0}")]
    Query(#[source] sqlx::Error),

    #[error("migration failed: {0}")]
    Migration(#[source] sqlx::migrate::MigrateError),

    /// Set MSERVE_MIGRATIONS_DIR or run from the repo root.
    #[error("no migrations directory found (tried {tried})")]
    MigrationDirNotFound { tried: String },
}
