use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use mserve_reconcile::Backoff;

use crate::db::DbConfig;
use crate::serving::confirm::ConfirmConfig;
use crate::serving::create::CreateConfig;
use crate::serving::model::{AutoscalePolicy, ScaleMetric, ServeTarget, ServingFramework};
use crate::serving::resolve::{RuntimeImages, SpecDefaults};
use crate::serving::status::StatusConfig;
use crate::serving::worker::StatusSyncWorkerConfig;
use crate::serving::ReconcilerConfig;

/// Where cluster calls go.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClusterBackend {
    Kubernetes,
    Memory,
}

/// Where endpoint rows and audit events are stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    Postgres,
    Memory,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub listen_addr: SocketAddr,
    pub log_level: String,
    pub dev_mode: bool,
    pub database: DbConfig,
    pub store: StoreBackend,
    pub cluster: ClusterBackend,
    /// Base URL of the model catalog. Without one, only an empty in-memory
    /// catalog is available.
    pub catalog_url: Option<String>,
    pub reconciler: ReconcilerConfig,
    pub sync_worker: StatusSyncWorkerConfig,
    pub shutdown_timeout: Duration,
    /// How long shutdown waits for in-flight deploys, redeploys and deletes.
    pub drain_timeout: Duration,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let listen_addr = std::env::var("MSERVE_LISTEN_ADDR")
            .unwrap_or_else(|_| "127.0.0.1:8080".to_string())
            .parse()?;

        let log_level = std::env::var("MSERVE_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        let dev_mode = std::env::var("MSERVE_DEV")
            .map(|v| v == "1" || v.to_lowercase() == "true")
            .unwrap_or(false);

        let store = match std::env::var("MSERVE_STORE").as_deref() {
            Ok("memory") => StoreBackend::Memory,
            Ok("postgres") | Err(_) => StoreBackend::Postgres,
            Ok(other) => bail!("MSERVE_STORE must be postgres or memory, got {other:?}"),
        };

        let cluster = match std::env::var("MSERVE_CLUSTER_BACKEND").as_deref() {
            Ok("memory") => ClusterBackend::Memory,
            Ok("kubernetes") | Err(_) => ClusterBackend::Kubernetes,
            Ok(other) => bail!("MSERVE_CLUSTER_BACKEND must be kubernetes or memory, got {other:?}"),
        };

        let catalog_url = std::env::var("MSERVE_CATALOG_URL")
            .ok()
            .filter(|s| !s.trim().is_empty());

        let sync_worker = StatusSyncWorkerConfig {
            interval: secs("MSERVE_STATUS_SYNC_INTERVAL_SECS")?
                .unwrap_or(StatusSyncWorkerConfig::default().interval),
        };

        let shutdown_timeout =
            secs("MSERVE_SHUTDOWN_TIMEOUT_SECS")?.unwrap_or(Duration::from_secs(10));
        let drain_timeout =
            secs("MSERVE_DRAIN_TIMEOUT_SECS")?.unwrap_or(Duration::from_secs(300));

        Ok(Self {
            listen_addr,
            log_level,
            dev_mode,
            database: database_from_env()?,
            store,
            cluster,
            catalog_url,
            reconciler: reconciler_from_env()?,
            sync_worker,
            shutdown_timeout,
            drain_timeout,
        })
    }
}

fn database_from_env() -> Result<DbConfig> {
    let d = DbConfig::default();
    Ok(DbConfig {
        database_url: std::env::var("DATABASE_URL").unwrap_or(d.database_url),
        max_connections: parse("MSERVE_DB_MAX_CONNECTIONS")?.unwrap_or(d.max_connections),
        min_connections: parse("MSERVE_DB_MIN_CONNECTIONS")?.unwrap_or(d.min_connections),
        acquire_timeout: secs("MSERVE_DB_ACQUIRE_TIMEOUT_SECS")?.unwrap_or(d.acquire_timeout),
        migrations_dir: std::env::var_os("MSERVE_MIGRATIONS_DIR").map(Into::into),
        ..d
    })
}

fn reconciler_from_env() -> Result<ReconcilerConfig> {
    let defaults = ReconcilerConfig::default();

    let confirm = ConfirmConfig {
        poll_interval: secs("MSERVE_POLL_INTERVAL_SECS")?.unwrap_or(defaults.confirm.poll_interval),
        stall_threshold: secs("MSERVE_STALL_THRESHOLD_SECS")?
            .unwrap_or(defaults.confirm.stall_threshold),
    };

    let backoff = Backoff::new(
        millis("MSERVE_CREATE_BACKOFF_BASE_MS")?.unwrap_or(Duration::from_secs(1)),
        millis("MSERVE_CREATE_BACKOFF_MAX_MS")?.unwrap_or(Duration::from_secs(16)),
    )
    .with_jitter(parse("MSERVE_CREATE_BACKOFF_JITTER")?.unwrap_or(true));
    let create = CreateConfig {
        max_attempts: parse("MSERVE_CREATE_MAX_ATTEMPTS")?.unwrap_or(defaults.create.max_attempts),
        backoff,
        timeout: secs("MSERVE_CREATE_TIMEOUT_SECS")?.unwrap_or(defaults.create.timeout),
        conflict_delete_timeout: secs("MSERVE_CONFLICT_DELETE_TIMEOUT_SECS")?
            .unwrap_or(defaults.create.conflict_delete_timeout),
    };

    let status = StatusConfig {
        crash_loop_restart_threshold: parse("MSERVE_CRASH_LOOP_RESTARTS")?
            .unwrap_or(defaults.status.crash_loop_restart_threshold),
    };

    let default_framework = match std::env::var("MSERVE_DEFAULT_FRAMEWORK") {
        Ok(value) => ServingFramework::from_str(&value)
            .map_err(|e| anyhow::anyhow!(e))
            .context("MSERVE_DEFAULT_FRAMEWORK")?,
        Err(_) => defaults.default_framework,
    };

    Ok(ReconcilerConfig {
        default_namespace: std::env::var("MSERVE_NAMESPACE")
            .unwrap_or(defaults.default_namespace),
        default_framework,
        confirm,
        create,
        deletion_timeout: secs("MSERVE_DELETION_TIMEOUT_SECS")?
            .unwrap_or(defaults.deletion_timeout),
        confirm_create_timeout: secs("MSERVE_CONFIRM_CREATE_TIMEOUT_SECS")?
            .unwrap_or(defaults.confirm_create_timeout),
        status,
        unlock_grace: secs("MSERVE_UNLOCK_GRACE_SECS")?.unwrap_or(defaults.unlock_grace),
        spec_defaults: spec_defaults_from_env()?,
        runtime_images: runtime_images_from_env(),
    })
}

fn spec_defaults_from_env() -> Result<SpecDefaults> {
    let d = SpecDefaults::default();

    let serve_target = match std::env::var("MSERVE_DEFAULT_SERVE_TARGET") {
        Ok(value) => ServeTarget::from_str(&value)
            .map_err(|e| anyhow::anyhow!(e))
            .context("MSERVE_DEFAULT_SERVE_TARGET")?,
        Err(_) => d.serve_target,
    };
    let metric = match std::env::var("MSERVE_DEFAULT_SCALE_METRIC") {
        Ok(value) => ScaleMetric::from_str(&value)
            .map_err(|e| anyhow::anyhow!(e))
            .context("MSERVE_DEFAULT_SCALE_METRIC")?,
        Err(_) => d.autoscale_policy.metric,
    };

    Ok(SpecDefaults {
        serve_target,
        use_gpu: parse("MSERVE_DEFAULT_USE_GPU")?.unwrap_or(d.use_gpu),
        gpu_count: parse("MSERVE_DEFAULT_GPU_COUNT")?.unwrap_or(d.gpu_count),
        gpu_memory_gb: parse("MSERVE_DEFAULT_GPU_MEMORY_GB")?.unwrap_or(d.gpu_memory_gb),
        cpu: std::env::var("MSERVE_DEFAULT_CPU").unwrap_or(d.cpu),
        memory: std::env::var("MSERVE_DEFAULT_MEMORY").unwrap_or(d.memory),
        max_concurrent_requests: parse("MSERVE_DEFAULT_MAX_CONCURRENT_REQUESTS")?
            .unwrap_or(d.max_concurrent_requests),
        max_input_tokens: parse("MSERVE_DEFAULT_MAX_INPUT_TOKENS")?.unwrap_or(d.max_input_tokens),
        max_output_tokens: parse("MSERVE_DEFAULT_MAX_OUTPUT_TOKENS")?
            .unwrap_or(d.max_output_tokens),
        min_replicas: parse("MSERVE_DEFAULT_MIN_REPLICAS")?.unwrap_or(d.min_replicas),
        max_replicas: parse("MSERVE_DEFAULT_MAX_REPLICAS")?.unwrap_or(d.max_replicas),
        autoscale_policy: AutoscalePolicy {
            metric,
            target: parse("MSERVE_DEFAULT_SCALE_TARGET")?.unwrap_or(d.autoscale_policy.target),
        },
    })
}

fn runtime_images_from_env() -> RuntimeImages {
    let d = RuntimeImages::default();
    let image = |key: &str, fallback: String| std::env::var(key).unwrap_or(fallback);
    RuntimeImages {
        vllm_gpu: image("MSERVE_IMAGE_VLLM_GPU", d.vllm_gpu),
        vllm_cpu: image("MSERVE_IMAGE_VLLM_CPU", d.vllm_cpu),
        tgi_gpu: image("MSERVE_IMAGE_TGI_GPU", d.tgi_gpu),
        tgi_cpu: image("MSERVE_IMAGE_TGI_CPU", d.tgi_cpu),
        triton_gpu: image("MSERVE_IMAGE_TRITON_GPU", d.triton_gpu),
        triton_cpu: image("MSERVE_IMAGE_TRITON_CPU", d.triton_cpu),
    }
}

/// Parse an optional variable; a present but malformed value is an error.
fn parse<T>(key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| anyhow::anyhow!("{key}={raw:?}: {e}")),
        Err(_) => Ok(None),
    }
}

fn secs(key: &str) -> Result<Option<Duration>> {
    Ok(parse::<u64>(key)?.map(Duration::from_secs))
}

fn millis(key: &str) -> Result<Option<Duration>> {
    Ok(parse::<u64>(key)?.map(Duration::from_millis))
}
