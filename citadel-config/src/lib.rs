//! Ambient configuration surface (spec §6) plus the logging/metrics
//! bootstrap every binary built on top of citadel should run once at
//! startup.

use std::time::Duration;

use clap::Parser;
use serde::{Deserialize, Serialize};

/// `{landThreads=4, landIntervalMs=25, batchSize=400, maxRetries=3,
/// backlogThreshold, idleThreshold}` from spec §6.
#[derive(Parser, Debug, Clone, Serialize, Deserialize)]
pub struct WritebackConfig {
    #[arg(long, env = "LAND_THREADS", default_value = "4")]
    pub land_threads: usize,

    #[arg(long, env = "LAND_INTERVAL_MS", default_value = "25")]
    pub land_interval_ms: u64,

    #[arg(long, env = "BATCH_SIZE", default_value = "400")]
    pub batch_size: usize,

    #[arg(long, env = "MAX_RETRIES", default_value = "3")]
    pub max_retries: u32,

    /// Queue depth above which a worker enters BACKLOG state.
    #[arg(long, env = "BACKLOG_THRESHOLD", default_value = "2000")]
    pub backlog_threshold: usize,

    /// Queue depth below which a worker enters IDLE state.
    #[arg(long, env = "IDLE_THRESHOLD", default_value = "10")]
    pub idle_threshold: usize,
}

impl Default for WritebackConfig {
    fn default() -> Self {
        Self {
            land_threads: 4,
            land_interval_ms: 25,
            batch_size: 400,
            max_retries: 3,
            backlog_threshold: 2000,
            idle_threshold: 10,
        }
    }
}

impl WritebackConfig {
    pub fn land_interval(&self) -> Duration {
        Duration::from_millis(self.land_interval_ms)
    }
}

/// `{backlog, readerIdleSec=60, send/recvBuf, writeLow/HighWaterMark,
/// tcpNoDelay=true, keepAlive=true, shutdownTimeoutSec=15}` from spec §6.
#[derive(Parser, Debug, Clone, Serialize, Deserialize)]
pub struct RpcServerConfig {
    #[arg(long, env = "RPC_LISTEN_BACKLOG", default_value = "1024")]
    pub backlog: u32,

    #[arg(long, env = "RPC_READER_IDLE_SEC", default_value = "60")]
    pub reader_idle_sec: u64,

    #[arg(long, env = "RPC_TCP_NODELAY", default_value = "true")]
    pub tcp_nodelay: bool,

    #[arg(long, env = "RPC_TCP_KEEPALIVE", default_value = "true")]
    pub tcp_keepalive: bool,

    #[arg(long, env = "RPC_SHUTDOWN_TIMEOUT_SEC", default_value = "15")]
    pub shutdown_timeout_sec: u64,

    /// Bound on the shared worker executor that business dispatch runs on,
    /// so no user method blocks an I/O thread.
    #[arg(long, env = "RPC_WORKER_CONCURRENCY", default_value = "256")]
    pub worker_concurrency: usize,
}

impl Default for RpcServerConfig {
    fn default() -> Self {
        Self {
            backlog: 1024,
            reader_idle_sec: 60,
            tcp_nodelay: true,
            tcp_keepalive: true,
            shutdown_timeout_sec: 15,
            worker_concurrency: 256,
        }
    }
}

impl RpcServerConfig {
    pub fn reader_idle(&self) -> Duration {
        Duration::from_secs(self.reader_idle_sec)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_sec)
    }
}

/// `{timeoutMs=10000, retries=1, connectTimeoutMs=3000, maxConnPerAddr=10}`
/// from spec §6.
#[derive(Parser, Debug, Clone, Serialize, Deserialize)]
pub struct RpcClientConfig {
    #[arg(long, env = "RPC_TIMEOUT_MS", default_value = "10000")]
    pub timeout_ms: u64,

    #[arg(long, env = "RPC_RETRIES", default_value = "1")]
    pub retries: u32,

    #[arg(long, env = "RPC_CONNECT_TIMEOUT_MS", default_value = "3000")]
    pub connect_timeout_ms: u64,

    #[arg(long, env = "RPC_MAX_CONN_PER_ADDR", default_value = "10")]
    pub max_conn_per_addr: usize,
}

impl Default for RpcClientConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 10_000,
            retries: 1,
            connect_timeout_ms: 3_000,
            max_conn_per_addr: 10,
        }
    }
}

impl RpcClientConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

/// Discovery/registry config (spec §4.7/§6): a consul address, the root
/// path every serviceKey is registered under, and the drain window a
/// graceful unregister waits out between flipping to DRAINING and deleting
/// the node.
#[derive(Parser, Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    #[arg(long, env = "CONSUL_ADDR", default_value = "127.0.0.1:8500")]
    pub consul_addr: String,

    #[arg(long, env = "DISCOVERY_ROOT", default_value = "/rpc")]
    pub root: String,

    #[arg(long, env = "DISCOVERY_DRAIN_MS", default_value = "5000")]
    pub drain_ms: u64,

    /// TTL of the consul session an ephemeral registration is bound to;
    /// the session is renewed on a fraction of this interval so the node
    /// survives normal operation but disappears soon after a crash.
    #[arg(long, env = "DISCOVERY_SESSION_TTL_SEC", default_value = "10")]
    pub session_ttl_sec: u64,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            consul_addr: "127.0.0.1:8500".to_string(),
            root: "/rpc".to_string(),
            drain_ms: 5000,
            session_ttl_sec: 10,
        }
    }
}

impl DiscoveryConfig {
    pub fn drain_time(&self) -> Duration {
        Duration::from_millis(self.drain_ms)
    }

    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session_ttl_sec)
    }
}

/// Gate session/router config (spec §4.8): mostly sizing knobs for the
/// per-connection session registry and the migration deadline the gate
/// hands off to `citadel-migration`.
#[derive(Parser, Debug, Clone, Serialize, Deserialize)]
pub struct GateConfig {
    #[arg(long, env = "GATE_LISTEN_BACKLOG", default_value = "1024")]
    pub backlog: u32,

    #[arg(long, env = "GATE_SESSION_IDLE_SEC", default_value = "300")]
    pub session_idle_sec: u64,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self { backlog: 1024, session_idle_sec: 300 }
    }
}

impl GateConfig {
    pub fn session_idle(&self) -> Duration {
        Duration::from_secs(self.session_idle_sec)
    }
}

/// Migration coordinator config (spec §4.9): the overall deadline wrapping
/// a WORLD/GAME/FULL migration, after which any in-flight step rolls back.
#[derive(Parser, Debug, Clone, Serialize, Deserialize)]
pub struct MigrationConfig {
    #[arg(long, env = "MIGRATION_DEADLINE_SEC", default_value = "30")]
    pub deadline_sec: u64,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self { deadline_sec: 30 }
    }
}

impl MigrationConfig {
    pub fn deadline(&self) -> Duration {
        Duration::from_secs(self.deadline_sec)
    }
}

/// Aggregates every component config behind one top-level `clap::Parser`,
/// the same way the teacher's `readyset::Options` flattens
/// `WorkerOptions`/`psql::Options` into a single binary entry point.
#[derive(Parser, Debug, Clone)]
pub struct CitadelConfig {
    #[command(flatten)]
    pub writeback: WritebackConfig,
    #[command(flatten)]
    pub rpc_server: RpcServerConfig,
    #[command(flatten)]
    pub rpc_client: RpcClientConfig,
    #[command(flatten)]
    pub discovery: DiscoveryConfig,
    #[command(flatten)]
    pub gate: GateConfig,
    #[command(flatten)]
    pub migration: MigrationConfig,
    #[command(flatten)]
    pub tracing: TracingOptions,
}

/// Tracing/logging bootstrap options, flattened into a binary's top-level
/// `clap::Parser` the same way the teacher flattens `readyset_tracing::Options`.
#[derive(Parser, Debug, Clone, Default)]
pub struct TracingOptions {
    /// Overrides `RUST_LOG` if set; otherwise falls back to `info`.
    #[arg(long, env = "LOG_FILTER")]
    pub log_filter: Option<String>,
}

impl TracingOptions {
    /// Installs a global `tracing_subscriber` fmt layer with an `EnvFilter`.
    /// Call once, at process start.
    pub fn init(&self) {
        let filter = self
            .log_filter
            .clone()
            .or_else(|| std::env::var("RUST_LOG").ok())
            .unwrap_or_else(|| "info".to_string());

        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::new(filter))
            .try_init();
    }
}

/// Installs a process-global Prometheus metrics recorder. Returns the handle
/// used to render `/metrics` responses. Idempotent calls after the first are
/// logged and ignored.
pub fn install_prometheus_recorder() -> Option<metrics_exporter_prometheus::PrometheusHandle> {
    match metrics_exporter_prometheus::PrometheusBuilder::new().install_recorder() {
        Ok(handle) => Some(handle),
        Err(error) => {
            tracing::warn!(%error, "failed to install prometheus recorder");
            None
        }
    }
}
