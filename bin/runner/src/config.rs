//! Centralized runner configuration.
//!
//! Loaded via the `config` crate from environment variables, with `__`
//! separating sections from keys (`ROUTER__POLL_INTERVAL_MS=250`).

use conveyor_engine::{NatsConfig, ReaperConfig, ReconcilerConfig, RouterConfig};
use serde::Deserialize;
use std::net::SocketAddr;
use std::time::Duration;

/// Runner configuration composed from the engine's loop configs.
#[derive(Debug, Deserialize)]
pub struct RunnerConfig {
    /// PostgreSQL database connection URL.
    pub database_url: String,

    /// Maximum connections in the database pool.
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Event router tuning.
    #[serde(default)]
    pub router: RouterSection,

    /// Queue worker tuning.
    #[serde(default)]
    pub worker: WorkerSection,

    /// Outbox reconciler tuning.
    #[serde(default)]
    pub reconciler: ReconcilerSection,

    /// Execution reaper tuning.
    #[serde(default)]
    pub reaper: ReaperSection,

    /// NATS JetStream transport.
    pub nats: NatsSection,

    /// HTTP intake.
    #[serde(default)]
    pub http: HttpSection,
}

fn default_max_connections() -> u32 {
    5
}

/// Router settings.
#[derive(Debug, Clone, Deserialize)]
pub struct RouterSection {
    /// Whether this process runs a router loop.
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Delay between polls for pending events, in milliseconds.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Maximum events claimed per poll.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// How long a claim keeps other routers away, in seconds.
    #[serde(default = "default_claim_lease_seconds")]
    pub claim_lease_seconds: u64,
}

fn default_enabled() -> bool {
    true
}

fn default_poll_interval_ms() -> u64 {
    500
}

fn default_batch_size() -> usize {
    100
}

fn default_claim_lease_seconds() -> u64 {
    30
}

impl Default for RouterSection {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            poll_interval_ms: default_poll_interval_ms(),
            batch_size: default_batch_size(),
            claim_lease_seconds: default_claim_lease_seconds(),
        }
    }
}

impl RouterSection {
    /// Converts to the engine's router config.
    #[must_use]
    pub fn to_router_config(&self) -> RouterConfig {
        RouterConfig {
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            batch_size: self.batch_size,
            claim_lease: Duration::from_secs(self.claim_lease_seconds),
        }
    }
}

/// Worker settings.
#[derive(Debug, Clone, Deserialize)]
pub struct WorkerSection {
    /// Whether this process consumes queue items.
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Deliveries processed at once.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,

    /// How often a running execution is marked alive, in seconds. Keep it
    /// well below the reaper's stale TTL.
    #[serde(default = "default_heartbeat_seconds")]
    pub heartbeat_seconds: u64,
}

fn default_max_concurrency() -> usize {
    conveyor_engine::worker::DEFAULT_MAX_CONCURRENCY
}

fn default_heartbeat_seconds() -> u64 {
    conveyor_engine::executor::DEFAULT_HEARTBEAT.as_secs()
}

impl Default for WorkerSection {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            max_concurrency: default_max_concurrency(),
            heartbeat_seconds: default_heartbeat_seconds(),
        }
    }
}

impl WorkerSection {
    /// Heartbeat interval for running executions.
    #[must_use]
    pub fn heartbeat(&self) -> Duration {
        Duration::from_secs(self.heartbeat_seconds)
    }
}

/// Reconciler settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ReconcilerSection {
    /// Interval between sweeps, in seconds.
    #[serde(default = "default_reconciler_interval_seconds")]
    pub interval_seconds: u64,

    /// Age an unpublished queue item must reach before it is republished,
    /// in seconds.
    #[serde(default = "default_grace_period_seconds")]
    pub grace_period_seconds: u64,

    /// How long a published queue item may go without an execution before
    /// it is published again, in seconds.
    #[serde(default = "default_unexecuted_after_seconds")]
    pub unexecuted_after_seconds: u64,

    /// Maximum queue items republished per sweep.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

fn default_reconciler_interval_seconds() -> u64 {
    10
}

fn default_grace_period_seconds() -> u64 {
    30
}

fn default_unexecuted_after_seconds() -> u64 {
    10 * 60
}

impl Default for ReconcilerSection {
    fn default() -> Self {
        Self {
            interval_seconds: default_reconciler_interval_seconds(),
            grace_period_seconds: default_grace_period_seconds(),
            unexecuted_after_seconds: default_unexecuted_after_seconds(),
            batch_size: default_batch_size(),
        }
    }
}

impl ReconcilerSection {
    /// Converts to the engine's reconciler config.
    #[must_use]
    pub fn to_reconciler_config(&self) -> ReconcilerConfig {
        ReconcilerConfig {
            interval: Duration::from_secs(self.interval_seconds),
            grace_period: Duration::from_secs(self.grace_period_seconds),
            unexecuted_after: Duration::from_secs(self.unexecuted_after_seconds),
            batch_size: self.batch_size,
        }
    }
}

/// Reaper settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ReaperSection {
    /// Interval between sweeps, in seconds.
    #[serde(default = "default_reaper_interval_seconds")]
    pub interval_seconds: u64,

    /// How long an execution may wait for an action or callback, in seconds.
    #[serde(default = "default_waiting_ttl_seconds")]
    pub waiting_ttl_seconds: u64,

    /// How long a pending or running execution may go without an update,
    /// in seconds.
    #[serde(default = "default_stale_ttl_seconds")]
    pub stale_ttl_seconds: u64,

    /// Maximum executions failed per state per sweep.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

fn default_reaper_interval_seconds() -> u64 {
    60
}

fn default_waiting_ttl_seconds() -> u64 {
    24 * 60 * 60
}

fn default_stale_ttl_seconds() -> u64 {
    60 * 60
}

impl Default for ReaperSection {
    fn default() -> Self {
        Self {
            interval_seconds: default_reaper_interval_seconds(),
            waiting_ttl_seconds: default_waiting_ttl_seconds(),
            stale_ttl_seconds: default_stale_ttl_seconds(),
            batch_size: default_batch_size(),
        }
    }
}

impl ReaperSection {
    /// Converts to the engine's reaper config.
    #[must_use]
    pub fn to_reaper_config(&self) -> ReaperConfig {
        ReaperConfig {
            interval: Duration::from_secs(self.interval_seconds),
            waiting_ttl: Duration::from_secs(self.waiting_ttl_seconds),
            stale_ttl: Duration::from_secs(self.stale_ttl_seconds),
            batch_size: self.batch_size,
        }
    }
}

/// NATS settings.
#[derive(Debug, Clone, Deserialize)]
pub struct NatsSection {
    /// NATS server URL.
    pub url: String,

    /// Stream name override.
    #[serde(default)]
    pub stream_name: Option<String>,

    /// Durable consumer name override.
    #[serde(default)]
    pub consumer_name: Option<String>,

    /// How long the broker waits for an ack, in seconds.
    #[serde(default = "default_ack_wait_seconds")]
    pub ack_wait_seconds: u64,

    /// Upper bound on deliveries of one message; `-1` for no bound.
    #[serde(default = "default_max_deliver")]
    pub max_deliver: i64,

    /// Delay before a nacked message is redelivered, in milliseconds.
    #[serde(default = "default_nack_delay_ms")]
    pub nack_delay_ms: u64,
}

fn default_ack_wait_seconds() -> u64 {
    60
}

fn default_max_deliver() -> i64 {
    -1
}

fn default_nack_delay_ms() -> u64 {
    5_000
}

impl NatsSection {
    /// Converts to the engine's NATS config.
    #[must_use]
    pub fn to_nats_config(&self) -> NatsConfig {
        NatsConfig {
            url: self.url.clone(),
            stream_name: self.stream_name.clone(),
            consumer_name: self.consumer_name.clone(),
            ack_wait: Duration::from_secs(self.ack_wait_seconds),
            max_deliver: self.max_deliver,
            nack_delay: Duration::from_millis(self.nack_delay_ms),
        }
    }
}

/// HTTP intake settings.
#[derive(Debug, Clone, Deserialize)]
pub struct HttpSection {
    /// Address the intake listens on.
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 3000))
}

impl Default for HttpSection {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
        }
    }
}

impl RunnerConfig {
    /// Loads configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if required configuration is missing or invalid.
    pub fn from_env() -> Result<Self, config::ConfigError> {
        config::Config::builder()
            .add_source(
                config::Environment::default()
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()
    }
}
