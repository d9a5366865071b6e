//! Dispatcher configuration, loaded from CLI flags with environment-variable
//! fallbacks, mirroring `rsky-ingester`'s `IngesterConfig` /
//! `load_config()` split between a plain struct and a CLI-parsing binary.

use clap::Parser;

/// Environment scoping string prefixed onto every Redis key and channel
/// name. Empty by default.
fn default_prefix() -> String {
    String::new()
}

/// Runtime configuration for a dispatcher process.
#[derive(Debug, Clone, Parser)]
#[command(name = "dispatcher")]
#[command(about = "rsky-dispatcher - Redis-backed event dispatcher")]
pub struct DispatcherConfig {
    /// Redis connection string.
    #[arg(long, env = "REDIS_URL", default_value = "redis://localhost:6379")]
    pub redis_url: String,

    /// Environment scoping prefix for every Redis key and channel.
    #[arg(long, env = "DISPATCHER_PREFIX", default_value = "")]
    pub prefix: String,

    /// Ping cadence, in milliseconds.
    #[arg(long, env = "PING_INTERVAL_MS", default_value_t = 300_000)]
    pub ping_interval_ms: u64,

    /// Eviction-scan cadence, in milliseconds.
    #[arg(long, env = "CHECK_LAST_ACTIVITY_INTERVAL_MS", default_value_t = 120_000)]
    pub check_last_activity_interval_ms: u64,

    /// Reconciliation cadence, in milliseconds.
    #[arg(long, env = "CHECK_TRANSACTION_INTERVAL_MS", default_value_t = 180_000)]
    pub check_transaction_interval_ms: u64,

    /// Activity threshold past which an incomer (or active dispatcher) is
    /// considered dead, in milliseconds.
    #[arg(long, env = "IDLE_TIME_MS", default_value_t = 600_000)]
    pub idle_time_ms: u64,

    /// This dispatcher process's `selfProvidedUUID` / `baseUUID`.
    #[arg(long, env = "INCOMER_UUID")]
    pub incomer_uuid: Option<String>,

    /// Group key for leader election among dispatcher replicas.
    #[arg(long, env = "INSTANCE_NAME", default_value = "dispatcher")]
    pub instance_name: String,

    /// Lower bound of the leader-election jitter window, in milliseconds.
    #[arg(long, env = "MIN_TIMEOUT_MS", default_value_t = 0)]
    pub min_timeout_ms: u64,

    /// Upper bound of the leader-election jitter window, in milliseconds.
    #[arg(long, env = "MAX_TIMEOUT_MS", default_value_t = 60_000)]
    pub max_timeout_ms: u64,

    /// Port the Prometheus `/metrics` endpoint binds on.
    #[arg(long, env = "METRICS_PORT", default_value_t = 9090)]
    pub metrics_port: u16,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            redis_url: "redis://localhost:6379".to_string(),
            prefix: default_prefix(),
            ping_interval_ms: 300_000,
            check_last_activity_interval_ms: 120_000,
            check_transaction_interval_ms: 180_000,
            idle_time_ms: 600_000,
            incomer_uuid: None,
            instance_name: "dispatcher".to_string(),
            min_timeout_ms: 0,
            max_timeout_ms: 60_000,
            metrics_port: 9090,
        }
    }
}

impl DispatcherConfig {
    pub fn dispatcher_channel(&self) -> String {
        format!("{}dispatcher", self.prefix)
    }

    pub fn incomer_channel(&self, provided_uuid: &str) -> String {
        format!("{}{}", self.prefix, provided_uuid)
    }

    pub fn dispatcher_transaction_key(&self) -> String {
        format!("{}dispatcher-transaction", self.prefix)
    }

    pub fn incomer_transaction_key(&self, incomer_uuid: &str) -> String {
        format!("{}{}-incomer-transaction", self.prefix, incomer_uuid)
    }

    pub fn backup_dispatcher_transaction_key(&self) -> String {
        format!("{}backup-dispatcher-transaction", self.prefix)
    }

    pub fn backup_incomer_transaction_key(&self) -> String {
        format!("{}backup-incomer-transaction", self.prefix)
    }

    pub fn incomer_registry_key(&self) -> String {
        format!("{}incomer", self.prefix)
    }
}
