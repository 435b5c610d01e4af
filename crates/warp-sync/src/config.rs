//! Syncer configuration.
//!
//! [`SyncerConfig`] is loaded in layers: built-in defaults, then an
//! optional TOML file, then `WARP_`-prefixed environment variables with
//! `__` separating nested keys (`WARP_SINK__BATCH_SIZE=500`). Durations
//! are written as milliseconds or seconds, as the key suffix says.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::path::{Path, PathBuf};
use std::time::Duration;
use warp_network::{ClientConfig, PeerMonitorConfig, RateLimitConfig};
use warp_task::{BackoffConfig, PoolConfig, TaskConfig, WatchdogConfig};

use crate::error::SyncError;
use crate::filter::FilterConfig;

/// Component name checkpoints are stored under by default.
pub const DEFAULT_COMPONENT: &str = "interactions";

mod millis {
    use super::*;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

mod secs {
    use super::*;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_secs)
    }
}

// ----------------------------------------------------------------------------
// Stage configs
// ----------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    #[serde(rename = "interval_ms", with = "millis")]
    pub interval: Duration,
    /// Most recent blocks not yet considered stable.
    pub confirmation_depth: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            confirmation_depth: 10,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BlockDownloaderConfig {
    /// Wait after a failed fetch.
    #[serde(rename = "retry_delay_ms", with = "millis")]
    pub retry_delay: Duration,
    /// Wait after a block failed validation.
    #[serde(rename = "validation_cooldown_ms", with = "millis")]
    pub validation_cooldown: Duration,
    /// Capacity of the queue towards the transaction downloader.
    pub output_capacity: usize,
}

impl Default for BlockDownloaderConfig {
    fn default() -> Self {
        Self {
            retry_delay: Duration::from_secs(1),
            validation_cooldown: Duration::from_secs(5),
            output_capacity: 10,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransactionDownloaderConfig {
    pub workers: usize,
    pub queue_capacity: usize,
    #[serde(rename = "initial_interval_ms", with = "millis")]
    pub initial_interval: Duration,
    pub multiplier: f64,
    #[serde(rename = "max_interval_ms", with = "millis")]
    pub max_interval: Duration,
    #[serde(rename = "max_elapsed_ms", with = "millis")]
    pub max_elapsed: Duration,
    /// Delay before asking again for a transaction peers do not have yet.
    #[serde(rename = "not_found_delay_ms", with = "millis")]
    pub not_found_delay: Duration,
    /// Fetch payloads that were not inlined in the transaction record.
    pub fetch_data: bool,
    /// Payloads declared larger than this are never fetched.
    pub max_data_size: u64,
    pub output_capacity: usize,
}

impl Default for TransactionDownloaderConfig {
    fn default() -> Self {
        Self {
            workers: 50,
            queue_capacity: 100,
            initial_interval: Duration::from_millis(500),
            multiplier: 2.0,
            max_interval: Duration::from_secs(10),
            max_elapsed: Duration::from_secs(60),
            not_found_delay: Duration::from_secs(1),
            fetch_data: false,
            max_data_size: 1024 * 1024,
            output_capacity: 10,
        }
    }
}

impl TransactionDownloaderConfig {
    pub fn pool(&self) -> PoolConfig {
        PoolConfig {
            workers: self.workers,
            queue_capacity: self.queue_capacity,
        }
    }

    pub fn backoff(&self) -> BackoffConfig {
        BackoffConfig {
            initial_interval: self.initial_interval,
            multiplier: self.multiplier,
            max_interval: self.max_interval,
            max_elapsed: Some(self.max_elapsed),
            max_attempts: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SinkConfig {
    /// Records per flush.
    pub batch_size: usize,
    /// Longest a non-empty buffer waits before being flushed.
    #[serde(rename = "max_time_in_queue_ms", with = "millis")]
    pub max_time_in_queue: Duration,
    /// Capacity of the queue feeding the sink.
    pub input_capacity: usize,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            batch_size: 500,
            max_time_in_queue: Duration::from_secs(1),
            input_capacity: 10,
        }
    }
}

// ----------------------------------------------------------------------------
// Network and supervision sections
// ----------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientSettings {
    pub primary: String,
    pub peers: Vec<String>,
    pub request_timeout_ms: u64,
    pub connect_timeout_ms: u64,
    pub server_error_retries: u32,
    pub failover: bool,
    pub requests_per_second: f64,
    pub burst: u32,
    pub decay_factor: f64,
    pub min_rate: f64,
}

impl Default for ClientSettings {
    fn default() -> Self {
        let client = ClientConfig::default();
        Self {
            primary: client.primary,
            peers: client.peers,
            request_timeout_ms: client.request_timeout.as_millis() as u64,
            connect_timeout_ms: client.connect_timeout.as_millis() as u64,
            server_error_retries: client.server_error_retries,
            failover: client.failover,
            requests_per_second: client.rate_limit.requests_per_second,
            burst: client.rate_limit.burst,
            decay_factor: client.rate_limit.decay_factor,
            min_rate: client.rate_limit.min_rate,
        }
    }
}

impl ClientSettings {
    pub fn client_config(&self) -> ClientConfig {
        ClientConfig {
            primary: self.primary.clone(),
            peers: self.peers.clone(),
            request_timeout: Duration::from_millis(self.request_timeout_ms),
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            server_error_retries: self.server_error_retries,
            failover: self.failover,
            rate_limit: RateLimitConfig {
                requests_per_second: self.requests_per_second,
                burst: self.burst,
                decay_factor: self.decay_factor,
                min_rate: self.min_rate,
            },
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PeerMonitorSettings {
    pub enabled: bool,
    #[serde(rename = "interval_secs", with = "secs")]
    pub interval: Duration,
    pub max_height_lag: u64,
    pub max_peers: usize,
    pub probe_concurrency: usize,
}

impl Default for PeerMonitorSettings {
    fn default() -> Self {
        let monitor = PeerMonitorConfig::default();
        Self {
            enabled: true,
            interval: monitor.interval,
            max_height_lag: monitor.max_height_lag,
            max_peers: monitor.max_peers,
            probe_concurrency: monitor.probe_concurrency,
        }
    }
}

impl PeerMonitorSettings {
    pub fn monitor_config(&self) -> PeerMonitorConfig {
        PeerMonitorConfig {
            interval: self.interval,
            max_height_lag: self.max_height_lag,
            max_peers: self.max_peers,
            probe_concurrency: self.probe_concurrency,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchdogSettings {
    #[serde(rename = "check_interval_secs", with = "secs")]
    pub check_interval: Duration,
    #[serde(rename = "rebuild_delay_ms", with = "millis")]
    pub rebuild_delay: Duration,
    #[serde(rename = "stop_timeout_ms", with = "millis")]
    pub stop_timeout: Duration,
    /// Error counter growth tolerated between two health checks.
    pub tolerance: u64,
}

impl Default for WatchdogSettings {
    fn default() -> Self {
        let watchdog = WatchdogConfig::default();
        Self {
            check_interval: watchdog.check_interval,
            rebuild_delay: watchdog.rebuild_delay,
            stop_timeout: watchdog.task.stop_timeout,
            tolerance: 20,
        }
    }
}

impl WatchdogSettings {
    pub fn task_config(&self) -> TaskConfig {
        TaskConfig {
            stop_timeout: self.stop_timeout,
        }
    }

    pub fn watchdog_config(&self) -> WatchdogConfig {
        WatchdogConfig {
            check_interval: self.check_interval,
            rebuild_delay: self.rebuild_delay,
            task: self.task_config(),
        }
    }
}

// ----------------------------------------------------------------------------
// SyncerConfig
// ----------------------------------------------------------------------------

/// Everything the syncer process needs, as loaded from file and environment.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncerConfig {
    /// Name the checkpoint is stored under.
    pub component: String,
    pub data_dir: PathBuf,
    /// First height to fetch when no checkpoint exists.
    pub start_height: u64,
    pub log_level: String,
    pub client: ClientSettings,
    pub peer_monitor: PeerMonitorSettings,
    pub monitor: MonitorConfig,
    pub blocks: BlockDownloaderConfig,
    pub transactions: TransactionDownloaderConfig,
    pub sink: SinkConfig,
    pub watchdog: WatchdogSettings,
    pub filter: FilterConfig,
}

impl Default for SyncerConfig {
    fn default() -> Self {
        let data_dir = dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("warp-syncer");

        Self {
            component: DEFAULT_COMPONENT.to_string(),
            data_dir,
            start_height: 0,
            log_level: "info".to_string(),
            client: ClientSettings::default(),
            peer_monitor: PeerMonitorSettings::default(),
            monitor: MonitorConfig::default(),
            blocks: BlockDownloaderConfig::default(),
            transactions: TransactionDownloaderConfig::default(),
            sink: SinkConfig::default(),
            watchdog: WatchdogSettings::default(),
            filter: FilterConfig::default(),
        }
    }
}

impl SyncerConfig {
    /// Load defaults, then `file` if given, then `WARP_*` environment variables.
    pub fn load(file: Option<&Path>) -> Result<Self, SyncError> {
        let mut builder = config::Config::builder();
        if let Some(path) = file {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        builder = builder.add_source(
            config::Environment::with_prefix("WARP")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true)
                .list_separator(",")
                .with_list_parse_key("client.peers"),
        );

        let loaded: Self = builder
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| SyncError::Config(e.to_string()))?;
        loaded.validate()?;
        Ok(loaded)
    }

    /// Path to the RocksDB directory.
    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("syncdata")
    }

    /// Reject settings the pipeline cannot run with.
    pub fn validate(&self) -> Result<(), SyncError> {
        let fail = |msg: &str| Err(SyncError::Config(msg.to_string()));

        if self.component.is_empty() {
            return fail("component name is empty");
        }
        if self.client.primary.trim().is_empty() {
            return fail("client.primary is empty");
        }
        if self.client.requests_per_second <= 0.0 || self.client.min_rate <= 0.0 {
            return fail("rate limits must be positive");
        }
        if !(0.0..=1.0).contains(&self.client.decay_factor) {
            return fail("client.decay_factor must be within [0, 1]");
        }
        if self.transactions.workers == 0 || self.transactions.queue_capacity == 0 {
            return fail("transaction workers and queue capacity must be non-zero");
        }
        if self.transactions.max_interval < self.transactions.initial_interval {
            return fail("transactions.max_interval_ms is below initial_interval_ms");
        }
        if self.sink.batch_size == 0 {
            return fail("sink.batch_size must be non-zero");
        }
        if self.sink.max_time_in_queue.is_zero() || self.monitor.interval.is_zero() {
            return fail("intervals must be non-zero");
        }
        if self.blocks.output_capacity == 0 || self.transactions.output_capacity == 0 || self.sink.input_capacity == 0 {
            return fail("queue capacities must be non-zero");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_are_valid() {
        SyncerConfig::default().validate().unwrap();
    }

    #[test]
    fn default_data_dir_ends_with_warp_syncer() {
        let cfg = SyncerConfig::default();
        assert!(cfg.data_dir.ends_with("warp-syncer"), "{:?}", cfg.data_dir);
        assert!(cfg.db_path().ends_with("syncdata"));
    }

    #[test]
    fn zero_batch_size_rejected() {
        let mut cfg = SyncerConfig::default();
        cfg.sink.batch_size = 0;
        assert!(matches!(cfg.validate(), Err(SyncError::Config(_))));
    }

    #[test]
    fn zero_workers_rejected() {
        let mut cfg = SyncerConfig::default();
        cfg.transactions.workers = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn inverted_backoff_rejected() {
        let mut cfg = SyncerConfig::default();
        cfg.transactions.max_interval = Duration::from_millis(1);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn empty_primary_rejected() {
        let mut cfg = SyncerConfig::default();
        cfg.client.primary = " ".into();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn client_settings_round_trip_defaults() {
        assert_eq!(ClientSettings::default().client_config(), ClientConfig::default());
        assert_eq!(PeerMonitorSettings::default().monitor_config(), PeerMonitorConfig::default());
    }

    #[test]
    fn backoff_and_pool_from_transaction_config() {
        let cfg = TransactionDownloaderConfig::default();
        assert_eq!(cfg.backoff().max_elapsed, Some(Duration::from_secs(60)));
        assert_eq!(cfg.pool().workers, 50);
    }

    #[test]
    fn loads_toml_file_over_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("syncer.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(
            file,
            r#"
component = "contracts"
start_height = 1000

[client]
primary = "http://127.0.0.1:1984"
peers = ["10.0.0.1:1984"]

[monitor]
interval_ms = 2500
confirmation_depth = 3

[sink]
batch_size = 25

[filter]
kind = "contracts"
"#
        )
        .unwrap();

        let cfg = SyncerConfig::load(Some(&path)).unwrap();
        assert_eq!(cfg.component, "contracts");
        assert_eq!(cfg.start_height, 1000);
        assert_eq!(cfg.client.primary, "http://127.0.0.1:1984");
        assert_eq!(cfg.client.peers, vec!["10.0.0.1:1984".to_string()]);
        assert_eq!(cfg.monitor.interval, Duration::from_millis(2500));
        assert_eq!(cfg.monitor.confirmation_depth, 3);
        assert_eq!(cfg.sink.batch_size, 25);
        assert_eq!(cfg.sink.max_time_in_queue, SinkConfig::default().max_time_in_queue);
        assert_eq!(cfg.filter, FilterConfig::Contracts);
    }

    #[test]
    fn invalid_file_values_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "[sink]\nbatch_size = 0\n").unwrap();
        assert!(matches!(SyncerConfig::load(Some(&path)), Err(SyncError::Config(_))));
    }

    #[test]
    fn missing_file_is_an_error() {
        let path = PathBuf::from("/nonexistent/warp-syncer.toml");
        assert!(SyncerConfig::load(Some(&path)).is_err());
    }
}
