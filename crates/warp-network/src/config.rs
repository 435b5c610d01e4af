//! Configuration for the peer client, its rate limiter and the peer monitor.

use std::time::Duration;

/// Default gateway used as the primary peer.
pub const DEFAULT_PRIMARY: &str = "https://arweave.net";

/// Per-host token bucket settings.
#[derive(Debug, Clone, PartialEq)]
pub struct RateLimitConfig {
    /// Tokens added per second to a fresh host.
    pub requests_per_second: f64,
    /// Bucket capacity.
    pub burst: u32,
    /// Multiplier applied to a host's rate on every 429.
    pub decay_factor: f64,
    /// Rate below which decay stops.
    pub min_rate: f64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_second: 1.0,
            burst: 1,
            decay_factor: 0.9,
            min_rate: 0.1,
        }
    }
}

/// Configuration for [`crate::Client`].
#[derive(Debug, Clone, PartialEq)]
pub struct ClientConfig {
    /// Peer every request goes to unless redirected.
    pub primary: String,
    /// Initial ranked peer list used for failover.
    pub peers: Vec<String>,
    /// Deadline for one request against one peer, including the rate-limit wait.
    pub request_timeout: Duration,
    pub connect_timeout: Duration,
    /// Immediate same-host retries after a 5xx.
    pub server_error_retries: u32,
    /// Replay failed requests against the ranked peers.
    pub failover: bool,
    pub rate_limit: RateLimitConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            primary: DEFAULT_PRIMARY.to_string(),
            peers: Vec::new(),
            request_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            server_error_retries: 2,
            failover: true,
            rate_limit: RateLimitConfig::default(),
        }
    }
}

impl ClientConfig {
    /// Preset for a single local node: no failover, no throttling to speak of.
    pub fn local(url: &str) -> Self {
        Self {
            primary: url.to_string(),
            failover: false,
            request_timeout: Duration::from_secs(5),
            rate_limit: RateLimitConfig {
                requests_per_second: 100.0,
                burst: 100,
                ..RateLimitConfig::default()
            },
            ..Self::default()
        }
    }
}

/// Configuration for the periodic peer refresh.
#[derive(Debug, Clone, PartialEq)]
pub struct PeerMonitorConfig {
    pub interval: Duration,
    /// Peers more than this many blocks behind the best probe are dropped.
    pub max_height_lag: u64,
    /// Size of the ranked list handed to the client.
    pub max_peers: usize,
    /// Probes in flight at once.
    pub probe_concurrency: usize,
}

impl Default for PeerMonitorConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(600),
            max_height_lag: 5,
            max_peers: 50,
            probe_concurrency: 16,
        }
    }
}
