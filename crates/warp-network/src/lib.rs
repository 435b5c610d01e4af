//! # warp-network — adaptive HTTP client for ledger peers.
//!
//! Every request goes to a forced peer (the configured primary unless
//! redirected), waits for that host's token bucket, and on failure is
//! replayed against the ranked peer list. A 429 permanently slows the host
//! down for the lifetime of the client.
//!
//! [`peer_monitor`] keeps the ranked list fresh by probing peers.

pub mod client;
pub mod config;
pub mod error;
pub mod peer_monitor;
pub mod peer_ranking;
pub mod rate_limiter;

pub use client::{Client, retry_condition};
pub use config::{ClientConfig, PeerMonitorConfig, RateLimitConfig};
pub use error::{Classification, ClientError};
pub use peer_monitor::{peer_monitor_task, refresh_peers};
pub use peer_ranking::{PeerProbe, rank_peers, select_peers};
pub use rate_limiter::RateLimiter;
