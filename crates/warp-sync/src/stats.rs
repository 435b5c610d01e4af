//! Per-generation counters and the health predicate built on them.

use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::warn;

/// Counters shared by every stage of one pipeline generation.
#[derive(Debug, Default)]
pub struct SyncStats {
    pub heights_observed: AtomicU64,
    pub height_poll_errors: AtomicU64,
    pub blocks_validated: AtomicU64,
    pub block_validation_errors: AtomicU64,
    pub block_download_errors: AtomicU64,
    pub transactions_downloaded: AtomicU64,
    pub transaction_verification_failures: AtomicU64,
    pub transactions_dropped: AtomicU64,
    pub records_flushed: AtomicU64,
    pub flush_failures: AtomicU64,
    /// Last height the block downloader validated.
    pub current_height: AtomicU64,
}

/// Point-in-time copy of [`SyncStats`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub heights_observed: u64,
    pub height_poll_errors: u64,
    pub blocks_validated: u64,
    pub block_validation_errors: u64,
    pub block_download_errors: u64,
    pub transactions_downloaded: u64,
    pub transaction_verification_failures: u64,
    pub transactions_dropped: u64,
    pub records_flushed: u64,
    pub flush_failures: u64,
    pub current_height: u64,
}

impl StatsSnapshot {
    /// Sum of every counter the watchdog treats as degradation.
    pub fn errors(&self) -> u64 {
        self.height_poll_errors
            + self.block_validation_errors
            + self.block_download_errors
            + self.transaction_verification_failures
            + self.transactions_dropped
            + self.flush_failures
    }
}

impl SyncStats {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        StatsSnapshot {
            heights_observed: get(&self.heights_observed),
            height_poll_errors: get(&self.height_poll_errors),
            blocks_validated: get(&self.blocks_validated),
            block_validation_errors: get(&self.block_validation_errors),
            block_download_errors: get(&self.block_download_errors),
            transactions_downloaded: get(&self.transactions_downloaded),
            transaction_verification_failures: get(&self.transaction_verification_failures),
            transactions_dropped: get(&self.transactions_dropped),
            records_flushed: get(&self.records_flushed),
            flush_failures: get(&self.flush_failures),
            current_height: get(&self.current_height),
        }
    }
}

/// Watchdog predicate: healthy while the error counters grow by at most
/// `tolerance` between two evaluations.
#[derive(Debug)]
pub struct HealthCheck {
    stats: Arc<SyncStats>,
    tolerance: u64,
    last_errors: u64,
}

impl HealthCheck {
    pub fn new(stats: Arc<SyncStats>, tolerance: u64) -> Self {
        let last_errors = stats.snapshot().errors();
        Self {
            stats,
            tolerance,
            last_errors,
        }
    }

    pub fn is_ok(&mut self) -> bool {
        let errors = self.stats.snapshot().errors();
        let delta = errors.saturating_sub(self.last_errors);
        self.last_errors = errors;
        if delta > self.tolerance {
            warn!(delta, tolerance = self.tolerance, "health: error counters grew past tolerance");
            return false;
        }
        true
    }
}
