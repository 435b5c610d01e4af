//! # warp-sync — the ingestion pipeline.
//!
//! Stages, each a [`warp_task::Task`] connected to the next by a bounded queue:
//! - [`monitor`] — polls the source peer and emits stable heights
//! - [`block_downloader`] — walks heights in order, validating each block
//! - [`tx_downloader`] — fetches and verifies a block's transactions on a worker pool
//! - [`interaction`] — maps validated payloads to storable records
//! - [`sink`] — batches records and persists them with the checkpoint
//!
//! [`pipeline::Syncer`] builds a generation of the chain and keeps it under a
//! [`warp_task::Watchdog`].

pub mod block_downloader;
pub mod config;
pub mod error;
pub mod filter;
pub mod interaction;
pub mod ledger;
pub mod monitor;
pub mod pipeline;
pub mod sink;
pub mod stats;
pub mod store;
pub mod tx_downloader;

pub use config::SyncerConfig;
pub use error::{StoreError, SyncError};
pub use filter::{AcceptAll, FilterConfig, FnFilter, InclusionFilter, TagFilter};
pub use interaction::{Interaction, InteractionBatch};
pub use ledger::Ledger;
pub use pipeline::{Pipeline, PipelineParts, Syncer};
pub use stats::{HealthCheck, StatsSnapshot, SyncStats};
pub use store::{MemoryStore, RocksStore, Store};
