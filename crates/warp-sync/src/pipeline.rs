//! Pipeline assembly and supervision.
//!
//! [`Pipeline`] wires one generation of the chain
//! `monitor → blocks → transactions → mapper → sink` over fresh bounded
//! queues and fresh counters. [`Syncer`] keeps generations running under a
//! [`Watchdog`], rebuilding whenever the error counters grow faster than
//! the configured tolerance. Every generation resumes from the persisted
//! checkpoint, so nothing in memory needs to survive a rebuild.

use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::info;
use warp_network::{Client, peer_monitor_task};
use warp_task::{Generation, Hook, Task, TaskError, TaskSpec, Watchdog, WatchdogConfig, hook};

use crate::block_downloader::{BlockStage, block_downloader};
use crate::config::SyncerConfig;
use crate::error::SyncError;
use crate::filter::InclusionFilter;
use crate::interaction::mapper_task;
use crate::ledger::Ledger;
use crate::monitor::height_monitor;
use crate::sink::{SinkStage, sink_task};
use crate::stats::{HealthCheck, SyncStats};
use crate::store::Store;
use crate::tx_downloader::{TxStage, tx_downloader};

/// Stable heights waiting for the block downloader.
const HEIGHT_QUEUE_CAPACITY: usize = 1;

/// What a generation is built from.
#[derive(Clone)]
pub struct PipelineParts {
    pub ledger: Arc<dyn Ledger>,
    pub store: Arc<dyn Store>,
    pub filter: Arc<dyn InclusionFilter>,
    pub config: SyncerConfig,
}

/// One built, not yet started, generation.
pub struct Pipeline {
    pub task: Task,
    pub stats: Arc<SyncStats>,
}

impl Pipeline {
    pub fn build(parts: PipelineParts, generation: u64) -> Self {
        Self::assemble(parts, generation, Vec::new(), None)
    }

    /// A generation talking to real peers through its own [`Client`].
    ///
    /// The client's requests are aborted as soon as the generation starts
    /// shutting down. With peer monitoring enabled a refresh task runs
    /// alongside the stages.
    pub fn connect(config: &SyncerConfig, store: Arc<dyn Store>, generation: u64) -> Result<Self, SyncError> {
        let token = CancellationToken::new();
        let client = Arc::new(Client::new(config.client.client_config(), token.clone())?);

        let mut extra = Vec::new();
        if config.peer_monitor.enabled {
            extra.push(peer_monitor_task(client.clone(), config.peer_monitor.monitor_config()));
        }
        let abort_requests = hook(move || {
            token.cancel();
            Ok(())
        });

        let parts = PipelineParts {
            ledger: client,
            store,
            filter: config.filter.build(),
            config: config.clone(),
        };
        Ok(Self::assemble(parts, generation, extra, Some(abort_requests)))
    }

    fn assemble(parts: PipelineParts, generation: u64, extra: Vec<Task>, before_stop: Option<Hook>) -> Self {
        let PipelineParts {
            ledger,
            store,
            filter,
            config,
        } = parts;
        let stats = SyncStats::new();
        let task_config = config.watchdog.task_config();

        let (height_tx, height_rx) = mpsc::channel(HEIGHT_QUEUE_CAPACITY);
        let (block_tx, block_rx) = mpsc::channel(config.blocks.output_capacity);
        let (payload_tx, payload_rx) = mpsc::channel(config.transactions.output_capacity);
        let (batch_tx, batch_rx) = mpsc::channel(config.sink.input_capacity);

        let monitor = height_monitor(
            ledger.clone(),
            config.monitor.clone(),
            task_config.clone(),
            stats.clone(),
            height_tx,
        );
        let blocks = block_downloader(
            BlockStage {
                ledger: ledger.clone(),
                store: store.clone(),
                component: config.component.clone(),
                start_height: config.start_height,
                config: config.blocks.clone(),
                stats: stats.clone(),
            },
            task_config.clone(),
            height_rx,
            block_tx,
        );
        let transactions = tx_downloader(
            TxStage {
                ledger,
                filter,
                config: config.transactions.clone(),
                stats: stats.clone(),
            },
            task_config.clone(),
            block_rx,
            payload_tx,
        );
        let mapper = mapper_task(payload_rx, batch_tx);
        let sink = sink_task(
            SinkStage {
                store,
                component: config.component.clone(),
                config: config.sink.clone(),
                stats: stats.clone(),
            },
            task_config.clone(),
            batch_rx,
        );

        let mut children = vec![monitor, blocks, transactions, mapper, sink];
        children.extend(extra);
        info!(generation, component = %config.component, "pipeline: generation built");

        let task = Task::new(TaskSpec {
            config: task_config,
            children,
            before_stop,
            ..TaskSpec::new(format!("pipeline-{generation}"))
        });
        Self { task, stats }
    }
}

/// The supervised pipeline.
#[derive(Clone)]
pub struct Syncer {
    watchdog: Watchdog,
    current: Arc<Mutex<Arc<SyncStats>>>,
}

impl Syncer {
    /// Supervise the generations built by `factory`, restarting one whose
    /// error counters grow by more than `tolerance` between checks.
    pub fn new<F>(config: WatchdogConfig, tolerance: u64, mut factory: F) -> Self
    where
        F: FnMut(u64) -> Result<Pipeline, SyncError> + Send + 'static,
    {
        let current = Arc::new(Mutex::new(SyncStats::new()));
        let slot = current.clone();

        let watchdog = Watchdog::new("syncer", config, move |generation| {
            let pipeline = factory(generation).map_err(TaskError::from)?;
            *slot.lock() = pipeline.stats.clone();
            let mut health = HealthCheck::new(pipeline.stats, tolerance);
            Ok(Generation {
                task: pipeline.task,
                is_ok: Box::new(move || health.is_ok()),
            })
        });

        Self { watchdog, current }
    }

    /// Production wiring: a fresh client per generation, peers from `config`.
    pub fn from_config(config: SyncerConfig, store: Arc<dyn Store>) -> Self {
        let watchdog_config = config.watchdog.watchdog_config();
        let tolerance = config.watchdog.tolerance;
        Self::new(watchdog_config, tolerance, move |generation| {
            Pipeline::connect(&config, store.clone(), generation)
        })
    }

    /// Root node: start it, stop it, or wait on it.
    pub fn task(&self) -> &Task {
        self.watchdog.task()
    }

    pub fn restarts(&self) -> u64 {
        self.watchdog.restarts()
    }

    /// Counters of the running generation.
    pub fn stats(&self) -> Arc<SyncStats> {
        self.current.lock().clone()
    }
}
