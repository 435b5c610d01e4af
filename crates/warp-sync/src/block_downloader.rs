//! Block downloader: walks heights in order and forwards only validated blocks.
//!
//! The cursor (`next_height`, `previous_hash`) is seeded once from the
//! persisted checkpoint by the task's `before_start` hook. For every stable
//! height received, heights `next_height..=stable` are fetched one by one.
//! A height is retried until a block passing both the parent-linkage and
//! the self-hash check is obtained; only then is it forwarded and the
//! cursor advanced. Shutdown abandons the current height.

use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use warp_core::block_validation::validate_block;
use warp_core::types::{Base64Url, Block, Checkpoint};
use warp_network::ClientError;
use warp_task::{Task, TaskConfig, TaskContext, TaskError, TaskSpec, background, hook};

use crate::config::BlockDownloaderConfig;
use crate::ledger::Ledger;
use crate::stats::SyncStats;
use crate::store::Store;

/// Position of the downloader in the chain.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Cursor {
    pub next_height: u64,
    /// Hash of the block at `next_height - 1`, when known.
    pub previous_hash: Option<Base64Url>,
}

impl Cursor {
    pub fn resume(checkpoint: Option<Checkpoint>, start_height: u64) -> Self {
        match checkpoint {
            Some(cp) => Self {
                next_height: cp.height + 1,
                previous_hash: Some(cp.hash),
            },
            None => Self {
                next_height: start_height,
                previous_hash: None,
            },
        }
    }

    fn advance(&mut self, block: &Block) {
        self.next_height = block.height + 1;
        self.previous_hash = Some(block.indep_hash.clone());
    }
}

pub struct BlockDownloader {
    ledger: Arc<dyn Ledger>,
    config: BlockDownloaderConfig,
    stats: Arc<SyncStats>,
    cursor: Cursor,
}

impl BlockDownloader {
    pub fn new(ledger: Arc<dyn Ledger>, config: BlockDownloaderConfig, stats: Arc<SyncStats>, cursor: Cursor) -> Self {
        Self {
            ledger,
            config,
            stats,
            cursor,
        }
    }

    pub fn cursor(&self) -> &Cursor {
        &self.cursor
    }

    /// Fetch, validate and forward every height up to `stable`.
    pub async fn sync_to(&mut self, ctx: &TaskContext, stable: u64, output: &mpsc::Sender<Block>) -> Result<(), TaskError> {
        while self.cursor.next_height <= stable {
            let height = self.cursor.next_height;
            let block = self.fetch_valid(ctx, height).await?;
            ctx.send(output, block.clone()).await?;
            self.cursor.advance(&block);
            SyncStats::incr(&self.stats.blocks_validated);
            self.stats.current_height.store(height, Ordering::Relaxed);
            debug!(height, txs = block.txs.len(), "block_downloader: block forwarded");
        }
        Ok(())
    }

    /// Retry `height` until a valid block arrives or the scope is cancelled.
    async fn fetch_valid(&self, ctx: &TaskContext, height: u64) -> Result<Block, TaskError> {
        loop {
            let fetched = tokio::select! {
                _ = ctx.cancelled() => return Err(TaskError::Cancelled),
                res = self.ledger.block_by_height(height) => res,
            };

            let block = match fetched {
                Ok(block) => block,
                Err(ClientError::Cancelled) => return Err(TaskError::Cancelled),
                Err(e) => {
                    SyncStats::incr(&self.stats.block_download_errors);
                    warn!(height, error = %e, "block_downloader: fetch failed, resetting connections");
                    self.ledger.reset_connections();
                    ctx.sleep(self.config.retry_delay).await?;
                    continue;
                }
            };

            match validate_block(&block, height, self.cursor.previous_hash.as_ref()) {
                Ok(()) => return Ok(block),
                Err(e) => {
                    SyncStats::incr(&self.stats.block_validation_errors);
                    warn!(height, error = %e, "block_downloader: invalid block, retrying after cooldown");
                    ctx.sleep(self.config.validation_cooldown).await?;
                }
            }
        }
    }
}

/// Shared inputs of the block downloader stage.
pub struct BlockStage {
    pub ledger: Arc<dyn Ledger>,
    pub store: Arc<dyn Store>,
    pub component: String,
    pub start_height: u64,
    pub config: BlockDownloaderConfig,
    pub stats: Arc<SyncStats>,
}

pub fn block_downloader(
    stage: BlockStage,
    task_config: TaskConfig,
    mut input: mpsc::Receiver<u64>,
    output: mpsc::Sender<Block>,
) -> Task {
    let seeded: Arc<Mutex<Option<Cursor>>> = Arc::new(Mutex::new(None));
    let slot = seeded.clone();
    let BlockStage {
        ledger,
        store,
        component,
        start_height,
        config,
        stats,
    } = stage;

    let seed = hook(move || {
        let checkpoint = store.last_checkpoint(&component).map_err(TaskError::failed)?;
        let cursor = Cursor::resume(checkpoint, start_height);
        info!(
            component = %component,
            next_height = cursor.next_height,
            "block_downloader: resuming"
        );
        *slot.lock() = Some(cursor);
        Ok(())
    });

    Task::new(TaskSpec {
        config: task_config,
        before_start: Some(seed),
        background: vec![background(move |ctx| async move {
            let cursor = seeded
                .lock()
                .take()
                .ok_or_else(|| TaskError::failed("cursor not seeded"))?;
            let mut downloader = BlockDownloader::new(ledger, config, stats, cursor);

            while let Some(stable) = ctx.recv(&mut input).await {
                downloader.sync_to(&ctx, stable, &output).await?;
            }
            Ok(())
        })],
        ..TaskSpec::new("block-downloader")
    })
}
