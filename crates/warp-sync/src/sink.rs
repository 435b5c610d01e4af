//! Batched sink: buffers records and persists them in bounded flushes.
//!
//! A flush happens when the buffer reaches `batch_size`, or when the
//! max-time-in-queue timer fires on a non-empty buffer. The timer restarts
//! after every flush. A flush never carries more than `batch_size` records
//! and an empty buffer is never flushed.
//!
//! The checkpoint of a block becomes pending only once all of its records
//! are buffered, and is written by the next flush in the same atomic batch
//! as those records. A failed flush loses its records; from then on this
//! sink stops advancing the checkpoint so a restart resumes before the loss.

use std::sync::Arc;
use std::sync::atomic::Ordering;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, info};
use warp_core::types::Checkpoint;
use warp_task::{Task, TaskConfig, TaskSpec, background};

use crate::config::SinkConfig;
use crate::error::StoreError;
use crate::interaction::{Interaction, InteractionBatch};
use crate::stats::SyncStats;
use crate::store::Store;

pub struct Sink {
    store: Arc<dyn Store>,
    component: String,
    config: SinkConfig,
    stats: Arc<SyncStats>,
    buffer: Vec<Interaction>,
    pending_checkpoint: Option<Checkpoint>,
    /// Set by the first failed flush.
    lost_records: bool,
    deadline: Instant,
}

impl Sink {
    pub fn new(store: Arc<dyn Store>, component: String, config: SinkConfig, stats: Arc<SyncStats>) -> Self {
        let deadline = Instant::now() + config.max_time_in_queue;
        Self {
            store,
            component,
            buffer: Vec::with_capacity(config.batch_size),
            config,
            stats,
            pending_checkpoint: None,
            lost_records: false,
            deadline,
        }
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn pending_checkpoint(&self) -> Option<&Checkpoint> {
        self.pending_checkpoint.as_ref()
    }

    /// When the timer next forces a flush.
    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Buffer one block's records, flushing every time the buffer fills.
    pub async fn accept(&mut self, batch: InteractionBatch) {
        let InteractionBatch { checkpoint, records } = batch;
        for record in records {
            self.buffer.push(record);
            if self.buffer.len() >= self.config.batch_size {
                self.flush().await;
            }
        }
        if !self.lost_records {
            self.pending_checkpoint = Some(checkpoint);
        }
    }

    /// Timer expiry: flush whatever is buffered, or just restart the timer.
    pub async fn on_deadline(&mut self) {
        if self.buffer.is_empty() {
            self.reset_timer();
        } else {
            self.flush().await;
        }
    }

    /// Persist the buffer. Returns how many records were written.
    pub async fn flush(&mut self) -> usize {
        if self.buffer.is_empty() {
            return 0;
        }
        let records = std::mem::take(&mut self.buffer);
        let checkpoint = if self.lost_records { None } else { self.pending_checkpoint.take() };
        let count = records.len();
        let height = checkpoint.as_ref().map(|c| c.height);

        let store = self.store.clone();
        let component = self.component.clone();
        let result = tokio::task::spawn_blocking(move || store.persist(&component, &records, checkpoint.as_ref()))
            .await
            .unwrap_or_else(|e| Err(StoreError::Storage(e.to_string())));
        self.reset_timer();

        match result {
            Ok(()) => {
                self.stats.records_flushed.fetch_add(count as u64, Ordering::Relaxed);
                debug!(records = count, checkpoint = ?height, "sink: flushed");
                count
            }
            Err(e) => {
                SyncStats::incr(&self.stats.flush_failures);
                self.lost_records = true;
                self.pending_checkpoint = None;
                error!(records = count, error = %e, "sink: flush failed, records dropped");
                0
            }
        }
    }

    fn reset_timer(&mut self) {
        self.deadline = Instant::now() + self.config.max_time_in_queue;
    }
}

/// Shared inputs of the sink stage.
pub struct SinkStage {
    pub store: Arc<dyn Store>,
    pub component: String,
    pub config: SinkConfig,
    pub stats: Arc<SyncStats>,
}

pub fn sink_task(stage: SinkStage, task_config: TaskConfig, mut input: mpsc::Receiver<InteractionBatch>) -> Task {
    Task::new(TaskSpec {
        config: task_config,
        background: vec![background(move |ctx| async move {
            let mut sink = Sink::new(stage.store, stage.component, stage.config, stage.stats);

            loop {
                tokio::select! {
                    _ = ctx.cancelled() => break,
                    _ = tokio::time::sleep_until(sink.deadline()) => sink.on_deadline().await,
                    batch = input.recv() => match batch {
                        Some(batch) => sink.accept(batch).await,
                        None => break,
                    },
                }
            }

            let written = sink.flush().await;
            info!(records = written, "sink: final flush");
            Ok(())
        })],
        ..TaskSpec::new("sink")
    })
}
