//! Transaction downloader: fetches, verifies and filters a block's transactions.
//!
//! Every transaction id of a block becomes one unit of work on the task's
//! pool. Each unit retries on its own schedule; the block waits for all of
//! them before its payload is emitted, so payloads leave in block order and
//! hold transactions in the block's order. A transaction that never
//! verifies is counted and left out; the block still goes through.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use warp_core::crypto::{verify_transaction, verify_transaction_data};
use warp_core::error::TransactionError;
use warp_core::types::{Base64Url, Block, Payload, Transaction};
use warp_network::{Classification, ClientError};
use warp_task::{Backoff, RetryDecision, RetryError, Task, TaskConfig, TaskContext, TaskError, TaskSpec, background};

use crate::config::TransactionDownloaderConfig;
use crate::error::SyncError;
use crate::filter::InclusionFilter;
use crate::ledger::Ledger;
use crate::stats::SyncStats;

/// How a failed transaction attempt is retried.
pub fn classify(err: &SyncError, not_found_delay: Duration) -> RetryDecision {
    match err {
        SyncError::Client(e) => match e.classify() {
            Classification::Cancelled => RetryDecision::Shutdown,
            Classification::NotFound => RetryDecision::RetryAfter(not_found_delay),
            Classification::RateLimited | Classification::Retryable => RetryDecision::Retry,
            Classification::Terminal => RetryDecision::Permanent,
        },
        SyncError::Transaction(TransactionError::UnsupportedFormat(_)) => RetryDecision::Permanent,
        // another peer may serve an intact copy
        SyncError::Transaction(_) => RetryDecision::Retry,
        SyncError::Shutdown => RetryDecision::Shutdown,
        _ => RetryDecision::Permanent,
    }
}

/// Fetches one transaction and checks it end to end.
pub struct TxFetcher {
    ledger: Arc<dyn Ledger>,
    config: TransactionDownloaderConfig,
    stats: Arc<SyncStats>,
}

impl TxFetcher {
    pub fn new(ledger: Arc<dyn Ledger>, config: TransactionDownloaderConfig, stats: Arc<SyncStats>) -> Self {
        Self { ledger, config, stats }
    }

    /// One attempt: fetch, bind to the requested id, verify, then attach the payload if wanted.
    pub async fn fetch_verified(&self, id: &Base64Url) -> Result<Transaction, SyncError> {
        let mut tx = self.ledger.transaction(id).await?;
        if tx.id != *id {
            return Err(TransactionError::UnexpectedId {
                requested: id.to_string(),
                got: tx.id.to_string(),
            }
            .into());
        }
        verify_transaction(&tx)?;

        if self.wants_data(&tx) {
            let data = self.ledger.transaction_data(id).await?;
            verify_transaction_data(&tx, &data)?;
            tx.data = Base64Url(data);
        }
        Ok(tx)
    }

    fn wants_data(&self, tx: &Transaction) -> bool {
        self.config.fetch_data && tx.has_external_data() && tx.declared_data_size() <= self.config.max_data_size
    }

    /// Retry `id` until it verifies. `None` when it was dropped or shutdown began.
    pub async fn download(&self, token: &CancellationToken, id: &Base64Url) -> Option<Transaction> {
        let not_found_delay = self.config.not_found_delay;
        let backoff = Backoff::new(self.config.backoff(), move |e: &SyncError| classify(e, not_found_delay));

        let result = backoff
            .run(token, || async move {
                let attempt = self.fetch_verified(id).await;
                if let Err(SyncError::Transaction(e)) = &attempt {
                    SyncStats::incr(&self.stats.transaction_verification_failures);
                    debug!(tx = %id, error = %e, "tx_downloader: verification failed");
                }
                attempt
            })
            .await;

        match result {
            Ok(tx) => {
                SyncStats::incr(&self.stats.transactions_downloaded);
                Some(tx)
            }
            Err(RetryError::Cancelled) => None,
            Err(e) => {
                SyncStats::incr(&self.stats.transactions_dropped);
                warn!(tx = %id, error = %e, "tx_downloader: dropping transaction");
                None
            }
        }
    }
}

/// Fan the block's ids out on the pool and collect results in block order.
async fn collect_block(ctx: &TaskContext, fetcher: &Arc<TxFetcher>, block: &Block) -> Result<Vec<Option<Transaction>>, TaskError> {
    let (done_tx, mut done_rx) = mpsc::channel(block.txs.len().max(1));

    for (index, id) in block.txs.iter().cloned().enumerate() {
        let fetcher = fetcher.clone();
        let token = ctx.token().clone();
        let done = done_tx.clone();
        ctx.submit(async move {
            let tx = fetcher.download(&token, &id).await;
            let _ = done.send((index, tx)).await;
        })
        .await?;
    }
    drop(done_tx);

    let mut slots = vec![None; block.txs.len()];
    while let Some((index, tx)) = ctx.recv(&mut done_rx).await {
        slots[index] = tx;
    }
    if ctx.is_cancelled() {
        return Err(TaskError::Cancelled);
    }
    Ok(slots)
}

/// Shared inputs of the transaction downloader stage.
pub struct TxStage {
    pub ledger: Arc<dyn Ledger>,
    pub filter: Arc<dyn InclusionFilter>,
    pub config: TransactionDownloaderConfig,
    pub stats: Arc<SyncStats>,
}

pub fn tx_downloader(stage: TxStage, task_config: TaskConfig, mut input: mpsc::Receiver<Block>, output: mpsc::Sender<Payload>) -> Task {
    let TxStage {
        ledger,
        filter,
        config,
        stats,
    } = stage;
    let pool = config.pool();
    let fetcher = Arc::new(TxFetcher::new(ledger, config, stats));

    Task::new(TaskSpec {
        config: task_config,
        pool: Some(pool),
        background: vec![background(move |ctx| async move {
            while let Some(block) = ctx.recv(&mut input).await {
                let fetched = collect_block(&ctx, &fetcher, &block).await?;
                let transactions: Vec<Transaction> = fetched
                    .into_iter()
                    .flatten()
                    .filter(|tx| filter.accepts(tx))
                    .collect();

                debug!(
                    height = block.height,
                    listed = block.txs.len(),
                    accepted = transactions.len(),
                    "tx_downloader: block complete"
                );
                let payload = Payload {
                    height: block.height,
                    hash: block.indep_hash.clone(),
                    timestamp: block.timestamp,
                    transactions,
                };
                ctx.send(&output, payload).await?;
            }
            Ok(())
        })],
        ..TaskSpec::new("tx-downloader")
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::{AcceptAll, TagFilter};
    use crate::ledger::testing::{ScriptedLedger, block, signed_tx};
    use warp_core::crypto::{KeyPair, sign_transaction};
    use warp_core::types::Decimal;

    fn config() -> TransactionDownloaderConfig {
        TransactionDownloaderConfig {
            workers: 4,
            queue_capacity: 4,
            initial_interval: Duration::from_millis(100),
            multiplier: 2.0,
            max_interval: Duration::from_secs(1),
            max_elapsed: Duration::from_secs(5),
            not_found_delay: Duration::from_millis(250),
            fetch_data: false,
            max_data_size: 1024,
            output_capacity: 8,
        }
    }

    fn not_found() -> ClientError {
        ClientError::Status { peer: "a.example".into(), status: 404 }
    }

    struct Harness {
        ledger: Arc<ScriptedLedger>,
        stats: Arc<SyncStats>,
        blocks: mpsc::Sender<Block>,
        payloads: mpsc::Receiver<Payload>,
        task: Task,
    }

    fn harness(config: TransactionDownloaderConfig, filter: Arc<dyn InclusionFilter>) -> Harness {
        let ledger = Arc::new(ScriptedLedger::default());
        let stats = SyncStats::new();
        let (blocks, block_rx) = mpsc::channel(4);
        let (payload_tx, payloads) = mpsc::channel(4);
        let stage = TxStage {
            ledger: ledger.clone(),
            filter,
            config,
            stats: stats.clone(),
        };
        let task = tx_downloader(stage, TaskConfig::default(), block_rx, payload_tx);
        task.start().unwrap();
        Harness {
            ledger,
            stats,
            blocks,
            payloads,
            task,
        }
    }

    fn scripted(ledger: &ScriptedLedger, txs: &[Transaction]) -> Vec<Base64Url> {
        txs.iter()
            .map(|tx| {
                ledger.push_tx(tx.id.clone(), Ok(tx.clone()));
                tx.id.clone()
            })
            .collect()
    }

    #[test]
    fn classification() {
        let d = Duration::from_secs(1);
        assert_eq!(classify(&SyncError::Client(not_found()), d), RetryDecision::RetryAfter(d));
        assert_eq!(classify(&SyncError::Client(ClientError::RateLimited { peer: "p".into() }), d), RetryDecision::Retry);
        assert_eq!(classify(&SyncError::Client(ClientError::Timeout { peer: "p".into() }), d), RetryDecision::Retry);
        assert_eq!(
            classify(&SyncError::Client(ClientError::Status { peer: "p".into(), status: 400 }), d),
            RetryDecision::Permanent
        );
        assert_eq!(classify(&SyncError::Client(ClientError::Cancelled), d), RetryDecision::Shutdown);
        assert_eq!(
            classify(&SyncError::Transaction(TransactionError::UnsupportedFormat(1)), d),
            RetryDecision::Permanent
        );
        assert_eq!(
            classify(&SyncError::Transaction(TransactionError::IdMismatch("x".into())), d),
            RetryDecision::Retry
        );
    }

    #[tokio::test(start_paused = true)]
    async fn payload_keeps_block_order() {
        let mut h = harness(config(), Arc::new(AcceptAll));
        let txs: Vec<_> = (0..10).map(|_| signed_tx(&[])).collect();
        // the first id is slow to appear
        h.ledger.push_tx(txs[0].id.clone(), Err(not_found()));
        let ids = scripted(&h.ledger, &txs);

        let b = block(7, &Base64Url(vec![1; 48]), ids.clone());
        h.blocks.send(b.clone()).await.unwrap();

        let payload = h.payloads.recv().await.unwrap();
        assert_eq!(payload.height, 7);
        assert_eq!(payload.hash, b.indep_hash);
        assert_eq!(payload.transactions, txs);
        assert_eq!(h.stats.snapshot().transactions_downloaded, 10);
        h.task.stop_wait().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn payloads_follow_block_order() {
        let mut h = harness(config(), Arc::new(AcceptAll));
        let first = signed_tx(&[]);
        let second = signed_tx(&[]);
        scripted(&h.ledger, &[second.clone()]);
        h.ledger.push_tx(first.id.clone(), Err(not_found()));
        h.ledger.push_tx(first.id.clone(), Err(not_found()));
        h.ledger.push_tx(first.id.clone(), Ok(first.clone()));

        h.blocks.send(block(1, &Base64Url(vec![1; 48]), vec![first.id.clone()])).await.unwrap();
        h.blocks.send(block(2, &Base64Url(vec![2; 48]), vec![second.id.clone()])).await.unwrap();

        assert_eq!(h.payloads.recv().await.unwrap().height, 1);
        assert_eq!(h.payloads.recv().await.unwrap().height, 2);
        h.task.stop_wait().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn bad_signature_is_excluded_and_counted() {
        let mut h = harness(config(), Arc::new(AcceptAll));
        let good = signed_tx(&[]);
        let mut forged = signed_tx(&[("Contract", "c1")]);
        forged.tags.push(warp_core::types::Tag::new("Injected", "yes"));
        let ids = scripted(&h.ledger, &[good.clone(), forged]);

        h.blocks.send(block(3, &Base64Url(vec![3; 48]), ids)).await.unwrap();
        let payload = h.payloads.recv().await.unwrap();

        assert_eq!(payload.transactions, vec![good]);
        let snap = h.stats.snapshot();
        assert!(snap.transaction_verification_failures >= 1);
        assert_eq!(snap.transactions_dropped, 1);
        assert_eq!(snap.transactions_downloaded, 1);
        h.task.stop_wait().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn unsupported_format_is_not_retried() {
        let mut h = harness(config(), Arc::new(AcceptAll));
        let mut old = signed_tx(&[]);
        old.format = 1;
        let ids = scripted(&h.ledger, &[old]);

        h.blocks.send(block(4, &Base64Url(vec![4; 48]), ids)).await.unwrap();
        let payload = h.payloads.recv().await.unwrap();

        assert!(payload.transactions.is_empty());
        let snap = h.stats.snapshot();
        assert_eq!(snap.transaction_verification_failures, 1);
        assert_eq!(snap.transactions_dropped, 1);
        h.task.stop_wait().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn peer_returning_another_transaction_is_rejected() {
        let mut h = harness(config(), Arc::new(AcceptAll));
        let wanted = signed_tx(&[]);
        let other = signed_tx(&[]);
        h.ledger.push_tx(wanted.id.clone(), Ok(other));
        h.ledger.push_tx(wanted.id.clone(), Ok(wanted.clone()));

        h.blocks.send(block(5, &Base64Url(vec![5; 48]), vec![wanted.id.clone()])).await.unwrap();
        assert_eq!(h.payloads.recv().await.unwrap().transactions, vec![wanted]);
        assert_eq!(h.stats.snapshot().transaction_verification_failures, 1);
        h.task.stop_wait().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn filter_is_applied_after_verification() {
        let mut h = harness(config(), Arc::new(TagFilter::new("App-Name", "SmartWeaveAction")));
        let kept = signed_tx(&[("App-Name", "SmartWeaveAction")]);
        let skipped = signed_tx(&[("App-Name", "Other")]);
        let ids = scripted(&h.ledger, &[skipped, kept.clone()]);

        h.blocks.send(block(6, &Base64Url(vec![6; 48]), ids)).await.unwrap();
        assert_eq!(h.payloads.recv().await.unwrap().transactions, vec![kept]);
        assert_eq!(h.stats.snapshot().transactions_downloaded, 2);
        h.task.stop_wait().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn empty_block_still_emits_payload() {
        let mut h = harness(config(), Arc::new(AcceptAll));
        h.blocks.send(block(8, &Base64Url(vec![8; 48]), Vec::new())).await.unwrap();
        let payload = h.payloads.recv().await.unwrap();
        assert_eq!(payload.height, 8);
        assert!(payload.transactions.is_empty());
        h.task.stop_wait().await.unwrap();
    }

    fn with_external_data(size: u64) -> Transaction {
        let mut tx = signed_tx(&[]);
        tx.data_size = Decimal::from(size);
        sign_transaction(&mut tx, &KeyPair::generate());
        tx
    }

    #[tokio::test(start_paused = true)]
    async fn external_data_is_fetched_and_checked() {
        let mut cfg = config();
        cfg.fetch_data = true;
        let mut h = harness(cfg, Arc::new(AcceptAll));
        let tx = with_external_data(5);
        h.ledger.data.lock().insert(tx.id.clone(), b"hello".to_vec());
        let ids = scripted(&h.ledger, &[tx]);

        h.blocks.send(block(9, &Base64Url(vec![9; 48]), ids)).await.unwrap();
        let payload = h.payloads.recv().await.unwrap();
        assert_eq!(payload.transactions[0].data.as_bytes(), b"hello");
        h.task.stop_wait().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn oversized_data_is_left_out() {
        let mut cfg = config();
        cfg.fetch_data = true;
        cfg.max_data_size = 4;
        let mut h = harness(cfg, Arc::new(AcceptAll));
        let tx = with_external_data(5);
        let ids = scripted(&h.ledger, &[tx.clone()]);

        h.blocks.send(block(10, &Base64Url(vec![10; 48]), ids)).await.unwrap();
        let payload = h.payloads.recv().await.unwrap();
        assert_eq!(payload.transactions, vec![tx]);
        assert!(payload.transactions[0].data.is_empty());
        h.task.stop_wait().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_abandons_unfinished_block() {
        let mut h = harness(config(), Arc::new(AcceptAll));
        let pending = signed_tx(&[]);
        h.ledger.push_tx(pending.id.clone(), Err(not_found()));
        h.blocks.send(block(11, &Base64Url(vec![11; 48]), vec![pending.id.clone()])).await.unwrap();

        tokio::time::sleep(Duration::from_secs(2)).await;
        h.task.stop_wait().await.unwrap();
        assert!(h.payloads.recv().await.is_none());
        assert_eq!(h.stats.snapshot().transactions_dropped, 0);
    }
}
