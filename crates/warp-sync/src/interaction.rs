//! Storable records derived from validated payloads, and the mapping stage.

use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::sync::mpsc;
use tracing::debug;
use warp_core::constants::{TAG_CONTRACT, TAG_INPUT};
use warp_core::crypto::owner_address;
use warp_core::types::{Base64Url, Checkpoint, Payload, Tag, Transaction};
use warp_task::{Task, TaskSpec, background};

/// One accepted transaction as persisted by the sink.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, bincode::Encode, bincode::Decode)]
pub struct Interaction {
    pub id: Base64Url,
    /// Value of the `Contract` tag, if any.
    pub contract_id: Option<String>,
    /// Value of the `Input` tag, if any.
    pub input: Option<String>,
    /// SHA-256 of the owner key.
    pub owner: Base64Url,
    pub block_height: u64,
    pub block_hash: Base64Url,
    pub block_timestamp: u64,
    pub tags: Vec<Tag>,
    /// Orders records by height, then pseudo-randomly within a block.
    pub sort_key: String,
}

/// Sortable key: zero-padded height, a reserved zero field, then
/// `hex(sha256(block_hash ++ tx_id))`.
pub fn sort_key(height: u64, block_hash: &Base64Url, tx_id: &Base64Url) -> String {
    let mut hasher = Sha256::new();
    hasher.update(block_hash.as_bytes());
    hasher.update(tx_id.as_bytes());
    format!("{:012},{:013},{}", height, 0, hex::encode(hasher.finalize()))
}

impl Interaction {
    pub fn new(tx: &Transaction, payload: &Payload) -> Self {
        Self {
            id: tx.id.clone(),
            contract_id: tx.tag_value(TAG_CONTRACT),
            input: tx.tag_value(TAG_INPUT),
            owner: owner_address(tx.owner.as_bytes()),
            block_height: payload.height,
            block_hash: payload.hash.clone(),
            block_timestamp: payload.timestamp,
            tags: tx.tags.clone(),
            sort_key: sort_key(payload.height, &payload.hash, &tx.id),
        }
    }
}

/// All records of one block plus the checkpoint reached once they are stored.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InteractionBatch {
    pub checkpoint: Checkpoint,
    pub records: Vec<Interaction>,
}

impl From<&Payload> for InteractionBatch {
    fn from(payload: &Payload) -> Self {
        Self {
            checkpoint: payload.checkpoint(),
            records: payload
                .transactions
                .iter()
                .map(|tx| Interaction::new(tx, payload))
                .collect(),
        }
    }
}

/// Stage converting payloads into record batches, one per block.
pub fn mapper_task(mut input: mpsc::Receiver<Payload>, output: mpsc::Sender<InteractionBatch>) -> Task {
    Task::new(TaskSpec {
        background: vec![background(move |ctx| async move {
            while let Some(payload) = ctx.recv(&mut input).await {
                let batch = InteractionBatch::from(&payload);
                debug!(height = payload.height, records = batch.records.len(), "mapper: block mapped");
                ctx.send(&output, batch).await?;
            }
            Ok(())
        })],
        ..TaskSpec::new("mapper")
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::testing::signed_tx;

    fn payload(txs: Vec<Transaction>) -> Payload {
        Payload {
            height: 1_234,
            hash: Base64Url(vec![9; 48]),
            timestamp: 1_700_000_000,
            transactions: txs,
        }
    }

    #[test]
    fn sort_key_layout() {
        let key = sort_key(42, &Base64Url(vec![1; 48]), &Base64Url(vec![2; 32]));
        let parts: Vec<_> = key.split(',').collect();
        assert_eq!(parts[0], "000000000042");
        assert_eq!(parts[1], "0000000000000");
        assert_eq!(parts[2].len(), 64);
    }

    #[test]
    fn sort_keys_order_by_height() {
        let hash = Base64Url(vec![0xFF; 48]);
        let id = Base64Url(vec![0xFF; 32]);
        assert!(sort_key(9, &hash, &id) < sort_key(10, &Base64Url(vec![0; 48]), &Base64Url(vec![0; 32])));
    }

    #[test]
    fn interaction_extracts_tags() {
        let tx = signed_tx(&[("App-Name", "SmartWeaveAction"), ("Contract", "abc"), ("Input", "{\"function\":\"transfer\"}")]);
        let p = payload(vec![tx.clone()]);
        let record = Interaction::new(&tx, &p);

        assert_eq!(record.contract_id.as_deref(), Some("abc"));
        assert_eq!(record.input.as_deref(), Some("{\"function\":\"transfer\"}"));
        assert_eq!(record.owner, owner_address(tx.owner.as_bytes()));
        assert_eq!(record.block_height, 1_234);
        assert_eq!(record.sort_key, sort_key(1_234, &p.hash, &tx.id));
    }

    #[test]
    fn missing_tags_are_none() {
        let tx = signed_tx(&[]);
        let record = Interaction::new(&tx, &payload(vec![tx.clone()]));
        assert!(record.contract_id.is_none());
        assert!(record.input.is_none());
    }

    #[test]
    fn batch_keeps_order_and_checkpoint() {
        let txs = vec![signed_tx(&[]), signed_tx(&[]), signed_tx(&[])];
        let p = payload(txs.clone());
        let batch = InteractionBatch::from(&p);
        assert_eq!(batch.checkpoint, p.checkpoint());
        let ids: Vec<_> = batch.records.iter().map(|r| r.id.clone()).collect();
        let expected: Vec<_> = txs.iter().map(|t| t.id.clone()).collect();
        assert_eq!(ids, expected);
    }

    #[tokio::test]
    async fn mapper_forwards_one_batch_per_payload() {
        let (tx_in, rx_in) = mpsc::channel(4);
        let (tx_out, mut rx_out) = mpsc::channel(4);
        let task = mapper_task(rx_in, tx_out);
        task.start().unwrap();

        tx_in.send(payload(vec![signed_tx(&[])])).await.unwrap();
        tx_in.send(payload(vec![])).await.unwrap();
        assert_eq!(rx_out.recv().await.unwrap().records.len(), 1);
        assert_eq!(rx_out.recv().await.unwrap().records.len(), 0);

        drop(tx_in);
        task.wait().await.unwrap();
    }
}
