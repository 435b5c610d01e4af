//! The network surface the pipeline stages consume.

use async_trait::async_trait;
use warp_core::types::{Base64Url, Block, Transaction};
use warp_network::{Client, ClientError};

/// Read access to the ledger as served by peers.
///
/// [`Client`] is the production implementation; stages only see this
/// trait so they can be driven by scripted ledgers in tests.
#[async_trait]
pub trait Ledger: Send + Sync {
    /// Current height as reported by the source-of-truth peer, without
    /// failover to other peers.
    async fn network_height(&self) -> Result<u64, ClientError>;

    async fn block_by_height(&self, height: u64) -> Result<Block, ClientError>;

    async fn transaction(&self, id: &Base64Url) -> Result<Transaction, ClientError>;

    /// Payload of a transaction that did not inline it.
    async fn transaction_data(&self, id: &Base64Url) -> Result<Vec<u8>, ClientError>;

    /// Drop pooled connections after a transport failure.
    fn reset_connections(&self);
}

#[async_trait]
impl Ledger for Client {
    async fn network_height(&self) -> Result<u64, ClientError> {
        let source = self.primary().clone();
        Ok(self.get_network_info_from(&source).await?.height)
    }

    async fn block_by_height(&self, height: u64) -> Result<Block, ClientError> {
        self.get_block_by_height(height).await
    }

    async fn transaction(&self, id: &Base64Url) -> Result<Transaction, ClientError> {
        self.get_transaction_by_id(id).await
    }

    async fn transaction_data(&self, id: &Base64Url) -> Result<Vec<u8>, ClientError> {
        self.get_transaction_data(id).await
    }

    fn reset_connections(&self) {
        Client::reset_connections(self)
    }
}
