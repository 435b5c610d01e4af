//! Error types for the ingestion pipeline.
use thiserror::Error;
use warp_core::error::{BlockError, TransactionError};
use warp_network::ClientError;
use warp_task::TaskError;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("storage: {0}")] Storage(String),
    #[error("encoding: {0}")] Encoding(String),
    #[error("missing column family: {0}")] MissingColumnFamily(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    #[error("invalid configuration: {0}")] Config(String),
    #[error(transparent)] Store(#[from] StoreError),
    #[error(transparent)] Client(#[from] ClientError),
    #[error(transparent)] Block(#[from] BlockError),
    #[error(transparent)] Transaction(#[from] TransactionError),
    #[error(transparent)] Task(#[from] TaskError),
    #[error("shutdown in progress")] Shutdown,
}

impl From<SyncError> for TaskError {
    fn from(e: SyncError) -> Self {
        match e {
            SyncError::Shutdown => TaskError::Cancelled,
            SyncError::Task(inner) => inner,
            other => TaskError::failed(other),
        }
    }
}
