//! Error types for ledger data and integrity checks.
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("invalid base64url: {0}")] InvalidBase64(String),
    #[error("invalid decimal: {0:?}")] InvalidDecimal(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BlockError {
    #[error("block hash mismatch at height {height}: declared {declared}, computed {computed}")] HashMismatch { height: u64, declared: String, computed: String },
    #[error("parent hash mismatch at height {height}: expected {expected}, got {got}")] ParentMismatch { height: u64, expected: String, got: String },
    #[error("unexpected height: requested {requested}, got {got}")] UnexpectedHeight { requested: u64, got: u64 },
    #[error("duplicate transaction id in block: {0}")] DuplicateTxId(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("invalid public key bytes")] InvalidPublicKey,
    #[error("invalid signature bytes")] InvalidSignature,
    #[error("signature verification failed")] VerificationFailed,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransactionError {
    #[error("unsupported transaction format {0}")] UnsupportedFormat(u8),
    #[error("id does not match signature: {0}")] IdMismatch(String),
    #[error("bad signature on {id}: {source}")] BadSignature { id: String, source: CryptoError },
    #[error("data size mismatch: declared {declared}, got {got}")] DataSizeMismatch { declared: u64, got: u64 },
    #[error("data root mismatch for {0}")] DataRootMismatch(String),
    #[error("requested {requested}, peer returned {got}")] UnexpectedId { requested: String, got: String },
}

#[derive(Error, Debug)]
pub enum WarpError {
    #[error(transparent)] Decode(#[from] DecodeError),
    #[error(transparent)] Block(#[from] BlockError),
    #[error(transparent)] Crypto(#[from] CryptoError),
    #[error(transparent)] Transaction(#[from] TransactionError),
}
