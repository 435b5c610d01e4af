//! # warp-core
//! Ledger data model and the integrity checks run on untrusted peer data.

pub mod block_validation;
pub mod constants;
pub mod crypto;
pub mod deep_hash;
pub mod error;
pub mod merkle;
pub mod types;
