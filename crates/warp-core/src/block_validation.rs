//! Integrity checks applied to every block before it is forwarded.
//!
//! These only re-verify what a single block can prove about itself and its
//! link to the previously accepted block. Chain selection is left to peers.

use std::collections::HashSet;

use crate::error::BlockError;
use crate::types::{Base64Url, Block};

/// Check that `block` is the block the caller asked for.
pub fn verify_height(block: &Block, requested: u64) -> Result<(), BlockError> {
    if block.height != requested {
        return Err(BlockError::UnexpectedHeight {
            requested,
            got: block.height,
        });
    }
    Ok(())
}

/// Check that the block links to `previous`, when one is known.
pub fn verify_parent(block: &Block, previous: Option<&Base64Url>) -> Result<(), BlockError> {
    match previous {
        Some(expected) if *expected != block.previous_block => Err(BlockError::ParentMismatch {
            height: block.height,
            expected: expected.to_string(),
            got: block.previous_block.to_string(),
        }),
        _ => Ok(()),
    }
}

/// Recompute the block identifier and compare it with the declared one.
pub fn verify_block_hash(block: &Block) -> Result<(), BlockError> {
    let computed = block.compute_hash();
    if computed != block.indep_hash {
        return Err(BlockError::HashMismatch {
            height: block.height,
            declared: block.indep_hash.to_string(),
            computed: computed.to_string(),
        });
    }
    Ok(())
}

/// Reject blocks listing the same transaction twice.
pub fn verify_unique_txs(block: &Block) -> Result<(), BlockError> {
    let mut seen = HashSet::with_capacity(block.txs.len());
    for id in &block.txs {
        if !seen.insert(id) {
            return Err(BlockError::DuplicateTxId(id.to_string()));
        }
    }
    Ok(())
}

/// Run every check, cheapest first.
pub fn validate_block(
    block: &Block,
    requested: u64,
    previous: Option<&Base64Url>,
) -> Result<(), BlockError> {
    verify_height(block, requested)?;
    verify_parent(block, previous)?;
    verify_unique_txs(block)?;
    verify_block_hash(block)
}
