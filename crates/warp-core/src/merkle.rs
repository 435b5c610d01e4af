//! SHA-256 chunk tree committing to a transaction's payload.
//!
//! The payload is cut into chunks of at most [`MAX_CHUNK_SIZE`] bytes. When
//! the bytes left after a full chunk would be smaller than
//! [`MIN_CHUNK_SIZE`], the remainder is split into two halves instead so
//! that no trailing chunk is tiny.
//!
//! - Leaf id: `SHA-256(SHA-256(chunk) || SHA-256(note(end)))`
//! - Branch id: `SHA-256(SHA-256(left) || SHA-256(right) || SHA-256(note(left.end)))`
//!
//! `note(n)` is `n` as a [`NOTE_SIZE`]-byte big-endian integer. An odd node
//! at the end of a layer is carried up unchanged. Empty payloads have no root.

use sha2::{Digest, Sha256};

use crate::constants::{MAX_CHUNK_SIZE, MIN_CHUNK_SIZE, NOTE_SIZE};

/// A node of the chunk tree: its id and the exclusive end offset it covers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Node {
    id: [u8; 32],
    max_byte_range: u64,
}

fn sha256(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}

fn note(offset: u64) -> [u8; NOTE_SIZE] {
    let mut out = [0u8; NOTE_SIZE];
    out[NOTE_SIZE - 8..].copy_from_slice(&offset.to_be_bytes());
    out
}

/// Byte ranges `(start, end)` of the chunks `data` is cut into.
pub fn chunk_boundaries(len: usize) -> Vec<(usize, usize)> {
    let mut chunks = Vec::new();
    let mut start = 0;
    let mut rest = len;

    while rest >= MAX_CHUNK_SIZE {
        let mut size = MAX_CHUNK_SIZE;
        let after = rest - MAX_CHUNK_SIZE;
        if after > 0 && after < MIN_CHUNK_SIZE {
            size = rest.div_ceil(2);
        }
        chunks.push((start, start + size));
        start += size;
        rest -= size;
    }

    if rest > 0 {
        chunks.push((start, start + rest));
    }
    chunks
}

fn leaf_hash(chunk: &[u8], end: u64) -> Node {
    let mut hasher = Sha256::new();
    hasher.update(sha256(chunk));
    hasher.update(sha256(&note(end)));
    Node {
        id: hasher.finalize().into(),
        max_byte_range: end,
    }
}

fn node_hash(left: &Node, right: &Node) -> Node {
    let mut hasher = Sha256::new();
    hasher.update(sha256(&left.id));
    hasher.update(sha256(&right.id));
    hasher.update(sha256(&note(left.max_byte_range)));
    Node {
        id: hasher.finalize().into(),
        max_byte_range: right.max_byte_range,
    }
}

/// Pair adjacent nodes; an odd trailing node moves up as is.
fn next_layer(layer: &[Node]) -> Vec<Node> {
    layer
        .chunks(2)
        .map(|pair| match pair {
            [left, right] => node_hash(left, right),
            [single] => *single,
            _ => unreachable!("chunks(2) yields one or two items"),
        })
        .collect()
}

/// Compute the data root of `data`, or `None` when `data` is empty.
pub fn data_root(data: &[u8]) -> Option<[u8; 32]> {
    let mut layer: Vec<Node> = chunk_boundaries(data.len())
        .into_iter()
        .map(|(start, end)| leaf_hash(&data[start..end], end as u64))
        .collect();

    if layer.is_empty() {
        return None;
    }

    while layer.len() > 1 {
        layer = next_layer(&layer);
    }

    Some(layer[0].id)
}
