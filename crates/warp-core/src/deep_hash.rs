//! Deep hash: a structural SHA-384 digest over nested byte lists.
//!
//! A blob hashes as `H(H("blob" ++ len) ++ H(bytes))`. A list starts from
//! `H("list" ++ len)` and folds every child in order with
//! `acc = H(acc ++ deep_hash(child))`. Lengths are ASCII decimal. The length
//! prefix keeps a blob and a one-element list over the same bytes apart.

use sha2::{Digest, Sha384};

/// Output of [`deep_hash`].
pub type DeepHash = [u8; 48];

/// A node in the structure being hashed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DeepHashItem {
    Blob(Vec<u8>),
    List(Vec<DeepHashItem>),
}

impl DeepHashItem {
    pub fn blob(bytes: impl AsRef<[u8]>) -> Self {
        Self::Blob(bytes.as_ref().to_vec())
    }

    pub fn list(items: impl IntoIterator<Item = DeepHashItem>) -> Self {
        Self::List(items.into_iter().collect())
    }
}

fn sha384(parts: &[&[u8]]) -> DeepHash {
    let mut hasher = Sha384::new();
    for part in parts {
        hasher.update(part);
    }
    let mut out = [0u8; 48];
    out.copy_from_slice(&hasher.finalize());
    out
}

/// Compute the deep hash of `item`.
pub fn deep_hash(item: &DeepHashItem) -> DeepHash {
    match item {
        DeepHashItem::Blob(bytes) => {
            let tag = sha384(&[b"blob", bytes.len().to_string().as_bytes()]);
            let body = sha384(&[bytes]);
            sha384(&[&tag, &body])
        }
        DeepHashItem::List(children) => {
            let mut acc = sha384(&[b"list", children.len().to_string().as_bytes()]);
            for child in children {
                let child_hash = deep_hash(child);
                acc = sha384(&[&acc, &child_hash]);
            }
            acc
        }
    }
}
