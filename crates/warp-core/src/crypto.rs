//! Ed25519 transaction signatures and payload integrity.
//!
//! # Signing scheme
//!
//! A format-2 transaction signs the deep hash of
//! `["2", owner, target, quantity, reward, last_tx, [[name, value], ...], data_size, data_root]`
//! with the key in `owner`. The transaction id is `SHA-256(signature)`, so an
//! id can never be reused with a different signature.

use ed25519_dalek::{Signer, Verifier};
use sha2::{Digest, Sha256};
use std::fmt;

use crate::constants::{OWNER_KEY_SIZE, SIGNATURE_SIZE, TX_FORMAT};
use crate::deep_hash::{DeepHash, DeepHashItem, deep_hash};
use crate::error::{CryptoError, TransactionError};
use crate::merkle::data_root;
use crate::types::{Base64Url, Transaction};

/// Ed25519 keypair for signing transactions.
///
/// Wraps [`ed25519_dalek::SigningKey`]; the secret is zeroized on drop.
pub struct KeyPair {
    signing_key: ed25519_dalek::SigningKey,
}

impl KeyPair {
    /// Generate a random keypair using the OS RNG.
    pub fn generate() -> Self {
        let mut csprng = rand::rngs::OsRng;
        Self {
            signing_key: ed25519_dalek::SigningKey::generate(&mut csprng),
        }
    }

    pub fn from_secret_bytes(bytes: [u8; 32]) -> Self {
        Self {
            signing_key: ed25519_dalek::SigningKey::from_bytes(&bytes),
        }
    }

    pub fn public_key(&self) -> PublicKey {
        PublicKey {
            verifying_key: self.signing_key.verifying_key(),
        }
    }

    /// Sign a message, returning the raw 64-byte signature.
    pub fn sign(&self, message: &[u8]) -> [u8; 64] {
        self.signing_key.sign(message).to_bytes()
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("public_key", &self.public_key())
            .finish_non_exhaustive()
    }
}

/// Ed25519 public key carried in a transaction's `owner` field.
#[derive(Clone, PartialEq, Eq)]
pub struct PublicKey {
    verifying_key: ed25519_dalek::VerifyingKey,
}

impl PublicKey {
    /// Parse an owner key. Fails on wrong length or an invalid curve point.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, CryptoError> {
        let raw: &[u8; OWNER_KEY_SIZE] = bytes.try_into().map_err(|_| CryptoError::InvalidPublicKey)?;
        let vk = ed25519_dalek::VerifyingKey::from_bytes(raw).map_err(|_| CryptoError::InvalidPublicKey)?;
        Ok(Self { verifying_key: vk })
    }

    pub fn to_bytes(&self) -> [u8; 32] {
        self.verifying_key.to_bytes()
    }

    /// Verify an Ed25519 signature given as raw bytes.
    pub fn verify(&self, message: &[u8], signature: &[u8]) -> Result<(), CryptoError> {
        let raw: &[u8; SIGNATURE_SIZE] = signature.try_into().map_err(|_| CryptoError::InvalidSignature)?;
        let sig = ed25519_dalek::Signature::from_bytes(raw);
        self.verifying_key
            .verify(message, &sig)
            .map_err(|_| CryptoError::VerificationFailed)
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", hex::encode(self.to_bytes()))
    }
}

/// Address of an owner key: `SHA-256(owner)`.
pub fn owner_address(owner: &[u8]) -> Base64Url {
    Base64Url(Sha256::digest(owner).to_vec())
}

/// Transaction id implied by a signature: `SHA-256(signature)`.
pub fn transaction_id(signature: &[u8]) -> Base64Url {
    Base64Url(Sha256::digest(signature).to_vec())
}

/// The message a format-2 transaction's signature covers.
pub fn signature_data(tx: &Transaction) -> DeepHash {
    let tags = tx.tags.iter().map(|tag| {
        DeepHashItem::list([
            DeepHashItem::blob(tag.name.as_bytes()),
            DeepHashItem::blob(tag.value.as_bytes()),
        ])
    });

    deep_hash(&DeepHashItem::list([
        DeepHashItem::blob(TX_FORMAT.to_string()),
        DeepHashItem::blob(tx.owner.as_bytes()),
        DeepHashItem::blob(tx.target.as_bytes()),
        DeepHashItem::blob(tx.quantity.as_str()),
        DeepHashItem::blob(tx.reward.as_str()),
        DeepHashItem::blob(tx.last_tx.as_bytes()),
        DeepHashItem::list(tags),
        DeepHashItem::blob(tx.data_size.as_str()),
        DeepHashItem::blob(tx.data_root.as_bytes()),
    ]))
}

/// Fill in `owner`, `signature` and `id` by signing `tx` with `key`.
///
/// Any inline `data` should already have matching `data_size` and `data_root`.
pub fn sign_transaction(tx: &mut Transaction, key: &KeyPair) {
    tx.format = TX_FORMAT;
    tx.owner = Base64Url(key.public_key().to_bytes().to_vec());
    let signature = key.sign(&signature_data(tx));
    tx.id = transaction_id(&signature);
    tx.signature = Base64Url(signature.to_vec());
}

/// Check format, id binding and signature of `tx`.
pub fn verify_transaction(tx: &Transaction) -> Result<(), TransactionError> {
    if tx.format != TX_FORMAT {
        return Err(TransactionError::UnsupportedFormat(tx.format));
    }

    let expected_id = transaction_id(tx.signature.as_bytes());
    if expected_id != tx.id {
        return Err(TransactionError::IdMismatch(tx.id.to_string()));
    }

    let bad_signature = |source| TransactionError::BadSignature {
        id: tx.id.to_string(),
        source,
    };
    let owner = PublicKey::from_slice(tx.owner.as_bytes()).map_err(bad_signature)?;
    owner
        .verify(&signature_data(tx), tx.signature.as_bytes())
        .map_err(bad_signature)
}

/// Check that `data` is the payload `tx` committed to.
///
/// Transactions with an empty `data_root` only have their size checked.
pub fn verify_transaction_data(tx: &Transaction, data: &[u8]) -> Result<(), TransactionError> {
    let declared = tx.declared_data_size();
    let got = data.len() as u64;
    if declared != got {
        return Err(TransactionError::DataSizeMismatch { declared, got });
    }

    if tx.data_root.is_empty() {
        return Ok(());
    }
    match data_root(data) {
        Some(root) if root.as_slice() == tx.data_root.as_bytes() => Ok(()),
        _ => Err(TransactionError::DataRootMismatch(tx.id.to_string())),
    }
}
