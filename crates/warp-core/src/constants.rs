//! Protocol constants shared by every stage of the pipeline.

/// Transaction format whose signature layout [`crate::crypto::signature_data`] implements.
pub const TX_FORMAT: u8 = 2;

/// Size of an Ed25519 owner key in bytes.
pub const OWNER_KEY_SIZE: usize = 32;

/// Size of a transaction signature in bytes.
pub const SIGNATURE_SIZE: usize = 64;

/// Size of a transaction identifier (`SHA-256(signature)`).
pub const TX_ID_SIZE: usize = 32;

/// Size of a block identifier (deep hash, SHA-384).
pub const BLOCK_HASH_SIZE: usize = 48;

/// Largest chunk the data root is computed over.
pub const MAX_CHUNK_SIZE: usize = 256 * 1024;

/// Smallest chunk the data root allows, except for a single-chunk payload.
pub const MIN_CHUNK_SIZE: usize = 32 * 1024;

/// Width of the big-endian offset note mixed into merkle nodes.
pub const NOTE_SIZE: usize = 32;

/// Tag naming the application a transaction belongs to.
pub const TAG_APP_NAME: &str = "App-Name";

/// Tag carrying the contract an interaction targets.
pub const TAG_CONTRACT: &str = "Contract";

/// Tag carrying the JSON input of an interaction.
pub const TAG_INPUT: &str = "Input";

/// `App-Name` value of contract interactions.
pub const APP_NAME_INTERACTION: &str = "SmartWeaveAction";

/// `App-Name` value of contract deployments.
pub const APP_NAME_CONTRACT: &str = "SmartWeaveContract";
