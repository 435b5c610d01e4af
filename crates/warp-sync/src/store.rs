//! Durable record and checkpoint storage.
//!
//! [`RocksStore`] keeps records in the `interactions` column family keyed
//! by sort key, and one checkpoint per pipeline component in `sync_state`.
//! A flush is one atomic [`WriteBatch`], so a checkpoint never lands
//! without the records that produced it.

use parking_lot::Mutex;
use rocksdb::{ColumnFamilyDescriptor, DB, IteratorMode, Options, WriteBatch};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use warp_core::types::Checkpoint;

use crate::error::StoreError;
use crate::interaction::Interaction;

pub trait Store: Send + Sync {
    /// Last durable checkpoint of `component`.
    fn last_checkpoint(&self, component: &str) -> Result<Option<Checkpoint>, StoreError>;

    /// Write `records` and, if given, advance `component`'s checkpoint, atomically.
    fn persist(&self, component: &str, records: &[Interaction], checkpoint: Option<&Checkpoint>) -> Result<(), StoreError>;
}

// --- Column family names ---

const CF_INTERACTIONS: &str = "interactions";
const CF_SYNC_STATE: &str = "sync_state";

const ALL_CFS: &[&str] = &[CF_INTERACTIONS, CF_SYNC_STATE];

pub struct RocksStore {
    db: DB,
}

impl RocksStore {
    /// Open or create a database at `path` with every column family present.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = ALL_CFS
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Options::default()))
            .collect();

        let db = DB::open_cf_descriptors(&db_opts, path.as_ref(), cf_descriptors)
            .map_err(|e| StoreError::Storage(e.to_string()))?;
        Ok(Self { db })
    }

    /// Record stored under `sort_key`.
    pub fn get_interaction(&self, sort_key: &str) -> Result<Option<Interaction>, StoreError> {
        let cf = self.cf_handle(CF_INTERACTIONS)?;
        match self
            .db
            .get_cf(cf, sort_key.as_bytes())
            .map_err(|e| StoreError::Storage(e.to_string()))?
        {
            Some(bytes) => decode(&bytes).map(Some),
            None => Ok(None),
        }
    }

    /// Every stored record in sort-key order.
    pub fn interactions(&self) -> Result<Vec<Interaction>, StoreError> {
        let cf = self.cf_handle(CF_INTERACTIONS)?;
        self.db
            .iterator_cf(cf, IteratorMode::Start)
            .map(|item| {
                let (_, value) = item.map_err(|e| StoreError::Storage(e.to_string()))?;
                decode(&value)
            })
            .collect()
    }

    pub fn flush(&self) -> Result<(), StoreError> {
        self.db.flush().map_err(|e| StoreError::Storage(e.to_string()))
    }

    fn cf_handle(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::MissingColumnFamily(name.to_string()))
    }
}

impl Store for RocksStore {
    fn last_checkpoint(&self, component: &str) -> Result<Option<Checkpoint>, StoreError> {
        let cf = self.cf_handle(CF_SYNC_STATE)?;
        match self
            .db
            .get_cf(cf, component.as_bytes())
            .map_err(|e| StoreError::Storage(e.to_string()))?
        {
            Some(bytes) => decode(&bytes).map(Some),
            None => Ok(None),
        }
    }

    fn persist(&self, component: &str, records: &[Interaction], checkpoint: Option<&Checkpoint>) -> Result<(), StoreError> {
        let cf_records = self.cf_handle(CF_INTERACTIONS)?;
        let cf_state = self.cf_handle(CF_SYNC_STATE)?;

        let mut batch = WriteBatch::default();
        for record in records {
            batch.put_cf(cf_records, record.sort_key.as_bytes(), encode(record)?);
        }
        if let Some(checkpoint) = checkpoint {
            batch.put_cf(cf_state, component.as_bytes(), encode(checkpoint)?);
        }

        self.db
            .write(batch)
            .map_err(|e| StoreError::Storage(e.to_string()))
    }
}

fn encode<T: bincode::Encode>(value: &T) -> Result<Vec<u8>, StoreError> {
    bincode::encode_to_vec(value, bincode::config::standard()).map_err(|e| StoreError::Encoding(e.to_string()))
}

fn decode<T: bincode::Decode<()>>(bytes: &[u8]) -> Result<T, StoreError> {
    bincode::decode_from_slice(bytes, bincode::config::standard())
        .map(|(value, _)| value)
        .map_err(|e| StoreError::Encoding(e.to_string()))
}

/// In-memory store, optionally failing every write.
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: Mutex<BTreeMap<String, Interaction>>,
    checkpoints: Mutex<HashMap<String, Checkpoint>>,
    persists: Mutex<Vec<usize>>,
    fail_writes: Mutex<bool>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the checkpoint of `component`.
    pub fn with_checkpoint(self, component: &str, checkpoint: Checkpoint) -> Self {
        self.checkpoints.lock().insert(component.to_string(), checkpoint);
        self
    }

    pub fn set_fail_writes(&self, fail: bool) {
        *self.fail_writes.lock() = fail;
    }

    pub fn records(&self) -> Vec<Interaction> {
        self.records.lock().values().cloned().collect()
    }

    /// Record count of every successful persist, in order.
    pub fn persist_sizes(&self) -> Vec<usize> {
        self.persists.lock().clone()
    }
}

impl Store for MemoryStore {
    fn last_checkpoint(&self, component: &str) -> Result<Option<Checkpoint>, StoreError> {
        Ok(self.checkpoints.lock().get(component).cloned())
    }

    fn persist(&self, component: &str, records: &[Interaction], checkpoint: Option<&Checkpoint>) -> Result<(), StoreError> {
        if *self.fail_writes.lock() {
            return Err(StoreError::Storage("write rejected".into()));
        }
        let mut stored = self.records.lock();
        for record in records {
            stored.insert(record.sort_key.clone(), record.clone());
        }
        if let Some(checkpoint) = checkpoint {
            self.checkpoints.lock().insert(component.to_string(), checkpoint.clone());
        }
        self.persists.lock().push(records.len());
        Ok(())
    }
}
