pub mod keys;
pub mod migrate;
pub mod operations;
pub mod trees;

use serde::de::DeserializeOwned;
use serde::Serialize;
use sled::Db;
use thiserror::Error;

/// Sled-backed persistence for the snapshot usage engine.
///
/// Three logical relations per feed (entities, snapshots, facts) plus the
/// indexes that make natural-key resolution and window scans cheap. All
/// values are JSON.
#[derive(Debug)]
pub struct Store {
    db: Db,
    pub entities: sled::Tree,
    pub entity_keys: sled::Tree,
    pub snapshots: sled::Tree,
    pub snapshot_dedup: sled::Tree,
    pub facts: sled::Tree,
    pub facts_by_ts: sled::Tree,
    pub inputs: sled::Tree,
    pub meta: sled::Tree,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sled error: {0}")]
    Sled(#[from] sled::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("conflict: entity={entity}, key={key}")]
    Conflict { entity: String, key: String },
    #[error("CAS retry exhausted after {attempts} attempts: entity={entity}, key={key}")]
    CasRetryExhausted {
        entity: String,
        key: String,
        attempts: u32,
    },
    #[error("validation error: {0}")]
    Validation(String),
    #[error("migration error at version {version}: {message}")]
    Migration { version: u32, message: String },
}

impl Store {
    pub fn open(sled_path: &str) -> Result<Self, StoreError> {
        let db = sled::open(sled_path)?;
        let entities = db.open_tree(trees::ENTITIES)?;
        let entity_keys = db.open_tree(trees::ENTITY_KEYS)?;
        let snapshots = db.open_tree(trees::SNAPSHOTS)?;
        let snapshot_dedup = db.open_tree(trees::SNAPSHOT_DEDUP)?;
        let facts = db.open_tree(trees::FACTS)?;
        let facts_by_ts = db.open_tree(trees::FACTS_BY_TS)?;
        let inputs = db.open_tree(trees::INPUTS)?;
        let meta = db.open_tree(trees::META)?;

        Ok(Self {
            db,
            entities,
            entity_keys,
            snapshots,
            snapshot_dedup,
            facts,
            facts_by_ts,
            inputs,
            meta,
        })
    }

    pub fn run_migrations(&self) -> Result<(), StoreError> {
        migrate::run(self)
    }

    pub fn flush(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }

    pub fn raw_db(&self) -> &Db {
        &self.db
    }

    pub(crate) fn serialize<T: Serialize>(value: &T) -> Result<Vec<u8>, StoreError> {
        Ok(serde_json::to_vec(value)?)
    }

    pub(crate) fn deserialize<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, StoreError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}
