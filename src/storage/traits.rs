//! Storage trait definitions

use crate::graph::{ChunkCommit, ChunkId, Entity, EntityId, MergePolicy, Relationship, RelationshipId};
use chrono::NaiveDate;
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur during storage operations
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Date parsing error: {0}")]
    DateParse(String),

    #[error("Invalid stored id: {0}")]
    InvalidId(String),

    #[error("Relationship {relationship} references missing entity {entity}")]
    MissingEndpoint { relationship: String, entity: String },

    #[error("Run lock for '{pipeline}' is held by {holder}")]
    LockHeld { pipeline: String, holder: String },

    #[error("Store connection poisoned")]
    Poisoned,

    #[error("Blocking store task failed: {0}")]
    Task(String),
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// What a chunk commit changed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CommitOutcome {
    pub entities_created: usize,
    pub entities_merged: usize,
    pub relationships_created: usize,
    pub relationships_merged: usize,
}

/// Aggregate counts over the stored graph
#[derive(Debug, Clone, Default, Serialize)]
pub struct GraphStats {
    pub entities: usize,
    pub relationships: usize,
    pub entities_by_type: BTreeMap<String, usize>,
    pub relationships_by_type: BTreeMap<String, usize>,
    /// Ledgered chunks per collection
    pub processed_chunks: BTreeMap<String, usize>,
}

/// Trait for graph storage backends
///
/// Implementations must be thread-safe (Send + Sync); chunk commits arrive
/// concurrently from the batch scheduler.
pub trait GraphStore: Send + Sync {
    // === Merge/Upsert ===

    /// Merge one chunk's extraction in a single transaction.
    ///
    /// Entities are upserted before relationships, and the chunk is ledgered
    /// as processed for its collection in the same transaction. Any failure
    /// rolls back the whole chunk.
    fn commit_chunk(&self, commit: &ChunkCommit, policy: &MergePolicy) -> StorageResult<CommitOutcome>;

    // === Processed-set tracking ===

    /// All chunk ids already committed for a collection
    fn processed_chunk_ids(&self, collection: &str) -> StorageResult<HashSet<ChunkId>>;

    /// Point lookup against the processed set
    fn is_chunk_processed(&self, collection: &str, chunk_id: &str) -> StorageResult<bool>;

    // === Entity Operations ===

    fn load_entity(&self, id: &EntityId) -> StorageResult<Option<Entity>>;

    /// Entities whose display name matches exactly
    fn find_entities_by_name(&self, name: &str) -> StorageResult<Vec<Entity>>;

    /// Entities whose canonical (normalized) key matches
    fn find_entities_by_key(&self, canonical_key: &str) -> StorageResult<Vec<Entity>>;

    /// Delete an entity; its relationships cascade
    fn delete_entity(&self, id: &EntityId) -> StorageResult<bool>;

    // === Relationship Operations ===

    fn load_relationship(&self, id: &RelationshipId) -> StorageResult<Option<Relationship>>;

    /// Relationships originating from an entity
    fn relationships_from(&self, id: &EntityId) -> StorageResult<Vec<Relationship>>;

    /// Relationships targeting an entity
    fn relationships_to(&self, id: &EntityId) -> StorageResult<Vec<Relationship>>;

    // === Run bookkeeping ===

    /// Chunks consumed by a pipeline on a given UTC day
    fn usage_on(&self, pipeline: &str, day: NaiveDate) -> StorageResult<u64>;

    /// Add consumed chunks for a day, returning the new total
    fn record_usage(&self, pipeline: &str, day: NaiveDate, chunks: u64) -> StorageResult<u64>;

    /// Take the advisory run lock. Locks older than `ttl` are considered stale.
    fn acquire_run_lock(&self, pipeline: &str, holder: &str, ttl: Duration) -> StorageResult<()>;

    /// Release the run lock if `holder` owns it
    fn release_run_lock(&self, pipeline: &str, holder: &str) -> StorageResult<bool>;

    // === Diagnostics ===

    fn stats(&self) -> StorageResult<GraphStats>;

    /// Cheap liveness check used to tell an outage from a single bad write
    fn ping(&self) -> StorageResult<()>;
}

/// Extension trait for opening stores from paths
pub trait OpenStore: GraphStore + Sized {
    /// Open or create a store at the given path
    fn open(path: impl AsRef<Path>) -> StorageResult<Self>;

    /// Create an in-memory store (useful for testing)
    fn open_in_memory() -> StorageResult<Self>;
}
