//! Store wrapper that injects persistence failures
//!
//! Delegates to a real `SqliteStore`. Commits for chosen chunk ids always
//! fail with a transient I/O error. An outage can be armed to start at the
//! first commit, after which every call fails, `ping` included.

use chrono::NaiveDate;
use chunkgraph::storage::CommitOutcome;
use chunkgraph::{
    ChunkCommit, ChunkId, Entity, EntityId, GraphStats, GraphStore, MergePolicy, Relationship, RelationshipId,
    SqliteStore, StorageError, StorageResult,
};
use dashmap::{DashMap, DashSet};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub struct FaultyStore {
    inner: Arc<SqliteStore>,
    failing_chunks: DashSet<String>,
    commit_attempts: DashMap<String, u32>,
    outage_on_commit: AtomicBool,
    down: AtomicBool,
    lock_releases: AtomicUsize,
}

fn disk_error() -> StorageError {
    StorageError::Io(std::io::Error::new(std::io::ErrorKind::Other, "disk I/O error"))
}

impl FaultyStore {
    pub fn new(inner: Arc<SqliteStore>) -> Self {
        Self {
            inner,
            failing_chunks: DashSet::new(),
            commit_attempts: DashMap::new(),
            outage_on_commit: AtomicBool::new(false),
            down: AtomicBool::new(false),
            lock_releases: AtomicUsize::new(0),
        }
    }

    /// Every commit of `chunk_id` fails
    pub fn fail_commits_for(self, chunk_id: &str) -> Self {
        self.failing_chunks.insert(chunk_id.to_string());
        self
    }

    /// The whole store goes down at the first commit
    pub fn outage_on_first_commit(self) -> Self {
        self.outage_on_commit.store(true, Ordering::SeqCst);
        self
    }

    pub fn commit_attempts(&self, chunk_id: &str) -> u32 {
        self.commit_attempts.get(chunk_id).map(|n| *n).unwrap_or(0)
    }

    pub fn lock_releases(&self) -> usize {
        self.lock_releases.load(Ordering::SeqCst)
    }

    fn check(&self) -> StorageResult<()> {
        if self.down.load(Ordering::SeqCst) {
            Err(disk_error())
        } else {
            Ok(())
        }
    }
}

impl GraphStore for FaultyStore {
    fn commit_chunk(&self, commit: &ChunkCommit, policy: &MergePolicy) -> StorageResult<CommitOutcome> {
        *self.commit_attempts.entry(commit.chunk_id.clone()).or_insert(0) += 1;
        if self.outage_on_commit.load(Ordering::SeqCst) {
            self.down.store(true, Ordering::SeqCst);
        }
        self.check()?;
        if self.failing_chunks.contains(&commit.chunk_id) {
            return Err(disk_error());
        }
        self.inner.commit_chunk(commit, policy)
    }

    fn processed_chunk_ids(&self, collection: &str) -> StorageResult<HashSet<ChunkId>> {
        self.check()?;
        self.inner.processed_chunk_ids(collection)
    }

    fn is_chunk_processed(&self, collection: &str, chunk_id: &str) -> StorageResult<bool> {
        self.check()?;
        self.inner.is_chunk_processed(collection, chunk_id)
    }

    fn load_entity(&self, id: &EntityId) -> StorageResult<Option<Entity>> {
        self.check()?;
        self.inner.load_entity(id)
    }

    fn find_entities_by_name(&self, name: &str) -> StorageResult<Vec<Entity>> {
        self.check()?;
        self.inner.find_entities_by_name(name)
    }

    fn find_entities_by_key(&self, canonical_key: &str) -> StorageResult<Vec<Entity>> {
        self.check()?;
        self.inner.find_entities_by_key(canonical_key)
    }

    fn delete_entity(&self, id: &EntityId) -> StorageResult<bool> {
        self.check()?;
        self.inner.delete_entity(id)
    }

    fn load_relationship(&self, id: &RelationshipId) -> StorageResult<Option<Relationship>> {
        self.check()?;
        self.inner.load_relationship(id)
    }

    fn relationships_from(&self, id: &EntityId) -> StorageResult<Vec<Relationship>> {
        self.check()?;
        self.inner.relationships_from(id)
    }

    fn relationships_to(&self, id: &EntityId) -> StorageResult<Vec<Relationship>> {
        self.check()?;
        self.inner.relationships_to(id)
    }

    fn usage_on(&self, pipeline: &str, day: NaiveDate) -> StorageResult<u64> {
        self.check()?;
        self.inner.usage_on(pipeline, day)
    }

    fn record_usage(&self, pipeline: &str, day: NaiveDate, chunks: u64) -> StorageResult<u64> {
        self.check()?;
        self.inner.record_usage(pipeline, day, chunks)
    }

    fn acquire_run_lock(&self, pipeline: &str, holder: &str, ttl: Duration) -> StorageResult<()> {
        self.check()?;
        self.inner.acquire_run_lock(pipeline, holder, ttl)
    }

    fn release_run_lock(&self, pipeline: &str, holder: &str) -> StorageResult<bool> {
        self.lock_releases.fetch_add(1, Ordering::SeqCst);
        self.check()?;
        self.inner.release_run_lock(pipeline, holder)
    }

    fn stats(&self) -> StorageResult<GraphStats> {
        self.check()?;
        self.inner.stats()
    }

    fn ping(&self) -> StorageResult<()> {
        self.check()?;
        self.inner.ping()
    }
}
