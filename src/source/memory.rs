//! In-memory chunk source

use super::{Chunk, ChunkSource, SourceError};
use crate::graph::ChunkId;
use async_trait::async_trait;
use dashmap::{DashMap, DashSet};

/// Chunk source backed by process memory
///
/// Collections keep insertion order. A collection can be marked unavailable
/// to simulate an unreachable corpus partition.
#[derive(Debug, Default)]
pub struct MemorySource {
    collections: DashMap<String, Vec<Chunk>>,
    unavailable: DashSet<String>,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk; a repeated id replaces the earlier text in place
    pub fn insert(&self, chunk: Chunk) {
        let mut chunks = self.collections.entry(chunk.collection.clone()).or_default();
        match chunks.iter_mut().find(|c| c.chunk_id == chunk.chunk_id) {
            Some(existing) => existing.text = chunk.text,
            None => chunks.push(chunk),
        }
    }

    pub fn with_chunk(
        self,
        collection: impl Into<String>,
        chunk_id: impl Into<ChunkId>,
        text: impl Into<String>,
    ) -> Self {
        self.insert(Chunk::new(collection, chunk_id, text));
        self
    }

    pub fn mark_unavailable(&self, collection: &str) {
        self.unavailable.insert(collection.to_string());
    }

    pub fn mark_available(&self, collection: &str) {
        self.unavailable.remove(collection);
    }

    pub fn len(&self, collection: &str) -> usize {
        self.collections.get(collection).map(|c| c.len()).unwrap_or(0)
    }

    fn check_available(&self, collection: &str) -> Result<(), SourceError> {
        if self.unavailable.contains(collection) {
            return Err(SourceError::Unavailable {
                collection: collection.to_string(),
                reason: "marked unavailable".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl ChunkSource for MemorySource {
    async fn list_chunk_ids(&self, collection: &str) -> Result<Vec<ChunkId>, SourceError> {
        self.check_available(collection)?;
        Ok(self
            .collections
            .get(collection)
            .map(|chunks| chunks.iter().map(|c| c.chunk_id.clone()).collect())
            .unwrap_or_default())
    }

    async fn fetch_chunk_text(&self, collection: &str, chunk_id: &str) -> Result<String, SourceError> {
        self.check_available(collection)?;
        self.collections
            .get(collection)
            .and_then(|chunks| {
                chunks
                    .iter()
                    .find(|c| c.chunk_id == chunk_id)
                    .map(|c| c.text.clone())
            })
            .ok_or_else(|| SourceError::ChunkNotFound {
                collection: collection.to_string(),
                chunk_id: chunk_id.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn lists_in_insertion_order() {
        let source = MemorySource::new()
            .with_chunk("kbli", "k2", "second")
            .with_chunk("kbli", "k1", "first")
            .with_chunk("perizinan", "p1", "other");

        assert_eq!(source.list_chunk_ids("kbli").await.unwrap(), vec!["k2", "k1"]);
        assert_eq!(source.fetch_chunk_text("kbli", "k1").await.unwrap(), "first");
        assert_eq!(source.len("perizinan"), 1);
    }

    #[tokio::test]
    async fn unknown_collection_is_empty() {
        let source = MemorySource::new();
        assert!(source.list_chunk_ids("nothing").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn missing_chunk_is_not_found() {
        let source = MemorySource::new().with_chunk("kbli", "k1", "text");
        let err = source.fetch_chunk_text("kbli", "k9").await.unwrap_err();
        assert!(matches!(err, SourceError::ChunkNotFound { .. }));
    }

    #[tokio::test]
    async fn repeated_id_replaces_text() {
        let source = MemorySource::new()
            .with_chunk("kbli", "k1", "old")
            .with_chunk("kbli", "k1", "new");
        assert_eq!(source.len("kbli"), 1);
        assert_eq!(source.fetch_chunk_text("kbli", "k1").await.unwrap(), "new");
    }

    #[tokio::test]
    async fn unavailable_collection_errors_until_restored() {
        let source = MemorySource::new().with_chunk("kbli", "k1", "text");
        source.mark_unavailable("kbli");

        let err = source.list_chunk_ids("kbli").await.unwrap_err();
        assert!(matches!(err, SourceError::Unavailable { .. }));

        source.mark_available("kbli");
        assert_eq!(source.list_chunk_ids("kbli").await.unwrap().len(), 1);
    }
}
