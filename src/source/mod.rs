//! Chunk sources
//!
//! The corpus is external and read-only. The pipeline only needs to list the
//! chunk ids of a collection and fetch one chunk's text at a time.

mod jsonl;
mod memory;

pub use jsonl::JsonlSource;
pub use memory::MemorySource;

use crate::graph::ChunkId;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// An immutable unit of source text
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    pub chunk_id: ChunkId,
    pub collection: String,
    pub text: String,
}

impl Chunk {
    pub fn new(
        collection: impl Into<String>,
        chunk_id: impl Into<ChunkId>,
        text: impl Into<String>,
    ) -> Self {
        Self {
            chunk_id: chunk_id.into(),
            collection: collection.into(),
            text: text.into(),
        }
    }
}

/// Errors from a chunk source
#[derive(Debug, Error)]
pub enum SourceError {
    /// The collection as a whole cannot be reached
    #[error("Collection '{collection}' unavailable: {reason}")]
    Unavailable { collection: String, reason: String },

    #[error("Chunk '{chunk_id}' not found in collection '{collection}'")]
    ChunkNotFound { collection: String, chunk_id: ChunkId },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed record at {}:{line}: {reason}", .path.display())]
    Malformed {
        path: PathBuf,
        line: usize,
        reason: String,
    },
}

/// Query-by-collection access to the chunk corpus
#[async_trait]
pub trait ChunkSource: Send + Sync {
    /// Every chunk id in the collection, in corpus order
    async fn list_chunk_ids(&self, collection: &str) -> Result<Vec<ChunkId>, SourceError>;

    /// Text of a single chunk
    async fn fetch_chunk_text(&self, collection: &str, chunk_id: &str) -> Result<String, SourceError>;
}
