//! chunkgraph: Incremental Knowledge Graph Extraction
//!
//! Mines a typed knowledge graph from collections of text chunks with an
//! LLM-based extractor, merging every observation into a persistent store.
//!
//! # Core Concepts
//!
//! - **Entities**: typed nodes with deterministic ids derived from a canonical name
//! - **Relationships**: typed, directed edges reinforced by every chunk that repeats them
//! - **Ledger**: the set of chunks already merged, so no chunk is extracted twice
//!
//! # Example
//!
//! ```
//! use chunkgraph::{GraphQuery, OpenStore, SqliteStore};
//!
//! let store = SqliteStore::open_in_memory().unwrap();
//! let outcome = GraphQuery::seed("PT PMA").depth(2).execute(&store).unwrap();
//! assert!(!outcome.is_found());
//! ```

pub mod config;
pub mod extract;
pub mod graph;
pub mod pipeline;
pub mod query;
pub mod source;
pub mod storage;

pub use config::{CollectionSpec, ConfigError, PipelineConfig};
pub use extract::{Extraction, ExtractError, Extractor, LlmExtractor, MockClient, OllamaClient, Resolver};
pub use graph::{
    chunk_ref, ChunkCommit, ChunkId, ConfidencePolicy, Entity, EntityId, EntityType, MergePolicy, PropertyValue,
    Relationship, RelationshipId, RelationshipType,
};
pub use pipeline::{CancellationToken, ChunkError, CollectionStats, Pipeline, PipelineError, RunRequest, RunStats};
pub use query::{Direction, GraphQuery, QueryOutcome, Subgraph};
pub use source::{Chunk, ChunkSource, JsonlSource, MemorySource, SourceError};
pub use storage::{GraphStats, GraphStore, OpenStore, SqliteStore, StorageError, StorageResult};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
