//! Storage backends for chunkgraph
//!
//! The pipeline and query layers only see the `GraphStore` trait.
//! The primary implementation is `SqliteStore` for persistent storage.

mod sqlite;
mod traits;

pub use sqlite::SqliteStore;
pub use traits::{CommitOutcome, GraphStats, GraphStore, OpenStore, StorageError, StorageResult};
