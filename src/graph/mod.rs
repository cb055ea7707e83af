//! Core graph data structures and merge rules

mod edge;
pub mod merge;
mod node;


pub use edge::{Relationship, RelationshipId, RelationshipType};
pub use merge::{ChunkCommit, ConfidencePolicy, MergePolicy};
pub use node::{chunk_ref, ChunkId, Entity, EntityId, EntityType, Properties, PropertyValue};
