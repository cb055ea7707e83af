//! Query system for chunkgraph knowledge graphs
//!
//! Bounded-depth traversal from a named seed entity, read straight from
//! the store.

mod traverse;
mod types;

pub use traverse::GraphQuery;
pub use types::{Direction, QueryOutcome, Subgraph};
