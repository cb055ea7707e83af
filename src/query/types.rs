//! Query types and result structures

use crate::graph::{Entity, EntityId, Relationship};
use serde::Serialize;
use std::collections::BTreeMap;

/// Direction for edge traversal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// Follow outgoing edges (source -> target)
    Outgoing,
    /// Follow incoming edges (target <- source)
    Incoming,
    /// Follow edges in both directions
    #[default]
    Both,
}

/// Connected subgraph around one or more seed entities
#[derive(Debug, Clone, Default, Serialize)]
pub struct Subgraph {
    /// Entities the seed name resolved to
    pub seeds: Vec<EntityId>,
    /// Visited entities in BFS order, each exactly once
    pub nodes: Vec<Entity>,
    /// Edges whose endpoints were both visited, each exactly once
    pub edges: Vec<Relationship>,
    /// Hop distance of every visited entity from the nearest seed
    pub depth_of: BTreeMap<EntityId, usize>,
}

impl Subgraph {
    pub fn contains(&self, id: &EntityId) -> bool {
        self.depth_of.contains_key(id)
    }

    /// Nodes exactly `depth` hops from a seed
    pub fn at_depth(&self, depth: usize) -> Vec<&Entity> {
        self.nodes
            .iter()
            .filter(|n| self.depth_of.get(&n.id) == Some(&depth))
            .collect()
    }

    pub fn node_by_name(&self, name: &str) -> Option<&Entity> {
        self.nodes.iter().find(|n| n.name == name)
    }

    /// Greatest hop distance reached
    pub fn max_depth(&self) -> usize {
        self.depth_of.values().copied().max().unwrap_or(0)
    }
}

/// Result of a graph query
///
/// `NotFound` is distinct from a `Found` subgraph holding only the seed, so
/// callers can tell "no such entity" from "entity with no connections".
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum QueryOutcome {
    Found(Subgraph),
    NotFound { name: String },
}

impl QueryOutcome {
    pub fn is_found(&self) -> bool {
        matches!(self, QueryOutcome::Found(_))
    }

    pub fn subgraph(&self) -> Option<&Subgraph> {
        match self {
            QueryOutcome::Found(subgraph) => Some(subgraph),
            QueryOutcome::NotFound { .. } => None,
        }
    }

    pub fn into_subgraph(self) -> Option<Subgraph> {
        match self {
            QueryOutcome::Found(subgraph) => Some(subgraph),
            QueryOutcome::NotFound { .. } => None,
        }
    }
}
