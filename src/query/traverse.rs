//! Graph traversal operations

use super::types::{Direction, QueryOutcome, Subgraph};
use crate::extract::Resolver;
use crate::graph::{Entity, EntityId, Relationship, RelationshipId, RelationshipType};
use crate::storage::{GraphStore, StorageResult};
use std::collections::{HashMap, HashSet};

/// Query for the subgraph around a named entity
#[derive(Debug, Clone)]
pub struct GraphQuery {
    /// Seed entity name, matched exactly first, then by canonical key
    pub seed: String,
    /// Maximum hops from the seed (0 = seed only)
    pub max_depth: usize,
    /// Direction to traverse edges
    pub direction: Direction,
    /// Optional relationship type filter
    pub relationship: Option<RelationshipType>,
    /// Minimum edge confidence filter
    pub min_confidence: Option<f64>,
}

impl GraphQuery {
    /// Create a new query seeded at an entity name
    pub fn seed(name: impl Into<String>) -> Self {
        Self {
            seed: name.into(),
            max_depth: 1,
            direction: Direction::Both,
            relationship: None,
            min_confidence: None,
        }
    }

    /// Set the maximum traversal depth
    pub fn depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        self
    }

    /// Set the traversal direction
    pub fn direction(mut self, direction: Direction) -> Self {
        self.direction = direction;
        self
    }

    /// Filter by relationship type
    pub fn with_relationship(mut self, relationship: impl AsRef<str>) -> Self {
        self.relationship = Some(RelationshipType::parse(relationship.as_ref()));
        self
    }

    /// Filter by minimum edge confidence
    pub fn min_confidence(mut self, min_confidence: f64) -> Self {
        self.min_confidence = Some(min_confidence);
        self
    }

    /// Execute with plain name normalization
    pub fn execute(&self, store: &dyn GraphStore) -> StorageResult<QueryOutcome> {
        self.execute_with(store, &Resolver::new())
    }

    /// Execute, resolving the seed through `resolver` (synonyms and aliases)
    pub fn execute_with(&self, store: &dyn GraphStore, resolver: &Resolver) -> StorageResult<QueryOutcome> {
        let seeds = self.resolve_seeds(store, resolver)?;
        if seeds.is_empty() {
            return Ok(QueryOutcome::NotFound {
                name: self.seed.clone(),
            });
        }

        let mut subgraph = Subgraph::default();
        let mut adjacency: HashMap<EntityId, Vec<Relationship>> = HashMap::new();
        let mut frontier: Vec<EntityId> = Vec::new();

        for seed in seeds {
            if subgraph.depth_of.insert(seed.id, 0).is_none() {
                subgraph.seeds.push(seed.id);
                frontier.push(seed.id);
                subgraph.nodes.push(seed);
            }
        }

        // BFS traversal
        for depth in 1..=self.max_depth {
            let mut next: Vec<EntityId> = Vec::new();

            for id in &frontier {
                self.load_adjacent(store, id, &mut adjacency)?;
                let Some(edges) = adjacency.get(id) else {
                    continue;
                };

                for edge in edges {
                    let Some(neighbor) = edge.other_end(id) else {
                        continue;
                    };
                    if subgraph.depth_of.contains_key(neighbor) {
                        continue;
                    }
                    if let Some(entity) = store.load_entity(neighbor)? {
                        subgraph.depth_of.insert(*neighbor, depth);
                        next.push(*neighbor);
                        subgraph.nodes.push(entity);
                    }
                }
            }

            if next.is_empty() {
                break;
            }
            frontier = next;
        }

        // Every filtered edge between two visited nodes, once
        let visited: Vec<EntityId> = subgraph.nodes.iter().map(|n| n.id).collect();
        let mut seen: HashSet<RelationshipId> = HashSet::new();
        for id in &visited {
            self.load_adjacent(store, id, &mut adjacency)?;
            if let Some(edges) = adjacency.get(id) {
                for edge in edges {
                    if subgraph.contains(&edge.source)
                        && subgraph.contains(&edge.target)
                        && seen.insert(edge.id)
                    {
                        subgraph.edges.push(edge.clone());
                    }
                }
            }
        }

        Ok(QueryOutcome::Found(subgraph))
    }

    fn resolve_seeds(&self, store: &dyn GraphStore, resolver: &Resolver) -> StorageResult<Vec<Entity>> {
        let exact = store.find_entities_by_name(self.seed.trim())?;
        if !exact.is_empty() {
            return Ok(exact);
        }
        let key = resolver.canonical_key(&self.seed);
        if key.is_empty() {
            return Ok(Vec::new());
        }
        store.find_entities_by_key(&key)
    }

    /// Fetch and filter a node's edges once per query
    fn load_adjacent(
        &self,
        store: &dyn GraphStore,
        id: &EntityId,
        adjacency: &mut HashMap<EntityId, Vec<Relationship>>,
    ) -> StorageResult<()> {
        if adjacency.contains_key(id) {
            return Ok(());
        }
        let mut edges = match self.direction {
            Direction::Outgoing => store.relationships_from(id)?,
            Direction::Incoming => store.relationships_to(id)?,
            Direction::Both => {
                let mut edges = store.relationships_from(id)?;
                edges.extend(store.relationships_to(id)?);
                edges
            }
        };
        edges.retain(|edge| self.edge_matches(edge));
        adjacency.insert(*id, edges);
        Ok(())
    }

    /// Check if an edge matches the query filters
    fn edge_matches(&self, edge: &Relationship) -> bool {
        if let Some(ref rel) = self.relationship {
            if &edge.relationship_type != rel {
                return false;
            }
        }

        if let Some(min) = self.min_confidence {
            if edge.confidence < min {
                return false;
            }
        }

        true
    }
}
