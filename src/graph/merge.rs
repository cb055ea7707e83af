//! Merge rules for re-extracted entities and relationships
//!
//! Both the store (inside a chunk's transaction) and the in-chunk dedup pass
//! go through these functions, so stored state only changes one way.

use super::edge::Relationship;
use super::node::{ChunkId, Entity, EntityId, Properties};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Default corroboration increment
pub const DEFAULT_REINFORCEMENT_BONUS: f64 = 0.05;

/// Clamp a confidence into [0, 1]; NaN becomes 0
pub fn clamp_confidence(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}

/// How confidence evolves when an identity is seen again
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfidencePolicy {
    /// Corroboration by a new chunk adds the bonus to the stored value.
    /// The raw re-extracted confidence never overwrites it.
    #[default]
    Additive,
    /// Corroboration takes the higher of stored/extracted, then adds the bonus.
    MaxPlusBonus,
}

/// Tunable merge behavior
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MergePolicy {
    pub reinforcement_bonus: f64,
    pub confidence: ConfidencePolicy,
}

impl Default for MergePolicy {
    fn default() -> Self {
        Self {
            reinforcement_bonus: DEFAULT_REINFORCEMENT_BONUS,
            confidence: ConfidencePolicy::default(),
        }
    }
}

impl MergePolicy {
    /// Confidence after merging `extracted` into `stored`.
    ///
    /// `corroborated` is true when the incoming evidence comes from at least
    /// one chunk not already in the element's provenance.
    pub fn merged_confidence(&self, stored: f64, extracted: f64, corroborated: bool) -> f64 {
        let stored = clamp_confidence(stored);
        let extracted = clamp_confidence(extracted);
        let merged = match (self.confidence, corroborated) {
            (ConfidencePolicy::Additive, true) => stored + self.reinforcement_bonus,
            (ConfidencePolicy::Additive, false) => stored,
            (ConfidencePolicy::MaxPlusBonus, true) => {
                stored.max(extracted) + self.reinforcement_bonus
            }
            (ConfidencePolicy::MaxPlusBonus, false) => stored.max(extracted),
        };
        clamp_confidence(merged)
    }
}

fn is_corroborated(stored: &BTreeSet<String>, incoming: &BTreeSet<String>) -> bool {
    incoming.iter().any(|chunk| !stored.contains(chunk))
}

fn merge_properties(stored: &mut Properties, incoming: &Properties) {
    for (key, value) in incoming {
        stored.insert(key.clone(), value.clone());
    }
}

/// Keep the longer description; never shorten
fn merge_description(stored: &mut Option<String>, incoming: &Option<String>) {
    if let Some(new) = incoming {
        let longer = stored
            .as_ref()
            .map(|old| new.chars().count() > old.chars().count())
            .unwrap_or(true);
        if longer {
            *stored = Some(new.clone());
        }
    }
}

/// Merge a freshly extracted entity into the stored one
pub fn merge_entity(stored: &mut Entity, incoming: &Entity, policy: &MergePolicy) {
    let corroborated = is_corroborated(&stored.source_chunk_ids, &incoming.source_chunk_ids);
    stored.confidence = policy.merged_confidence(stored.confidence, incoming.confidence, corroborated);
    stored
        .source_chunk_ids
        .extend(incoming.source_chunk_ids.iter().cloned());
    merge_properties(&mut stored.properties, &incoming.properties);
    merge_description(&mut stored.description, &incoming.description);
    if corroborated {
        stored.source_collection = incoming.source_collection.clone();
    }
    stored.updated_at = Utc::now();
}

/// Merge a freshly extracted relationship into the stored one
pub fn merge_relationship(stored: &mut Relationship, incoming: &Relationship, policy: &MergePolicy) {
    let corroborated = is_corroborated(&stored.source_chunk_ids, &incoming.source_chunk_ids);
    stored.confidence = policy.merged_confidence(stored.confidence, incoming.confidence, corroborated);
    stored
        .source_chunk_ids
        .extend(incoming.source_chunk_ids.iter().cloned());
    merge_properties(&mut stored.properties, &incoming.properties);
    if corroborated {
        stored.source_collection = incoming.source_collection.clone();
    }
    stored.updated_at = Utc::now();
}

/// Everything one chunk contributes, committed as a single unit
#[derive(Debug, Clone, Default)]
pub struct ChunkCommit {
    pub collection: String,
    pub chunk_id: ChunkId,
    /// Upserted first
    pub entities: Vec<Entity>,
    /// Upserted after all entities; endpoints must exist in the store or in `entities`
    pub relationships: Vec<Relationship>,
    /// Entities named only as a relationship endpoint, with no type evidence.
    /// The store binds them to an existing typed entity with the same key.
    pub untyped: BTreeSet<EntityId>,
}

impl ChunkCommit {
    pub fn new(collection: impl Into<String>, chunk_id: impl Into<ChunkId>) -> Self {
        Self {
            collection: collection.into(),
            chunk_id: chunk_id.into(),
            entities: Vec::new(),
            relationships: Vec::new(),
            untyped: BTreeSet::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty() && self.relationships.is_empty()
    }

    /// Collapse repeated mentions of one identity within this chunk.
    ///
    /// Repeats inside a single chunk are not corroboration: the highest
    /// confidence wins and no bonus is applied.
    pub fn fold_duplicates(mut self) -> Self {
        let mut entities: BTreeMap<_, Entity> = BTreeMap::new();
        let mut order = Vec::new();
        for entity in self.entities.drain(..) {
            match entities.get_mut(&entity.id) {
                Some(existing) => {
                    existing.confidence = existing.confidence.max(entity.confidence);
                    merge_properties(&mut existing.properties, &entity.properties);
                    merge_description(&mut existing.description, &entity.description);
                }
                None => {
                    order.push(entity.id);
                    entities.insert(entity.id, entity);
                }
            }
        }
        self.entities = order
            .iter()
            .filter_map(|id| entities.remove(id))
            .collect();

        let mut relationships: BTreeMap<_, Relationship> = BTreeMap::new();
        let mut order = Vec::new();
        for rel in self.relationships.drain(..) {
            match relationships.get_mut(&rel.id) {
                Some(existing) => {
                    existing.confidence = existing.confidence.max(rel.confidence);
                    merge_properties(&mut existing.properties, &rel.properties);
                }
                None => {
                    order.push(rel.id);
                    relationships.insert(rel.id, rel);
                }
            }
        }
        self.relationships = order
            .iter()
            .filter_map(|id| relationships.remove(id))
            .collect();
        self
    }
}
