//! Relationship (edge) representation

use super::node::{chunk_ref, slugify, ChunkId, EntityId, Properties};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use uuid::Uuid;

const RELATIONSHIP_NAMESPACE: Uuid = Uuid::from_u128(0x0e7d_52b9_1f3a_4c86_b2d5_78a9_c4e1_3f02);

/// Stable identifier for a relationship
///
/// Derived from (source, relationship type, target).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RelationshipId(Uuid);

impl RelationshipId {
    pub fn derive(source: &EntityId, relationship_type: &RelationshipType, target: &EntityId) -> Self {
        let material = format!("{}|{}|{}", source, relationship_type.as_str(), target);
        Self(Uuid::new_v5(&RELATIONSHIP_NAMESPACE, material.as_bytes()))
    }

    pub fn parse(s: &str) -> Result<Self, uuid::Error> {
        Uuid::parse_str(s).map(Self)
    }
}

impl std::fmt::Display for RelationshipId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Relationship type between two entities
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum RelationshipType {
    Requires,
    PartOf,
    Provides,
    Costs,
    Duration,
    Prerequisite,
    Obligation,
    LocationRestriction,
    RelatedTo,
    Other(String),
}

impl RelationshipType {
    pub fn parse(label: &str) -> Self {
        let slug = slugify(label);
        match slug.as_str() {
            "requires" | "require" | "needs" => Self::Requires,
            "part-of" | "belongs-to" => Self::PartOf,
            "provides" | "issues" => Self::Provides,
            "costs" | "cost" | "fee" => Self::Costs,
            "duration" | "takes" => Self::Duration,
            "prerequisite" | "prerequisite-of" => Self::Prerequisite,
            "obligation" | "obliges" => Self::Obligation,
            "location-restriction" | "restricted-to" => Self::LocationRestriction,
            "related-to" | "related" | "" => Self::RelatedTo,
            _ => Self::Other(slug),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Requires => "requires",
            Self::PartOf => "part-of",
            Self::Provides => "provides",
            Self::Costs => "costs",
            Self::Duration => "duration",
            Self::Prerequisite => "prerequisite",
            Self::Obligation => "obligation",
            Self::LocationRestriction => "location-restriction",
            Self::RelatedTo => "related-to",
            Self::Other(label) => label,
        }
    }
}

impl std::fmt::Display for RelationshipType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<String> for RelationshipType {
    fn from(s: String) -> Self {
        Self::parse(&s)
    }
}

impl From<RelationshipType> for String {
    fn from(t: RelationshipType) -> Self {
        t.as_str().to_string()
    }
}

/// A directed, typed relationship between two entities
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Relationship {
    pub id: RelationshipId,
    pub source: EntityId,
    pub target: EntityId,
    pub relationship_type: RelationshipType,
    pub properties: Properties,
    /// Confidence in [0, 1]
    pub confidence: f64,
    pub source_collection: String,
    /// `chunk_ref`s of the chunks that asserted this relationship
    pub source_chunk_ids: BTreeSet<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Relationship {
    /// Create a relationship observed in a single chunk
    pub fn observed(
        source: EntityId,
        relationship_type: RelationshipType,
        target: EntityId,
        confidence: f64,
        collection: impl Into<String>,
        chunk_id: impl Into<ChunkId>,
    ) -> Self {
        let collection: String = collection.into();
        let chunk_id: ChunkId = chunk_id.into();
        let provenance = chunk_ref(&collection, &chunk_id);
        let now = Utc::now();
        Self {
            id: RelationshipId::derive(&source, &relationship_type, &target),
            source,
            target,
            relationship_type,
            properties: HashMap::new(),
            confidence: super::merge::clamp_confidence(confidence),
            source_collection: collection,
            source_chunk_ids: BTreeSet::from([provenance]),
            created_at: now,
            updated_at: now,
        }
    }

    /// The endpoint opposite `from`, if `from` is one of the endpoints
    pub fn other_end(&self, from: &EntityId) -> Option<&EntityId> {
        if &self.source == from {
            Some(&self.target)
        } else if &self.target == from {
            Some(&self.source)
        } else {
            None
        }
    }
}
