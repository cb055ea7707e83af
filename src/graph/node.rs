//! Entity (node) representation in the knowledge graph

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use uuid::Uuid;

/// Namespace for deriving entity ids. Changing it re-keys every stored graph.
const ENTITY_NAMESPACE: Uuid = Uuid::from_u128(0x6b1f_3c2a_90d4_4e57_a1c8_2f0e_9d3b_7a61);

/// Identifier of a chunk inside its collection
pub type ChunkId = String;

/// Provenance entry for a chunk: `<collection>/<chunk_id>`.
///
/// Chunk ids are only unique within a collection, so provenance carries both.
pub fn chunk_ref(collection: &str, chunk_id: &str) -> String {
    format!("{}/{}", collection, chunk_id)
}

/// Stable identifier for an entity
///
/// Derived from the entity type and the canonical (normalized) name, so the
/// same logical entity always maps to the same id across runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(Uuid);

impl EntityId {
    /// Derive the id for an entity of `entity_type` with the given canonical key
    pub fn derive(entity_type: &EntityType, canonical_key: &str) -> Self {
        let material = format!("{}:{}", entity_type.as_str(), canonical_key);
        Self(Uuid::new_v5(&ENTITY_NAMESPACE, material.as_bytes()))
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }

    /// Parse an id from its hyphenated string form
    pub fn parse(s: &str) -> Result<Self, uuid::Error> {
        Uuid::parse_str(s).map(Self)
    }
}

impl std::fmt::Display for EntityId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Entity type classification
///
/// Extensible: anything the extractor reports outside the known set
/// is kept as `Other` with its normalized label.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum EntityType {
    ClassificationCode,
    LegalEntity,
    Permit,
    Document,
    Process,
    Regulation,
    Location,
    Service,
    ObligationType,
    Other(String),
}

impl EntityType {
    /// Parse a loosely formatted label ("Legal Entity", "legal_entity", "legal-entity")
    pub fn parse(label: &str) -> Self {
        let slug = slugify(label);
        match slug.as_str() {
            "classification-code" | "kbli" | "code" => Self::ClassificationCode,
            "legal-entity" | "company" | "organization" => Self::LegalEntity,
            "permit" | "license" | "licence" => Self::Permit,
            "document" => Self::Document,
            "process" | "procedure" => Self::Process,
            "regulation" | "law" => Self::Regulation,
            "location" | "place" | "region" => Self::Location,
            "service" => Self::Service,
            "obligation-type" | "obligation" => Self::ObligationType,
            _ if slug.is_empty() => Self::Other("unknown".to_string()),
            _ => Self::Other(slug),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::ClassificationCode => "classification-code",
            Self::LegalEntity => "legal-entity",
            Self::Permit => "permit",
            Self::Document => "document",
            Self::Process => "process",
            Self::Regulation => "regulation",
            Self::Location => "location",
            Self::Service => "service",
            Self::ObligationType => "obligation-type",
            Self::Other(label) => label,
        }
    }
}

impl std::fmt::Display for EntityType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<String> for EntityType {
    fn from(s: String) -> Self {
        Self::parse(&s)
    }
}

impl From<EntityType> for String {
    fn from(t: EntityType) -> Self {
        t.as_str().to_string()
    }
}

/// Lowercase, hyphen-separated form of a type label
pub(crate) fn slugify(label: &str) -> String {
    label
        .trim()
        .to_lowercase()
        .split(|c: char| c.is_whitespace() || c == '_' || c == '-')
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join("-")
}

/// Typed property values
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PropertyValue {
    String(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    Array(Vec<PropertyValue>),
    Object(HashMap<String, PropertyValue>),
}

impl PropertyValue {
    /// Convert a JSON value, dropping nulls (a null never overrides a stored value)
    pub fn from_json(value: &serde_json::Value) -> Option<Self> {
        use serde_json::Value;
        match value {
            Value::Null => None,
            Value::Bool(b) => Some(Self::Bool(*b)),
            Value::Number(n) => n
                .as_i64()
                .map(Self::Int)
                .or_else(|| n.as_f64().map(Self::Float)),
            Value::String(s) => Some(Self::String(s.clone())),
            Value::Array(items) => Some(Self::Array(items.iter().filter_map(Self::from_json).collect())),
            Value::Object(map) => Some(Self::Object(
                map.iter()
                    .filter_map(|(k, v)| Self::from_json(v).map(|pv| (k.clone(), pv)))
                    .collect(),
            )),
        }
    }
}

/// Properties collection
pub type Properties = HashMap<String, PropertyValue>;

/// An entity in the knowledge graph
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    /// Deterministic identifier (type + canonical key)
    pub id: EntityId,
    pub entity_type: EntityType,
    /// Display name as first extracted
    pub name: String,
    /// Normalized name the id was derived from
    pub canonical_key: String,
    pub description: Option<String>,
    pub properties: Properties,
    /// Confidence in [0, 1]
    pub confidence: f64,
    /// Collection that most recently reinforced this entity
    pub source_collection: String,
    /// Chunks that contributed evidence, as `chunk_ref`s; only ever grows
    pub source_chunk_ids: BTreeSet<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Entity {
    /// Create an entity observed in a single chunk
    pub fn observed(
        entity_type: EntityType,
        name: impl Into<String>,
        canonical_key: impl Into<String>,
        confidence: f64,
        collection: impl Into<String>,
        chunk_id: impl Into<ChunkId>,
    ) -> Self {
        let canonical_key = canonical_key.into();
        let collection: String = collection.into();
        let chunk_id: ChunkId = chunk_id.into();
        let provenance = chunk_ref(&collection, &chunk_id);
        let now = Utc::now();
        Self {
            id: EntityId::derive(&entity_type, &canonical_key),
            entity_type,
            name: name.into(),
            canonical_key,
            description: None,
            properties: HashMap::new(),
            confidence: super::merge::clamp_confidence(confidence),
            source_collection: collection,
            source_chunk_ids: BTreeSet::from([provenance]),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        let description = description.into();
        if !description.trim().is_empty() {
            self.description = Some(description);
        }
        self
    }

    pub fn with_property(mut self, key: impl Into<String>, value: PropertyValue) -> Self {
        self.properties.insert(key.into(), value);
        self
    }
}
