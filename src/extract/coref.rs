//! Coreference and dedup resolution
//!
//! Maps surface names to canonical keys so textual variants of one
//! real-world entity share an identity. Aliases discovered while a run is
//! active are shared by every concurrent chunk task of that run.

use super::{CandidateRelationship, Extraction};
use crate::graph::{
    ChunkCommit, Entity, EntityId, EntityType, Properties, PropertyValue, Relationship,
    RelationshipType,
};
use dashmap::DashMap;
use regex::Regex;
use std::collections::HashMap;
use std::sync::OnceLock;

fn punctuation() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"[.,;:!?'"`’“”]"#).expect("static regex"))
}

fn separators() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[\s/_\-–]+").expect("static regex"))
}

fn parenthetical() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(.+?)\s*\(([^()]+)\)\s*$").expect("static regex"))
}

/// Normalize a surface name: lowercase, fold punctuation, collapse whitespace.
///
/// `"PT. PMA"`, `"pt  pma"` and `"PT-PMA"` all become `"pt pma"`.
pub fn normalize_name(name: &str) -> String {
    let lowered = name.to_lowercase();
    let stripped = punctuation().replace_all(&lowered, "");
    separators()
        .replace_all(stripped.trim(), " ")
        .trim()
        .to_string()
}

/// Split `"Long Form (ACRONYM)"` into its two parts
fn split_parenthetical(name: &str) -> Option<(&str, &str)> {
    let caps = parenthetical().captures(name.trim())?;
    let long = caps.get(1)?.as_str();
    let short = caps.get(2)?.as_str();
    Some((long, short))
}

/// Run-scoped name resolver
///
/// Lookup order for a normalized key: configured synonyms, then aliases
/// registered during the run, then the key itself. Alias registration is
/// first-writer-wins so concurrent tasks never flip an alias mid-run.
/// The type of every listed entity is remembered by key for the rest of the
/// run, so a bare relationship endpoint resolves to the typed entity.
#[derive(Debug, Default)]
pub struct Resolver {
    synonyms: HashMap<String, String>,
    aliases: DashMap<String, String>,
    types: DashMap<String, EntityType>,
}

fn is_unknown(entity_type: &EntityType) -> bool {
    matches!(entity_type, EntityType::Other(label) if label == "unknown")
}

impl Resolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add static synonym pairs (alias, canonical); both sides are normalized
    pub fn with_synonyms<I, A, C>(mut self, synonyms: I) -> Self
    where
        I: IntoIterator<Item = (A, C)>,
        A: AsRef<str>,
        C: AsRef<str>,
    {
        for (alias, canonical) in synonyms {
            let alias = normalize_name(alias.as_ref());
            let canonical = normalize_name(canonical.as_ref());
            if !alias.is_empty() && !canonical.is_empty() && alias != canonical {
                self.synonyms.insert(alias, canonical);
            }
        }
        self
    }

    fn lookup(&self, key: String) -> String {
        if let Some(canonical) = self.synonyms.get(&key) {
            return canonical.clone();
        }
        if let Some(canonical) = self.aliases.get(&key) {
            return canonical.value().clone();
        }
        key
    }

    /// Canonical key for a surface name
    pub fn canonical_key(&self, name: &str) -> String {
        match split_parenthetical(name) {
            Some((long, _)) => self.lookup(normalize_name(long)),
            None => self.lookup(normalize_name(name)),
        }
    }

    /// Register `alias` as another name for `canonical_key`.
    ///
    /// Returns false if the alias was already bound (to anything) or is empty.
    pub fn register_alias(&self, alias: &str, canonical_key: &str) -> bool {
        let alias = normalize_name(alias);
        if alias.is_empty() || alias == canonical_key || self.synonyms.contains_key(&alias) {
            return false;
        }
        let mut inserted = false;
        self.aliases.entry(alias).or_insert_with(|| {
            inserted = true;
            canonical_key.to_string()
        });
        inserted
    }

    pub fn alias_count(&self) -> usize {
        self.aliases.len()
    }

    /// Type first listed for `canonical_key` during this run
    pub fn known_type(&self, canonical_key: &str) -> Option<EntityType> {
        self.types.get(canonical_key).map(|t| t.value().clone())
    }

    /// Resolve one chunk's extraction into a commit.
    ///
    /// Aliases are registered before any name is resolved, so a relationship
    /// may refer to an entity by acronym. Relationship endpoints missing from
    /// the entity list become entities of the hinted type, else the type
    /// known for their key in this run. With neither they are `Other("unknown")`
    /// and marked untyped for the store to bind. Self-loops and blank
    /// endpoints are dropped.
    pub fn resolve(&self, extraction: &Extraction, collection: &str, chunk_id: &str) -> ChunkCommit {
        for candidate in &extraction.entities {
            let key = self.canonical_key(&candidate.name);
            if key.is_empty() {
                continue;
            }
            if let Some((_, short)) = split_parenthetical(&candidate.name) {
                self.register_alias(short, &key);
            }
            for alias in &candidate.aliases {
                self.register_alias(alias, &key);
            }
            let entity_type = EntityType::parse(&candidate.entity_type);
            if !is_unknown(&entity_type) {
                self.types.entry(key).or_insert(entity_type);
            }
        }

        let mut commit = ChunkCommit::new(collection, chunk_id);
        let mut by_key: HashMap<String, EntityId> = HashMap::new();

        for candidate in &extraction.entities {
            let key = self.canonical_key(&candidate.name);
            if key.is_empty() {
                continue;
            }
            let mut entity = Entity::observed(
                EntityType::parse(&candidate.entity_type),
                candidate.name.trim(),
                key.clone(),
                candidate.confidence,
                collection,
                chunk_id,
            );
            if let Some(description) = &candidate.description {
                entity = entity.with_description(description.trim());
            }
            entity.properties = convert_properties(&candidate.properties);
            by_key.entry(key).or_insert(entity.id);
            commit.entities.push(entity);
        }

        for candidate in &extraction.relationships {
            let Some(source) = self.endpoint(
                &candidate.source,
                candidate.source_type.as_deref(),
                candidate,
                &mut by_key,
                &mut commit,
            ) else {
                continue;
            };
            let Some(target) = self.endpoint(
                &candidate.target,
                candidate.target_type.as_deref(),
                candidate,
                &mut by_key,
                &mut commit,
            ) else {
                continue;
            };
            if source == target {
                tracing::debug!(chunk_id, name = %candidate.source, "Dropping self-referencing relationship");
                continue;
            }

            let mut rel = Relationship::observed(
                source,
                RelationshipType::parse(&candidate.relationship_type),
                target,
                candidate.confidence,
                collection,
                chunk_id,
            );
            rel.properties = convert_properties(&candidate.properties);
            commit.relationships.push(rel);
        }

        commit.fold_duplicates()
    }

    /// Id of a relationship endpoint, materializing an entity if the chunk
    /// did not list one
    fn endpoint(
        &self,
        name: &str,
        type_hint: Option<&str>,
        relationship: &CandidateRelationship,
        by_key: &mut HashMap<String, EntityId>,
        commit: &mut ChunkCommit,
    ) -> Option<EntityId> {
        let key = self.canonical_key(name);
        if key.is_empty() {
            return None;
        }
        if let Some(id) = by_key.get(&key) {
            return Some(*id);
        }

        let entity_type = type_hint
            .map(EntityType::parse)
            .filter(|t| !is_unknown(t))
            .or_else(|| self.known_type(&key));
        let untyped = entity_type.is_none();
        let entity_type = entity_type.unwrap_or_else(|| EntityType::Other("unknown".to_string()));
        let entity = Entity::observed(
            entity_type,
            name.trim(),
            key.clone(),
            relationship.confidence,
            commit.collection.clone(),
            commit.chunk_id.clone(),
        );
        let id = entity.id;
        by_key.insert(key, id);
        if untyped {
            commit.untyped.insert(id);
        }
        commit.entities.push(entity);
        Some(id)
    }
}

fn convert_properties(raw: &HashMap<String, serde_json::Value>) -> Properties {
    raw.iter()
        .filter_map(|(k, v)| PropertyValue::from_json(v).map(|pv| (k.clone(), pv)))
        .collect()
}
