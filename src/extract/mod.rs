//! Extraction: chunk text to candidate entities and relationships
//!
//! The `Extractor` trait is the seam to the model. `LlmExtractor` drives any
//! `LlmClient` with a JSON prompt; the `Resolver` then maps surface names to
//! canonical identities and produces a `ChunkCommit` for the store.

pub mod coref;
mod extractor;
pub mod llm;
mod parse;

pub use coref::{normalize_name, Resolver};
pub use extractor::LlmExtractor;
pub use llm::{LlmClient, LlmError, MockClient, OllamaClient};
pub use parse::{extract_json, parse_extraction};

use async_trait::async_trait;
use serde::{Deserialize, Deserializer};
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;

/// Confidence assumed when the model omits one
pub const DEFAULT_CANDIDATE_CONFIDENCE: f64 = 0.5;

/// An entity as reported by the extractor, before identity resolution
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CandidateEntity {
    #[serde(alias = "label")]
    pub name: String,
    #[serde(default, alias = "type")]
    pub entity_type: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub properties: HashMap<String, serde_json::Value>,
    #[serde(default = "default_confidence", deserialize_with = "lenient_confidence")]
    pub confidence: f64,
    /// Other surface names the model says refer to this entity
    #[serde(default)]
    pub aliases: Vec<String>,
}

impl CandidateEntity {
    pub fn new(name: impl Into<String>, entity_type: impl Into<String>, confidence: f64) -> Self {
        Self {
            name: name.into(),
            entity_type: entity_type.into(),
            description: None,
            properties: HashMap::new(),
            confidence,
            aliases: Vec::new(),
        }
    }
}

/// A directed relationship between two surface names
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CandidateRelationship {
    #[serde(alias = "from")]
    pub source: String,
    #[serde(alias = "to")]
    pub target: String,
    #[serde(default, alias = "type", alias = "relation")]
    pub relationship_type: String,
    #[serde(default)]
    pub properties: HashMap<String, serde_json::Value>,
    #[serde(default = "default_confidence", deserialize_with = "lenient_confidence")]
    pub confidence: f64,
    /// Type hints used when an endpoint is not listed among the entities
    #[serde(default)]
    pub source_type: Option<String>,
    #[serde(default)]
    pub target_type: Option<String>,
}

impl CandidateRelationship {
    pub fn new(
        source: impl Into<String>,
        relationship_type: impl Into<String>,
        target: impl Into<String>,
        confidence: f64,
    ) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            relationship_type: relationship_type.into(),
            properties: HashMap::new(),
            confidence,
            source_type: None,
            target_type: None,
        }
    }
}

/// Everything extracted from one chunk
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Extraction {
    pub entities: Vec<CandidateEntity>,
    pub relationships: Vec<CandidateRelationship>,
}

impl Extraction {
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty() && self.relationships.is_empty()
    }
}

fn default_confidence() -> f64 {
    DEFAULT_CANDIDATE_CONFIDENCE
}

/// Accept numbers or numeric strings; anything else falls back to the default
fn lenient_confidence<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    Ok(match value {
        serde_json::Value::Number(n) => n.as_f64().unwrap_or(DEFAULT_CANDIDATE_CONFIDENCE),
        serde_json::Value::String(s) => s.trim().parse().unwrap_or(DEFAULT_CANDIDATE_CONFIDENCE),
        _ => DEFAULT_CANDIDATE_CONFIDENCE,
    })
}

/// Errors from an extraction attempt
#[derive(Debug, Error)]
pub enum ExtractError {
    /// Output could not be turned into entities/relationships. Not retried.
    #[error("Unusable extraction output: {0}")]
    Parse(String),

    #[error("Extraction transport error: {0}")]
    Transport(String),

    #[error("Extraction timed out after {0:?}")]
    Timeout(Duration),

    /// The endpoint signalled throttling
    #[error("Extraction endpoint rate limited the request")]
    RateLimited { retry_after: Option<Duration> },
}

/// Turns one chunk's text into candidates
#[async_trait]
pub trait Extractor: Send + Sync {
    async fn extract(&self, text: &str) -> Result<Extraction, ExtractError>;
}
