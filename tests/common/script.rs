//! Scripted extractor
//!
//! The chunk text is the model response. A leading directive line changes
//! the behavior:
//!
//! - `TIMEOUT` fails every attempt with a timeout
//! - `HANG` never answers
//! - `FLAKY <n>` fails the first `n` attempts with a transport error
//! - `THROTTLED <n>` rate-limits the first `n` attempts
//!
//! Text that is not JSON (`GARBAGE`, prose) fails with a parse error.

use async_trait::async_trait;
use chunkgraph::extract::parse_extraction;
use chunkgraph::{ExtractError, Extraction, Extractor};
use dashmap::DashMap;
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

#[derive(Default)]
pub struct ScriptedExtractor {
    attempts: DashMap<String, u32>,
    calls: AtomicUsize,
}

impl ScriptedExtractor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total extract calls across all chunks
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Attempts made for one chunk text
    pub fn attempts_for(&self, text: &str) -> u32 {
        self.attempts.get(text).map(|n| *n).unwrap_or(0)
    }
}

fn directive(text: &str) -> (Option<(&str, u32)>, &str) {
    let (head, body) = text.split_once('\n').unwrap_or((text, ""));
    let mut parts = head.split_whitespace();
    match (parts.next(), parts.next()) {
        (Some(kind @ ("TIMEOUT" | "HANG")), None) => (Some((kind, u32::MAX)), body),
        (Some(kind @ ("FLAKY" | "THROTTLED")), Some(n)) => match n.parse() {
            Ok(n) => (Some((kind, n)), body),
            Err(_) => (None, text),
        },
        _ => (None, text),
    }
}

#[async_trait]
impl Extractor for ScriptedExtractor {
    async fn extract(&self, text: &str) -> Result<Extraction, ExtractError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let attempt = {
            let mut entry = self.attempts.entry(text.to_string()).or_insert(0);
            *entry += 1;
            *entry
        };

        let (directive, body) = directive(text);
        match directive {
            Some(("TIMEOUT", _)) => Err(ExtractError::Timeout(Duration::from_secs(1))),
            Some(("HANG", _)) => std::future::pending().await,
            Some(("FLAKY", n)) if attempt <= n => Err(ExtractError::Transport("connection reset".into())),
            Some(("THROTTLED", n)) if attempt <= n => Err(ExtractError::RateLimited { retry_after: None }),
            _ => parse_extraction(body),
        }
    }
}

/// Model response listing `entities` as (name, type, confidence) and
/// `relationships` as (source, type, target, confidence)
pub fn chunk_json(entities: &[(&str, &str, f64)], relationships: &[(&str, &str, &str, f64)]) -> String {
    let entities: Vec<_> = entities
        .iter()
        .map(|(name, entity_type, confidence)| {
            json!({ "name": name, "type": entity_type, "confidence": confidence })
        })
        .collect();
    let relationships: Vec<_> = relationships
        .iter()
        .map(|(source, relationship_type, target, confidence)| {
            json!({
                "source": source,
                "type": relationship_type,
                "target": target,
                "confidence": confidence,
            })
        })
        .collect();
    json!({ "entities": entities, "relationships": relationships }).to_string()
}
