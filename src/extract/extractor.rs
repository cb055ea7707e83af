//! LLM-backed extractor

use super::llm::LlmClient;
use super::parse::parse_extraction;
use super::{ExtractError, Extraction, Extractor};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

const PROMPT_TEMPLATE: &str = r#"Extract a knowledge graph from the passage below.

Respond with a single JSON object:
{
  "entities": [
    {"name": "...", "type": "<entity type>", "description": "...", "properties": {}, "aliases": [], "confidence": 0.0}
  ],
  "relationships": [
    {"source": "<entity name>", "target": "<entity name>", "type": "<relationship type>", "properties": {}, "confidence": 0.0}
  ]
}

Entity types: classification-code, legal-entity, permit, document, process, regulation, location, service, obligation-type.
Relationship types: requires, part-of, provides, costs, duration, prerequisite, obligation, location-restriction, related-to.
Confidence is between 0 and 1. Use only names that appear in the passage.

Passage:
{text}
"#;

/// Extractor that prompts an `LlmClient` and parses its JSON answer
///
/// Every call is bounded by `timeout`; an elapsed timeout is reported as
/// `ExtractError::Timeout` so the caller can retry it.
pub struct LlmExtractor {
    client: Arc<dyn LlmClient>,
    timeout: Duration,
}

impl LlmExtractor {
    pub fn new(client: Arc<dyn LlmClient>, timeout: Duration) -> Self {
        Self { client, timeout }
    }

    pub fn build_prompt(text: &str) -> String {
        PROMPT_TEMPLATE.replace("{text}", text.trim())
    }
}

#[async_trait]
impl Extractor for LlmExtractor {
    async fn extract(&self, text: &str) -> Result<Extraction, ExtractError> {
        let prompt = Self::build_prompt(text);
        let raw = tokio::time::timeout(self.timeout, self.client.generate(&prompt))
            .await
            .map_err(|_| ExtractError::Timeout(self.timeout))??;
        parse_extraction(&raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extract::llm::{LlmError, MockClient};

    #[tokio::test]
    async fn extracts_from_mock_response() {
        let client = MockClient::new().with_response(
            r#"{"entities": [{"name": "NIB", "type": "permit", "confidence": 0.9}], "relationships": []}"#,
        );
        let extractor = LlmExtractor::new(Arc::new(client), Duration::from_secs(5));

        let extraction = extractor.extract("NIB is issued through OSS.").await.unwrap();
        assert_eq!(extraction.entities.len(), 1);
        assert_eq!(extraction.entities[0].entity_type, "permit");
    }

    #[tokio::test]
    async fn slow_model_times_out() {
        let client = MockClient::new()
            .with_fallback("{}")
            .with_delay(Duration::from_millis(200));
        let extractor = LlmExtractor::new(Arc::new(client), Duration::from_millis(10));

        let err = extractor.extract("text").await.unwrap_err();
        assert!(matches!(err, ExtractError::Timeout(_)));
    }

    #[tokio::test]
    async fn transport_failure_is_transport_error() {
        let client = MockClient::new().with_failure(LlmError::Unavailable("refused".into()));
        let extractor = LlmExtractor::new(Arc::new(client), Duration::from_secs(5));

        let err = extractor.extract("text").await.unwrap_err();
        assert!(matches!(err, ExtractError::Transport(_)));
    }

    #[tokio::test]
    async fn prose_answer_is_parse_error() {
        let client = MockClient::new().with_response("Sorry, I cannot help with that.");
        let extractor = LlmExtractor::new(Arc::new(client), Duration::from_secs(5));

        let err = extractor.extract("text").await.unwrap_err();
        assert!(matches!(err, ExtractError::Parse(_)));
    }

    #[test]
    fn prompt_embeds_passage() {
        let prompt = LlmExtractor::build_prompt("  PT PMA requires NIB.  ");
        assert!(prompt.contains("Passage:\nPT PMA requires NIB."));
        assert!(!prompt.contains("{text}"));
    }
}
