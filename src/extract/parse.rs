//! Tolerant parsing of model output

use super::{CandidateEntity, CandidateRelationship, ExtractError, Extraction};
use serde::de::DeserializeOwned;

/// Extract a JSON object from model output.
///
/// Tries direct parse, then a fenced code block, then the first `{` to the
/// last `}`.
pub fn extract_json(text: &str) -> Option<serde_json::Value> {
    let trimmed = text.trim();

    // Try 1: Direct parse
    if let Some(v) = parse_object(trimmed) {
        return Some(v);
    }

    // Try 2: Extract from fenced code block
    let fenced = if let Some(start) = trimmed.find("```json") {
        let after = &trimmed[start + 7..];
        after.find("```").map(|end| &after[..end])
    } else if let Some(start) = trimmed.find("```\n") {
        let after = &trimmed[start + 4..];
        after.find("```").map(|end| &after[..end])
    } else {
        None
    };

    if let Some(v) = fenced.and_then(|block| parse_object(block.trim())) {
        return Some(v);
    }

    // Try 3: Find first { to last }
    if let (Some(start), Some(end)) = (trimmed.find('{'), trimmed.rfind('}')) {
        if start < end {
            return parse_object(&trimmed[start..=end]);
        }
    }

    None
}

fn parse_object(text: &str) -> Option<serde_json::Value> {
    serde_json::from_str::<serde_json::Value>(text)
        .ok()
        .filter(|v| v.is_object())
}

/// Parse a model response into an `Extraction`.
///
/// The response must contain an object with an `entities` and/or
/// `relationships` array. Individual items that do not deserialize, or have
/// blank names, are dropped without failing the chunk.
pub fn parse_extraction(raw: &str) -> Result<Extraction, ExtractError> {
    let value = extract_json(raw)
        .ok_or_else(|| ExtractError::Parse(format!("no JSON object in response: {}", preview(raw))))?;

    let entities = value.get("entities");
    let relationships = value.get("relationships").or_else(|| value.get("relations"));
    if entities.is_none() && relationships.is_none() {
        return Err(ExtractError::Parse(
            "response has neither entities nor relationships".to_string(),
        ));
    }

    let entities: Vec<CandidateEntity> = parse_items::<CandidateEntity>(entities, "entities")?
        .into_iter()
        .filter(|e| !e.name.trim().is_empty())
        .collect();
    let relationships: Vec<CandidateRelationship> =
        parse_items::<CandidateRelationship>(relationships, "relationships")?
            .into_iter()
            .filter(|r| !r.source.trim().is_empty() && !r.target.trim().is_empty())
        .collect();

    Ok(Extraction {
        entities,
        relationships,
    })
}

fn parse_items<T: DeserializeOwned>(
    value: Option<&serde_json::Value>,
    field: &str,
) -> Result<Vec<T>, ExtractError> {
    let items = match value {
        None | Some(serde_json::Value::Null) => return Ok(Vec::new()),
        Some(serde_json::Value::Array(items)) => items,
        Some(_) => return Err(ExtractError::Parse(format!("`{}` is not an array", field))),
    };

    Ok(items
        .iter()
        .filter_map(|item| match serde_json::from_value::<T>(item.clone()) {
            Ok(parsed) => Some(parsed),
            Err(e) => {
                tracing::debug!(field, error = %e, "Skipping unusable extraction item");
                None
            }
        })
        .collect())
}

fn preview(raw: &str) -> String {
    let snippet: String = raw.chars().take(80).collect();
    if snippet.len() < raw.len() {
        format!("{}...", snippet)
    } else {
        snippet
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_json_direct() {
        let v = extract_json(r#"{"entities": []}"#).unwrap();
        assert!(v["entities"].is_array());
    }

    #[test]
    fn extract_json_from_fenced_block() {
        let text = "Here you go:\n```json\n{\"entities\": [{\"name\": \"NIB\"}]}\n```\nDone.";
        let v = extract_json(text).unwrap();
        assert_eq!(v["entities"][0]["name"], "NIB");
    }

    #[test]
    fn extract_json_from_embedded_braces() {
        let text = "Sure! {\"relationships\": []} hope that helps";
        assert!(extract_json(text).is_some());
    }

    #[test]
    fn extract_json_rejects_non_objects() {
        assert!(extract_json("[1, 2, 3]").is_none());
        assert!(extract_json("no json here").is_none());
    }

    #[test]
    fn parses_entities_and_relationships_with_aliases() {
        let raw = r#"{
            "entities": [
                {"label": "PT PMA", "type": "Legal Entity", "confidence": 0.8},
                {"name": "NIB", "entity_type": "permit", "confidence": "0.7", "aliases": ["Nomor Induk Berusaha"]}
            ],
            "relationships": [
                {"from": "PT PMA", "to": "NIB", "relation": "requires"}
            ]
        }"#;
        let extraction = parse_extraction(raw).unwrap();

        assert_eq!(extraction.entities.len(), 2);
        assert_eq!(extraction.entities[0].name, "PT PMA");
        assert_eq!(extraction.entities[0].entity_type, "Legal Entity");
        assert!((extraction.entities[1].confidence - 0.7).abs() < 1e-9);
        assert_eq!(extraction.entities[1].aliases, vec!["Nomor Induk Berusaha"]);

        let rel = &extraction.relationships[0];
        assert_eq!(rel.source, "PT PMA");
        assert_eq!(rel.relationship_type, "requires");
        assert!((rel.confidence - 0.5).abs() < 1e-9);
    }

    #[test]
    fn drops_unusable_items_but_keeps_chunk() {
        let raw = r#"{"entities": [{"name": "  "}, {"description": "no name"}, {"name": "OSS"}]}"#;
        let extraction = parse_extraction(raw).unwrap();
        assert_eq!(extraction.entities.len(), 1);
        assert_eq!(extraction.entities[0].name, "OSS");
    }

    #[test]
    fn empty_arrays_are_a_valid_empty_extraction() {
        let extraction = parse_extraction(r#"{"entities": [], "relationships": []}"#).unwrap();
        assert!(extraction.is_empty());
    }

    #[test]
    fn garbage_is_a_parse_error() {
        let err = parse_extraction("I could not find anything").unwrap_err();
        assert!(matches!(err, ExtractError::Parse(_)));
    }

    #[test]
    fn object_without_known_fields_is_a_parse_error() {
        let err = parse_extraction(r#"{"answer": 42}"#).unwrap_err();
        assert!(matches!(err, ExtractError::Parse(_)));
    }

    #[test]
    fn non_array_entities_is_a_parse_error() {
        let err = parse_extraction(r#"{"entities": "PT PMA"}"#).unwrap_err();
        assert!(matches!(err, ExtractError::Parse(_)));
    }
}
