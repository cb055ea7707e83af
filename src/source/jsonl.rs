//! File-backed chunk source
//!
//! Each collection is a `<collection>.jsonl` file under a root directory,
//! one JSON object per line:
//!
//! ```text
//! {"chunk_id": "kbli-0001", "text": "..."}
//! ```
//!
//! `id` and `content` are accepted as aliases. Blank lines are ignored.

use super::{ChunkSource, SourceError};
use crate::graph::ChunkId;
use async_trait::async_trait;
use dashmap::DashMap;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Deserialize)]
struct ChunkLine {
    #[serde(alias = "id")]
    chunk_id: String,
    #[serde(alias = "content")]
    text: String,
}

#[derive(Debug, Default)]
struct LoadedCollection {
    order: Vec<ChunkId>,
    texts: HashMap<ChunkId, String>,
}

/// Chunk source reading one JSONL file per collection
///
/// A collection file is parsed once and cached for the lifetime of the
/// source; the corpus is treated as immutable while a run is active.
pub struct JsonlSource {
    root: PathBuf,
    cache: DashMap<String, Arc<LoadedCollection>>,
}

impl JsonlSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            cache: DashMap::new(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn collection_path(&self, collection: &str) -> PathBuf {
        self.root.join(format!("{}.jsonl", collection))
    }

    async fn load(&self, collection: &str) -> Result<Arc<LoadedCollection>, SourceError> {
        if let Some(loaded) = self.cache.get(collection) {
            return Ok(Arc::clone(loaded.value()));
        }

        let path = self.collection_path(collection);
        let content = tokio::fs::read_to_string(&path).await.map_err(|e| {
            SourceError::Unavailable {
                collection: collection.to_string(),
                reason: format!("{}: {}", path.display(), e),
            }
        })?;

        let loaded = Arc::new(parse_collection(&path, &content)?);
        tracing::debug!(
            collection,
            chunks = loaded.order.len(),
            "Loaded chunk file"
        );
        self.cache.insert(collection.to_string(), Arc::clone(&loaded));
        Ok(loaded)
    }
}

fn parse_collection(path: &Path, content: &str) -> Result<LoadedCollection, SourceError> {
    let mut loaded = LoadedCollection::default();
    for (index, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let record: ChunkLine =
            serde_json::from_str(line).map_err(|e| SourceError::Malformed {
                path: path.to_path_buf(),
                line: index + 1,
                reason: e.to_string(),
            })?;
        if loaded.texts.insert(record.chunk_id.clone(), record.text).is_none() {
            loaded.order.push(record.chunk_id);
        }
    }
    Ok(loaded)
}

#[async_trait]
impl ChunkSource for JsonlSource {
    async fn list_chunk_ids(&self, collection: &str) -> Result<Vec<ChunkId>, SourceError> {
        Ok(self.load(collection).await?.order.clone())
    }

    async fn fetch_chunk_text(&self, collection: &str, chunk_id: &str) -> Result<String, SourceError> {
        let loaded = self.load(collection).await?;
        loaded
            .texts
            .get(chunk_id)
            .cloned()
            .ok_or_else(|| SourceError::ChunkNotFound {
                collection: collection.to_string(),
                chunk_id: chunk_id.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[tokio::test]
    async fn reads_chunks_with_aliases() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("kbli.jsonl"),
            "{\"chunk_id\": \"k1\", \"text\": \"first\"}\n\n{\"id\": \"k2\", \"content\": \"second\"}\n",
        )
        .unwrap();

        let source = JsonlSource::new(dir.path());
        assert_eq!(source.list_chunk_ids("kbli").await.unwrap(), vec!["k1", "k2"]);
        assert_eq!(source.fetch_chunk_text("kbli", "k2").await.unwrap(), "second");
    }

    #[tokio::test]
    async fn missing_file_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let source = JsonlSource::new(dir.path());
        let err = source.list_chunk_ids("absent").await.unwrap_err();
        assert!(matches!(err, SourceError::Unavailable { .. }));
    }

    #[tokio::test]
    async fn malformed_line_reports_position() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("bad.jsonl"),
            "{\"chunk_id\": \"k1\", \"text\": \"ok\"}\nnot json\n",
        )
        .unwrap();

        let source = JsonlSource::new(dir.path());
        match source.list_chunk_ids("bad").await.unwrap_err() {
            SourceError::Malformed { line, .. } => assert_eq!(line, 2),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn unknown_chunk_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("kbli.jsonl"), "{\"id\": \"k1\", \"text\": \"x\"}\n").unwrap();
        let source = JsonlSource::new(dir.path());
        let err = source.fetch_chunk_text("kbli", "k2").await.unwrap_err();
        assert!(matches!(err, SourceError::ChunkNotFound { .. }));
    }
}
