//! Shared helpers for pipeline and query integration tests
//!
//! Chunk texts double as extractor scripts: a chunk's text is the JSON the
//! model would have returned, optionally prefixed with a failure directive
//! (see `ScriptedExtractor`).

#![allow(dead_code)]

pub mod faulty;
pub mod script;

pub use faulty::FaultyStore;
pub use script::{chunk_json, ScriptedExtractor};

use chunkgraph::{
    CollectionSpec, GraphStore, MemorySource, OpenStore, Pipeline, PipelineConfig, RunRequest, RunStats,
    SqliteStore,
};
use std::sync::Arc;

/// Config with every delay zeroed so tests never sleep
pub fn test_config(name: &str) -> PipelineConfig {
    let mut config = PipelineConfig::default();
    config.pipeline.name = name.to_string();
    config.scheduler.batch_size = 4;
    config.scheduler.max_concurrent_batches = 2;
    config.scheduler.inter_batch_delay_ms = 0;
    config.scheduler.rate_limit_cooldown_ms = 0;
    config.retry.max_retries = 3;
    config.retry.base_delay_ms = 0;
    config.retry.max_delay_ms = 0;
    config.retry.rate_limit_backoff_ms = 0;
    config
}

/// Store, source and extractor wired into one pipeline
pub struct Harness {
    pub store: Arc<SqliteStore>,
    pub source: Arc<MemorySource>,
    pub extractor: Arc<ScriptedExtractor>,
    pub config: PipelineConfig,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(test_config("test"))
    }

    pub fn with_config(config: PipelineConfig) -> Self {
        Self {
            store: Arc::new(SqliteStore::open_in_memory().unwrap()),
            source: Arc::new(MemorySource::new()),
            extractor: Arc::new(ScriptedExtractor::new()),
            config,
        }
    }

    /// Add a chunk whose extraction is `text`
    pub fn chunk(&self, collection: &str, chunk_id: &str, text: impl Into<String>) -> &Self {
        self.source
            .insert(chunkgraph::Chunk::new(collection, chunk_id, text));
        self
    }

    pub fn pipeline(&self) -> Pipeline {
        self.pipeline_on(self.store.clone())
    }

    /// Pipeline over this harness' source and extractor but another store
    pub fn pipeline_on(&self, store: Arc<dyn GraphStore>) -> Pipeline {
        Pipeline::new(store, self.source.clone(), self.extractor.clone(), self.config.clone()).unwrap()
    }

    pub async fn run(&self, request: RunRequest) -> RunStats {
        self.pipeline().run(request).await.unwrap()
    }

    /// Run over the given collections, prioritized in the order given
    pub async fn run_collections(&self, collections: &[&str], budget: u64) -> RunStats {
        let specs = collections
            .iter()
            .enumerate()
            .map(|(i, name)| CollectionSpec::new(*name, i as u32 + 1))
            .collect();
        self.run(RunRequest::new(budget).collections(specs)).await
    }

    pub fn entity(&self, name: &str) -> chunkgraph::Entity {
        let mut found = self.store.find_entities_by_name(name).unwrap();
        assert_eq!(found.len(), 1, "expected exactly one entity named {}", name);
        found.remove(0)
    }

    pub fn entity_count(&self) -> usize {
        self.store.stats().unwrap().entities
    }

    pub fn relationship_count(&self) -> usize {
        self.store.stats().unwrap().relationships
    }
}
