//! Run coordinator

use super::budget::{Budget, CancellationToken};
use super::retry::RetryPolicy;
use super::scheduler::{BatchScheduler, ChunkReport};
use super::stats::{CollectionStats, RunStats};
use super::{with_store, ChunkError, PipelineError};
use crate::config::{CollectionSpec, PipelineConfig};
use crate::extract::{ExtractError, Extraction, Extractor, Resolver};
use crate::graph::{ChunkId, MergePolicy};
use crate::source::ChunkSource;
use crate::storage::{CommitOutcome, GraphStore, StorageError};
use chrono::{NaiveDate, Utc};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Parameters of one run
#[derive(Debug, Clone)]
pub struct RunRequest {
    /// Collections to process; the configured list when `None`
    pub collections: Option<Vec<CollectionSpec>>,
    /// Chunks the pipeline may consume per UTC day, across all runs
    pub daily_budget: u64,
    /// Overrides the configured attempt limit
    pub max_retries: Option<u32>,
    pub cancel: Option<CancellationToken>,
}

impl RunRequest {
    pub fn new(daily_budget: u64) -> Self {
        Self {
            collections: None,
            daily_budget,
            max_retries: None,
            cancel: None,
        }
    }

    pub fn collections(mut self, collections: Vec<CollectionSpec>) -> Self {
        self.collections = Some(collections);
        self
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn cancel_token(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }
}

/// The extraction pipeline over one store, source and extractor
pub struct Pipeline {
    store: Arc<dyn GraphStore>,
    source: Arc<dyn ChunkSource>,
    extractor: Arc<dyn Extractor>,
    config: PipelineConfig,
}

impl Pipeline {
    pub fn new(
        store: Arc<dyn GraphStore>,
        source: Arc<dyn ChunkSource>,
        extractor: Arc<dyn Extractor>,
        config: PipelineConfig,
    ) -> Result<Self, PipelineError> {
        config.validate()?;
        Ok(Self {
            store,
            source,
            extractor,
            config,
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn GraphStore> {
        &self.store
    }

    /// Run the pipeline once.
    ///
    /// Only a held run lock or an unreachable store is fatal. Every other
    /// failure is recorded in the returned stats.
    pub async fn run(&self, request: RunRequest) -> Result<RunStats, PipelineError> {
        let name = self.config.pipeline.name.clone();
        with_store(&self.store, |s| s.ping())
            .await
            .map_err(PipelineError::StoreUnavailable)?;

        let holder = format!("{}:{}", std::process::id(), Uuid::new_v4());
        let ttl = self.config.lock_ttl();
        let (lock_name, lock_holder) = (name.clone(), holder.clone());
        with_store(&self.store, move |s| s.acquire_run_lock(&lock_name, &lock_holder, ttl))
            .await
            .map_err(|e| match e {
                StorageError::LockHeld { pipeline, holder } => {
                    PipelineError::RunLockHeld { pipeline, holder }
                }
                other => PipelineError::StoreUnavailable(other),
            })?;
        let lock = RunLockGuard {
            store: Arc::clone(&self.store),
            pipeline: name.clone(),
            holder,
            released: false,
        };

        let result = self.run_locked(request, &name).await;
        lock.release().await;
        result
    }

    async fn run_locked(&self, request: RunRequest, name: &str) -> Result<RunStats, PipelineError> {
        let today = Utc::now().date_naive();
        let usage_name = name.to_string();
        let used_before = with_store(&self.store, move |s| s.usage_on(&usage_name, today))
            .await
            .map_err(PipelineError::StoreUnavailable)?;

        let mut budget = Budget::new(request.daily_budget.saturating_sub(used_before));
        if let Some(token) = request.cancel.clone() {
            budget = budget.with_cancellation(token);
        }
        let mut stats = RunStats::new(
            name,
            request.daily_budget,
            used_before,
            self.config.pipeline.max_errors,
        );

        let retry = RetryPolicy {
            max_retries: request.max_retries.unwrap_or(self.config.retry.max_retries),
            ..self.config.retry_policy()
        };
        let resolver = Arc::new(Resolver::new().with_synonyms(self.config.merge.synonyms.iter()));
        let collections = ordered_collections(
            request
                .collections
                .unwrap_or_else(|| self.config.collections.clone()),
        );

        info!(
            pipeline = %name,
            collections = collections.len(),
            budget = budget.remaining(),
            used_today = used_before,
            "Starting run"
        );

        let mut recorded = 0;
        let mut fatal = None;
        for spec in collections {
            if budget.is_exhausted() {
                info!(collection = %spec.name, "Budget exhausted, collection not started");
                stats
                    .collections
                    .push(CollectionStats::new(&spec.name, spec.priority));
                continue;
            }

            let result = self
                .run_collection(&spec, &budget, retry, &resolver, &mut stats)
                .await;

            let used = budget.used();
            if used > recorded {
                match self.record_usage(name, today, used - recorded).await {
                    Ok(total) => {
                        recorded = used;
                        debug!(pipeline = %name, total, "Recorded daily usage");
                    }
                    Err(e) => {
                        error!(pipeline = %name, error = %e, "Failed to record daily usage");
                        stats.record_error(format!("usage not recorded: {}", e));
                    }
                }
            }

            if let Err(e) = result {
                fatal = Some(e);
                break;
            }
        }
        if let Some(e) = fatal {
            error!(pipeline = %name, error = %e, "Run aborted");
            return Err(e);
        }

        stats.finish(budget.used(), budget.remaining());
        info!(
            pipeline = %name,
            processed = stats.chunks_processed(),
            failed = stats.chunks_failed(),
            budget_used = stats.budget_used,
            errors = stats.error_count(),
            "Run finished"
        );
        Ok(stats)
    }

    async fn record_usage(&self, pipeline: &str, day: NaiveDate, chunks: u64) -> Result<u64, StorageError> {
        let pipeline = pipeline.to_string();
        with_store(&self.store, move |s| s.record_usage(&pipeline, day, chunks)).await
    }

    async fn run_collection(
        &self,
        spec: &CollectionSpec,
        budget: &Budget,
        retry: RetryPolicy,
        resolver: &Arc<Resolver>,
        stats: &mut RunStats,
    ) -> Result<(), PipelineError> {
        let mut collection = CollectionStats::new(&spec.name, spec.priority);

        let listed = retry
            .run("list_chunk_ids", || self.source.list_chunk_ids(&spec.name))
            .await;
        let ids = match listed.result {
            Ok(ids) => ids,
            Err(e) => {
                warn!(collection = %spec.name, error = %e, "Collection unavailable, skipping");
                collection.unavailable = true;
                stats.record_error(format!("collection '{}' unavailable: {}", spec.name, e));
                stats.collections.push(collection);
                return Ok(());
            }
        };

        let ledger_name = spec.name.clone();
        let processed = with_store(&self.store, move |s| s.processed_chunk_ids(&ledger_name))
            .await
            .map_err(PipelineError::StoreUnavailable)?;

        let mut seen = HashSet::new();
        let unique: Vec<ChunkId> = ids.into_iter().filter(|id| seen.insert(id.clone())).collect();
        let total = unique.len();
        let candidates: Vec<ChunkId> = unique
            .into_iter()
            .filter(|id| !processed.contains(id))
            .collect();
        collection.chunks_skipped = total - candidates.len();
        collection.chunks_candidate = candidates.len();

        info!(
            collection = %spec.name,
            priority = spec.priority,
            candidates = candidates.len(),
            already_processed = collection.chunks_skipped,
            "Processing collection"
        );
        if candidates.is_empty() {
            stats.collections.push(collection);
            return Ok(());
        }

        let worker = Arc::new(ChunkWorker {
            store: Arc::clone(&self.store),
            source: Arc::clone(&self.source),
            extractor: Arc::clone(&self.extractor),
            resolver: Arc::clone(resolver),
            policy: self.config.merge_policy(),
            retry,
            timeout: self.config.llm_timeout(),
            collection: spec.name.clone(),
        });
        let scheduler = BatchScheduler::new(self.config.scheduler_settings());
        let report = scheduler
            .run(candidates, budget, move |chunk_id| {
                let worker = Arc::clone(&worker);
                async move { worker.process(chunk_id).await }
            })
            .await;

        let mut persistence_failed = false;
        for chunk in report.reports {
            match chunk.result {
                Ok(outcome) => collection.record_commit(&outcome),
                Err(e) => {
                    collection.chunks_failed += 1;
                    persistence_failed |= matches!(e, ChunkError::Persistence { .. });
                    stats.record_error(format!("{}/{}: {}", spec.name, chunk.chunk_id, e));
                }
            }
        }
        collection.chunks_deferred = report.deferred;

        info!(
            collection = %spec.name,
            processed = collection.chunks_processed,
            failed = collection.chunks_failed,
            deferred = collection.chunks_deferred,
            entities_created = collection.entities_created,
            relationships_created = collection.relationships_created,
            "Collection finished"
        );
        stats.collections.push(collection);

        // A failed commit is either a bad chunk or a dead store; only the latter is fatal
        if persistence_failed {
            if let Err(e) = with_store(&self.store, |s| s.ping()).await {
                return Err(PipelineError::StoreUnavailable(e));
            }
        }
        Ok(())
    }
}

/// Ascending priority, ties by name; later duplicates of a name are dropped
fn ordered_collections(mut specs: Vec<CollectionSpec>) -> Vec<CollectionSpec> {
    specs.sort_by(|a, b| a.priority.cmp(&b.priority).then_with(|| a.name.cmp(&b.name)));
    let mut seen = HashSet::new();
    specs.retain(|spec| seen.insert(spec.name.clone()));
    specs
}

/// Holds the run lock until `release`; dropping it unreleased (a cancelled
/// run future) releases synchronously
struct RunLockGuard {
    store: Arc<dyn GraphStore>,
    pipeline: String,
    holder: String,
    released: bool,
}

impl RunLockGuard {
    async fn release(mut self) {
        let (pipeline, holder) = (self.pipeline.clone(), self.holder.clone());
        if let Err(e) = with_store(&self.store, move |s| s.release_run_lock(&pipeline, &holder)).await {
            warn!(pipeline = %self.pipeline, error = %e, "Failed to release run lock");
        }
        self.released = true;
    }
}

impl Drop for RunLockGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(e) = self.store.release_run_lock(&self.pipeline, &self.holder) {
            warn!(pipeline = %self.pipeline, error = %e, "Failed to release run lock");
        }
    }
}

/// Per-collection chunk processing: fetch, extract, resolve, commit
struct ChunkWorker {
    store: Arc<dyn GraphStore>,
    source: Arc<dyn ChunkSource>,
    extractor: Arc<dyn Extractor>,
    resolver: Arc<Resolver>,
    policy: MergePolicy,
    retry: RetryPolicy,
    /// Bound on each extraction call
    timeout: Duration,
    collection: String,
}

impl ChunkWorker {
    async fn process(&self, chunk_id: ChunkId) -> ChunkReport {
        let mut rate_limited = false;
        let result = self.process_chunk(&chunk_id, &mut rate_limited).await;
        match &result {
            Ok(outcome) => debug!(
                collection = %self.collection,
                chunk_id = %chunk_id,
                entities = outcome.entities_created + outcome.entities_merged,
                relationships = outcome.relationships_created + outcome.relationships_merged,
                "Chunk committed"
            ),
            Err(e) => warn!(
                collection = %self.collection,
                chunk_id = %chunk_id,
                error = %e,
                "Chunk failed"
            ),
        }
        ChunkReport {
            chunk_id,
            result,
            rate_limited,
        }
    }

    async fn process_chunk(&self, chunk_id: &str, rate_limited: &mut bool) -> Result<CommitOutcome, ChunkError> {
        let fetched = self
            .retry
            .run("fetch_chunk_text", || {
                self.source.fetch_chunk_text(&self.collection, chunk_id)
            })
            .await;
        let text = fetched.result.map_err(ChunkError::Fetch)?;

        let extracted = self
            .retry
            .run("extract", || self.extract_bounded(&text))
            .await;
        *rate_limited |= extracted.rate_limited;
        let extraction = match extracted.result {
            Ok(extraction) => extraction,
            Err(ExtractError::Parse(msg)) => return Err(ChunkError::Parse(msg)),
            Err(source) => {
                return Err(ChunkError::Extraction {
                    attempts: extracted.attempts,
                    source,
                })
            }
        };

        let commit = Arc::new(self.resolver.resolve(&extraction, &self.collection, chunk_id));
        let policy = self.policy;
        let committed = self
            .retry
            .run("commit_chunk", || {
                let commit = Arc::clone(&commit);
                with_store(&self.store, move |s| s.commit_chunk(&commit, &policy))
            })
            .await;
        committed.result.map_err(|source| ChunkError::Persistence {
            attempts: committed.attempts,
            source,
        })
    }

    async fn extract_bounded(&self, text: &str) -> Result<Extraction, ExtractError> {
        match tokio::time::timeout(self.timeout, self.extractor.extract(text)).await {
            Ok(result) => result,
            Err(_) => Err(ExtractError::Timeout(self.timeout)),
        }
    }
}
