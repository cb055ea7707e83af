//! Incremental extraction pipeline
//!
//! `Pipeline::run` walks the prioritized collections, filters out chunks the
//! store has already ledgered, and hands the rest to the batch scheduler.
//! Each chunk is fetched, extracted, resolved and committed on its own, so a
//! failure never reaches beyond the chunk that caused it.

mod budget;
mod coordinator;
mod retry;
mod scheduler;
mod stats;

pub use budget::{Budget, CancellationToken};
pub use coordinator::{Pipeline, RunRequest};
pub use retry::{RetryOutcome, RetryPolicy, Retryable};
pub use scheduler::{BatchScheduler, ChunkReport, ScheduleReport, SchedulerSettings};
pub use stats::{CollectionStats, RunStats};

use crate::config::ConfigError;
use crate::extract::ExtractError;
use crate::source::SourceError;
use crate::storage::{GraphStore, StorageError, StorageResult};
use std::sync::Arc;
use thiserror::Error;

/// Why a single chunk was not committed
#[derive(Debug, Error)]
pub enum ChunkError {
    #[error("fetch failed: {0}")]
    Fetch(#[source] SourceError),

    /// Unusable model output; the chunk stays a candidate
    #[error("unusable extraction output: {0}")]
    Parse(String),

    #[error("extraction failed after {attempts} attempt(s): {source}")]
    Extraction { attempts: u32, source: ExtractError },

    #[error("persistence failed after {attempts} attempt(s): {source}")]
    Persistence { attempts: u32, source: StorageError },

    #[error("chunk task aborted: {0}")]
    Aborted(String),
}

/// Failures that abort a whole run
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Run lock for pipeline '{pipeline}' is held by {holder}")]
    RunLockHeld { pipeline: String, holder: String },

    #[error("Persistence store unavailable: {0}")]
    StoreUnavailable(#[source] StorageError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Run a synchronous store call on the blocking pool
pub(crate) async fn with_store<T, F>(store: &Arc<dyn GraphStore>, f: F) -> StorageResult<T>
where
    F: FnOnce(&dyn GraphStore) -> StorageResult<T> + Send + 'static,
    T: Send + 'static,
{
    let store = Arc::clone(store);
    tokio::task::spawn_blocking(move || f(store.as_ref()))
        .await
        .map_err(|e| StorageError::Task(e.to_string()))?
}
