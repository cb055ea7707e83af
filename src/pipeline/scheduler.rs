//! Rate-limited batch scheduler
//!
//! Candidates are cut into batches of `batch_size`. At most
//! `max_concurrent_batches` batches are in flight; the chunks of one batch
//! run concurrently. A batch keeps its slot through the inter-batch delay
//! (plus the cooldown when it saw throttling), which bounds throughput at
//! `max_concurrent_batches * batch_size` chunks per batch window.

use super::budget::Budget;
use super::ChunkError;
use crate::graph::ChunkId;
use crate::storage::CommitOutcome;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerSettings {
    pub batch_size: usize,
    pub max_concurrent_batches: usize,
    pub inter_batch_delay: Duration,
    pub rate_limit_cooldown: Duration,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            batch_size: 10,
            max_concurrent_batches: 2,
            inter_batch_delay: Duration::from_secs(1),
            rate_limit_cooldown: Duration::from_secs(5),
        }
    }
}

/// Outcome of processing one chunk
#[derive(Debug)]
pub struct ChunkReport {
    pub chunk_id: ChunkId,
    pub result: Result<CommitOutcome, ChunkError>,
    /// The extractor signalled throttling while this chunk ran
    pub rate_limited: bool,
}

/// Everything one scheduling pass produced
#[derive(Debug, Default)]
pub struct ScheduleReport {
    pub reports: Vec<ChunkReport>,
    pub batches: usize,
    /// Candidates never started because the budget ran out
    pub deferred: usize,
}

pub struct BatchScheduler {
    settings: SchedulerSettings,
}

impl BatchScheduler {
    pub fn new(settings: SchedulerSettings) -> Self {
        Self {
            settings: SchedulerSettings {
                batch_size: settings.batch_size.max(1),
                max_concurrent_batches: settings.max_concurrent_batches.max(1),
                ..settings
            },
        }
    }

    pub fn settings(&self) -> &SchedulerSettings {
        &self.settings
    }

    /// Process `candidates` in batches, drawing from `budget`.
    ///
    /// Returns once every started batch has finished. Candidates left over
    /// when the budget is exhausted are counted as deferred.
    pub async fn run<F, Fut>(&self, candidates: Vec<ChunkId>, budget: &Budget, process: F) -> ScheduleReport
    where
        F: Fn(ChunkId) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ChunkReport> + Send + 'static,
    {
        let process = Arc::new(process);
        let slots = Arc::new(Semaphore::new(self.settings.max_concurrent_batches));
        let mut batches = JoinSet::new();
        let mut report = ScheduleReport::default();
        let mut cursor = 0;

        while cursor < candidates.len() {
            // Wait for a free slot before reserving, so reservations never sit idle
            let Ok(permit) = Arc::clone(&slots).acquire_owned().await else {
                break;
            };

            let wanted = self.settings.batch_size.min(candidates.len() - cursor);
            let granted = budget.try_reserve(wanted as u64) as usize;
            if granted == 0 {
                tracing::info!(
                    remaining_candidates = candidates.len() - cursor,
                    cancelled = budget.is_cancelled(),
                    "Budget exhausted, no new batches"
                );
                break;
            }

            let batch: Vec<ChunkId> = candidates[cursor..cursor + granted].to_vec();
            cursor += granted;
            report.batches += 1;
            let batch_number = report.batches;
            tracing::debug!(batch = batch_number, chunks = batch.len(), "Starting batch");

            let process = Arc::clone(&process);
            let settings = self.settings;
            batches.spawn(async move {
                let handles: Vec<_> = batch
                    .into_iter()
                    .map(|chunk_id| {
                        let task = tokio::spawn((*process)(chunk_id.clone()));
                        (chunk_id, task)
                    })
                    .collect();

                let mut reports = Vec::with_capacity(handles.len());
                for (chunk_id, task) in handles {
                    match task.await {
                        Ok(chunk_report) => reports.push(chunk_report),
                        Err(e) => {
                            tracing::error!(chunk_id = %chunk_id, error = %e, "Chunk task aborted");
                            reports.push(ChunkReport {
                                chunk_id,
                                result: Err(ChunkError::Aborted(e.to_string())),
                                rate_limited: false,
                            });
                        }
                    }
                }

                let throttled = reports.iter().any(|r| r.rate_limited);
                let mut pause = settings.inter_batch_delay;
                if throttled {
                    pause += settings.rate_limit_cooldown;
                    tracing::warn!(
                        batch = batch_number,
                        cooldown_ms = settings.rate_limit_cooldown.as_millis() as u64,
                        "Rate limit observed, cooling down"
                    );
                }
                if !pause.is_zero() {
                    tokio::time::sleep(pause).await;
                }
                drop(permit);
                reports
            });
        }

        report.deferred = candidates.len() - cursor;

        while let Some(joined) = batches.join_next().await {
            match joined {
                Ok(reports) => report.reports.extend(reports),
                Err(e) => tracing::error!(error = %e, "Batch task aborted"),
            }
        }

        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn ids(n: usize) -> Vec<ChunkId> {
        (0..n).map(|i| format!("c{}", i)).collect()
    }

    fn settings(batch_size: usize, max_concurrent_batches: usize) -> SchedulerSettings {
        SchedulerSettings {
            batch_size,
            max_concurrent_batches,
            inter_batch_delay: Duration::ZERO,
            rate_limit_cooldown: Duration::ZERO,
        }
    }

    fn ok_report(chunk_id: ChunkId) -> ChunkReport {
        ChunkReport {
            chunk_id,
            result: Ok(CommitOutcome::default()),
            rate_limited: false,
        }
    }

    #[tokio::test]
    async fn processes_every_candidate_within_budget() {
        let scheduler = BatchScheduler::new(settings(3, 2));
        let budget = Budget::new(100);

        let report = scheduler
            .run(ids(10), &budget, |id| async move { ok_report(id) })
            .await;

        assert_eq!(report.reports.len(), 10);
        assert_eq!(report.batches, 4);
        assert_eq!(report.deferred, 0);
        assert_eq!(budget.used(), 10);
    }

    #[tokio::test]
    async fn stops_at_budget_and_defers_rest() {
        let scheduler = BatchScheduler::new(settings(2, 1));
        let budget = Budget::new(3);

        let report = scheduler
            .run(ids(10), &budget, |id| async move { ok_report(id) })
            .await;

        assert_eq!(report.reports.len(), 3);
        assert_eq!(report.deferred, 7);
        assert_eq!(report.batches, 2);
        let mut done: Vec<_> = report.reports.iter().map(|r| r.chunk_id.clone()).collect();
        done.sort();
        assert_eq!(done, vec!["c0", "c1", "c2"]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn never_exceeds_concurrency_ceiling() {
        let scheduler = BatchScheduler::new(settings(3, 2));
        let budget = Budget::new(100);
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let (in_flight_c, peak_c) = (Arc::clone(&in_flight), Arc::clone(&peak));
        let report = scheduler
            .run(ids(20), &budget, move |id| {
                let in_flight = Arc::clone(&in_flight_c);
                let peak = Arc::clone(&peak_c);
                async move {
                    let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                    ok_report(id)
                }
            })
            .await;

        assert_eq!(report.reports.len(), 20);
        assert!(peak.load(Ordering::SeqCst) <= 6);
        assert!(peak.load(Ordering::SeqCst) >= 1);
    }

    #[tokio::test]
    async fn panicking_chunk_is_reported_as_aborted() {
        let scheduler = BatchScheduler::new(settings(4, 1));
        let budget = Budget::new(4);

        let report = scheduler
            .run(ids(4), &budget, |id| async move {
                if id == "c2" {
                    panic!("extractor bug");
                }
                ok_report(id)
            })
            .await;

        assert_eq!(report.reports.len(), 4);
        let aborted: Vec<_> = report.reports.iter().filter(|r| r.result.is_err()).collect();
        assert_eq!(aborted.len(), 1);
        assert_eq!(aborted[0].chunk_id, "c2");
        assert!(matches!(aborted[0].result, Err(ChunkError::Aborted(_))));
    }

    #[tokio::test]
    async fn cancelled_budget_starts_nothing() {
        let scheduler = BatchScheduler::new(settings(2, 2));
        let token = crate::pipeline::CancellationToken::new();
        token.cancel();
        let budget = Budget::new(10).with_cancellation(token);

        let report = scheduler
            .run(ids(5), &budget, |id| async move { ok_report(id) })
            .await;

        assert!(report.reports.is_empty());
        assert_eq!(report.deferred, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn throttled_batch_holds_slot_through_cooldown() {
        let scheduler = BatchScheduler::new(SchedulerSettings {
            batch_size: 1,
            max_concurrent_batches: 1,
            inter_batch_delay: Duration::from_millis(100),
            rate_limit_cooldown: Duration::from_secs(2),
        });
        let budget = Budget::new(2);
        let started = tokio::time::Instant::now();

        let report = scheduler
            .run(ids(2), &budget, |id| async move {
                ChunkReport {
                    rate_limited: id == "c0",
                    ..ok_report(id)
                }
            })
            .await;

        assert_eq!(report.reports.len(), 2);
        // c0: 100ms + 2s cooldown; c1: 100ms
        assert!(started.elapsed() >= Duration::from_millis(2200));
    }
}
