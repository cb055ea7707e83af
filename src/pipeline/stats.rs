//! Run statistics

use crate::storage::CommitOutcome;
use chrono::{DateTime, Utc};
use serde::Serialize;

/// Per-collection counters for one run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CollectionStats {
    pub collection: String,
    pub priority: u32,
    /// Chunks not yet processed when the collection started
    pub chunks_candidate: usize,
    pub chunks_processed: usize,
    /// Already processed in an earlier run
    pub chunks_skipped: usize,
    pub chunks_failed: usize,
    /// Candidates left for a future run because the budget ran out
    pub chunks_deferred: usize,
    pub entities_created: usize,
    pub entities_merged: usize,
    pub relationships_created: usize,
    pub relationships_merged: usize,
    /// The source could not be reached; nothing was attempted
    pub unavailable: bool,
}

impl CollectionStats {
    pub fn new(collection: impl Into<String>, priority: u32) -> Self {
        Self {
            collection: collection.into(),
            priority,
            ..Default::default()
        }
    }

    pub(crate) fn record_commit(&mut self, outcome: &CommitOutcome) {
        self.chunks_processed += 1;
        self.entities_created += outcome.entities_created;
        self.entities_merged += outcome.entities_merged;
        self.relationships_created += outcome.relationships_created;
        self.relationships_merged += outcome.relationships_merged;
    }

    pub fn chunks_attempted(&self) -> usize {
        self.chunks_processed + self.chunks_failed
    }
}

/// Result of one pipeline invocation
#[derive(Debug, Clone, Serialize)]
pub struct RunStats {
    pub pipeline: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub daily_budget: u64,
    /// Chunks already consumed today before this run started
    pub used_before_run: u64,
    /// Chunks this run consumed
    pub budget_used: u64,
    pub budget_remaining: u64,
    pub collections: Vec<CollectionStats>,
    pub errors: Vec<String>,
    /// Errors dropped once `errors` reached its cap
    pub errors_truncated: usize,
    #[serde(skip)]
    max_errors: usize,
}

impl RunStats {
    pub fn new(pipeline: impl Into<String>, daily_budget: u64, used_before_run: u64, max_errors: usize) -> Self {
        Self {
            pipeline: pipeline.into(),
            started_at: Utc::now(),
            finished_at: None,
            daily_budget,
            used_before_run,
            budget_used: 0,
            budget_remaining: daily_budget.saturating_sub(used_before_run),
            collections: Vec::new(),
            errors: Vec::new(),
            errors_truncated: 0,
            max_errors,
        }
    }

    pub fn record_error(&mut self, message: impl Into<String>) {
        if self.errors.len() < self.max_errors {
            self.errors.push(message.into());
        } else {
            self.errors_truncated += 1;
        }
    }

    pub(crate) fn finish(&mut self, budget_used: u64, budget_remaining: u64) {
        self.budget_used = budget_used;
        self.budget_remaining = budget_remaining;
        self.finished_at = Some(Utc::now());
    }

    pub fn collection(&self, name: &str) -> Option<&CollectionStats> {
        self.collections.iter().find(|c| c.collection == name)
    }

    pub fn chunks_processed(&self) -> usize {
        self.collections.iter().map(|c| c.chunks_processed).sum()
    }

    pub fn chunks_failed(&self) -> usize {
        self.collections.iter().map(|c| c.chunks_failed).sum()
    }

    pub fn entities_created(&self) -> usize {
        self.collections.iter().map(|c| c.entities_created).sum()
    }

    pub fn relationships_created(&self) -> usize {
        self.collections.iter().map(|c| c.relationships_created).sum()
    }

    pub fn error_count(&self) -> usize {
        self.errors.len() + self.errors_truncated
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_list_is_bounded() {
        let mut stats = RunStats::new("kg", 10, 0, 2);
        for i in 0..5 {
            stats.record_error(format!("error {}", i));
        }
        assert_eq!(stats.errors, vec!["error 0", "error 1"]);
        assert_eq!(stats.errors_truncated, 3);
        assert_eq!(stats.error_count(), 5);
    }

    #[test]
    fn totals_sum_collections() {
        let mut stats = RunStats::new("kg", 10, 4, 100);
        assert_eq!(stats.budget_remaining, 6);

        let mut a = CollectionStats::new("kbli", 1);
        a.record_commit(&CommitOutcome {
            entities_created: 2,
            relationships_created: 1,
            ..Default::default()
        });
        let mut b = CollectionStats::new("perizinan", 2);
        b.chunks_failed = 1;
        b.record_commit(&CommitOutcome {
            entities_merged: 2,
            ..Default::default()
        });
        stats.collections = vec![a, b];

        assert_eq!(stats.chunks_processed(), 2);
        assert_eq!(stats.chunks_failed(), 1);
        assert_eq!(stats.entities_created(), 2);
        assert_eq!(stats.collection("perizinan").unwrap().chunks_attempted(), 2);
        assert!(stats.collection("missing").is_none());
    }

    #[test]
    fn serializes_without_internal_cap() {
        let mut stats = RunStats::new("kg", 10, 0, 100);
        stats.finish(3, 7);
        let json = serde_json::to_value(&stats).unwrap();
        assert_eq!(json["budget_used"], 3);
        assert!(json.get("max_errors").is_none());
        assert!(json["finished_at"].is_string());
    }
}
