//! Shared chunk budget and cooperative cancellation
//!
//! The budget is the run's stop signal: batches reserve chunks from it before
//! they start, and once nothing remains no new batch is issued. In-flight
//! batches are never interrupted.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// External stop request, checked before each batch
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }
}

/// Chunks a run may still consume
#[derive(Debug)]
pub struct Budget {
    limit: u64,
    reserved: AtomicU64,
    cancel: CancellationToken,
}

impl Budget {
    pub fn new(limit: u64) -> Self {
        Self {
            limit,
            reserved: AtomicU64::new(0),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Reserve up to `wanted` chunks, returning how many were granted.
    ///
    /// Grants fewer than asked when the budget is nearly spent and zero once
    /// it is exhausted or cancelled.
    pub fn try_reserve(&self, wanted: u64) -> u64 {
        if self.cancel.is_cancelled() {
            return 0;
        }
        let mut current = self.reserved.load(Ordering::Acquire);
        loop {
            let granted = wanted.min(self.limit.saturating_sub(current));
            if granted == 0 {
                return 0;
            }
            match self.reserved.compare_exchange_weak(
                current,
                current + granted,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return granted,
                Err(actual) => current = actual,
            }
        }
    }

    pub fn limit(&self) -> u64 {
        self.limit
    }

    pub fn used(&self) -> u64 {
        self.reserved.load(Ordering::Acquire)
    }

    pub fn remaining(&self) -> u64 {
        self.limit.saturating_sub(self.used())
    }

    pub fn is_exhausted(&self) -> bool {
        self.remaining() == 0 || self.cancel.is_cancelled()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}
