//! Per-request counters, written by the dispatcher and read by the request
//! summary logger.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use serde::Serialize;

use crate::work_unit::UnitOutcome;

#[derive(Debug, Default)]
pub struct RequestStats {
    bytes: AtomicU64,
    routes_total: AtomicUsize,
    routes_success: AtomicUsize,
    routes_empty: AtomicUsize,
    routes_failed: AtomicUsize,
}

/// Point-in-time copy of [`RequestStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub bytes: u64,
    pub routes_total: usize,
    pub routes_success: usize,
    pub routes_empty: usize,
    pub routes_failed: usize,
}

impl StatsSnapshot {
    /// Sub-requests that have finished, whatever their outcome.
    pub fn routes_completed(&self) -> usize {
        self.routes_success + self.routes_empty + self.routes_failed
    }
}

impl RequestStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn set_routes_total(&self, n: usize) {
        self.routes_total.store(n, Ordering::SeqCst);
    }

    pub(crate) fn add_bytes(&self, n: usize) {
        self.bytes.fetch_add(n as u64, Ordering::SeqCst);
    }

    pub(crate) fn record(&self, outcome: UnitOutcome) {
        let counter = match outcome {
            UnitOutcome::Success => &self.routes_success,
            UnitOutcome::NoData => &self.routes_empty,
            UnitOutcome::Failed => &self.routes_failed,
        };
        counter.fetch_add(1, Ordering::SeqCst);
    }

    /// Bytes released to the response so far.
    pub fn bytes(&self) -> u64 {
        self.bytes.load(Ordering::SeqCst)
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            bytes: self.bytes(),
            routes_total: self.routes_total.load(Ordering::SeqCst),
            routes_success: self.routes_success.load(Ordering::SeqCst),
            routes_empty: self.routes_empty.load(Ordering::SeqCst),
            routes_failed: self.routes_failed.load(Ordering::SeqCst),
        }
    }
}
