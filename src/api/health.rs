//! Shared health state surfaced by the stats endpoint.
//! Updated by the monitor cycles, read by the operator API.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Mutex;

use dashmap::DashMap;
use serde::Serialize;

use crate::error::AppError;

/// Error and backoff counters. Counters are lifetime totals unless named `consecutive`.
#[derive(Default)]
pub struct HealthState {
    /// Source calls failed in a row, across all matches (0 after any success).
    consecutive_fetch_failures: AtomicU64,
    fetch_failures: AtomicU64,
    data_errors: AtomicU64,
    delivery_failures: AtomicU64,
    /// Cycle runs skipped because the previous run of the same cycle was still going.
    skipped_runs: AtomicU64,
    /// Monitor cycles that hit their deadline and left matches for the next tick.
    deadline_aborts: AtomicU64,
    /// Unix seconds of the last completed monitor cycle (0 = never).
    last_monitor_cycle_at: AtomicI64,
    /// match_id → consecutive failed polls. Cleared on the next successful poll.
    match_failures: DashMap<i64, u32>,
    last_error: Mutex<Option<String>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub consecutive_fetch_failures: u64,
    pub fetch_failures: u64,
    pub data_errors: u64,
    pub delivery_failures: u64,
    pub skipped_runs: u64,
    pub deadline_aborts: u64,
    pub last_monitor_cycle_at: Option<i64>,
    pub matches_in_backoff: usize,
    pub last_error: Option<String>,
}

impl HealthState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_fetch_ok(&self, match_id: Option<i64>) {
        self.consecutive_fetch_failures.store(0, Ordering::Relaxed);
        if let Some(id) = match_id {
            self.match_failures.remove(&id);
        }
    }

    pub fn record_fetch_failure(&self, match_id: Option<i64>, err: &AppError) {
        self.consecutive_fetch_failures.fetch_add(1, Ordering::Relaxed);
        self.fetch_failures.fetch_add(1, Ordering::Relaxed);
        if let Some(id) = match_id {
            *self.match_failures.entry(id).or_insert(0) += 1;
        }
        self.set_last_error(err);
    }

    pub fn record_data_error(&self, err: &AppError) {
        self.data_errors.fetch_add(1, Ordering::Relaxed);
        self.set_last_error(err);
    }

    pub fn record_delivery_failure(&self, err: &AppError) {
        self.delivery_failures.fetch_add(1, Ordering::Relaxed);
        self.set_last_error(err);
    }

    pub fn record_skipped_run(&self) {
        self.skipped_runs.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_deadline_abort(&self) {
        self.deadline_aborts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_last_monitor_cycle_at(&self, unix_secs: i64) {
        self.last_monitor_cycle_at.store(unix_secs, Ordering::Relaxed);
    }

    /// Consecutive failed polls for one match.
    pub fn match_failures(&self, match_id: i64) -> u32 {
        self.match_failures.get(&match_id).map(|v| *v).unwrap_or(0)
    }

    fn set_last_error(&self, err: &AppError) {
        if let Ok(mut last) = self.last_error.lock() {
            *last = Some(err.to_string());
        }
    }

    pub fn snapshot(&self) -> HealthSnapshot {
        let last_cycle = self.last_monitor_cycle_at.load(Ordering::Relaxed);
        HealthSnapshot {
            consecutive_fetch_failures: self.consecutive_fetch_failures.load(Ordering::Relaxed),
            fetch_failures: self.fetch_failures.load(Ordering::Relaxed),
            data_errors: self.data_errors.load(Ordering::Relaxed),
            delivery_failures: self.delivery_failures.load(Ordering::Relaxed),
            skipped_runs: self.skipped_runs.load(Ordering::Relaxed),
            deadline_aborts: self.deadline_aborts.load(Ordering::Relaxed),
            last_monitor_cycle_at: (last_cycle > 0).then_some(last_cycle),
            matches_in_backoff: self.match_failures.len(),
            last_error: self.last_error.lock().ok().and_then(|l| l.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn match_backoff_clears_on_success() {
        let health = HealthState::new();
        let err = AppError::TransientFetch("timeout".to_string());

        health.record_fetch_failure(Some(5), &err);
        health.record_fetch_failure(Some(5), &err);
        assert_eq!(health.match_failures(5), 2);
        assert_eq!(health.snapshot().matches_in_backoff, 1);
        assert_eq!(health.snapshot().consecutive_fetch_failures, 2);

        health.record_fetch_ok(Some(5));
        let snap = health.snapshot();
        assert_eq!(health.match_failures(5), 0);
        assert_eq!(snap.matches_in_backoff, 0);
        assert_eq!(snap.consecutive_fetch_failures, 0);
        assert_eq!(snap.fetch_failures, 2);
        assert!(snap.last_error.unwrap().contains("timeout"));
    }
}
