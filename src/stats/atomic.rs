//! Lock-free run statistics using atomic operations
//!
//! Counters are shared across every account task; the per-account outcome
//! list is the only guarded piece.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Statistics for one whole sweep across every account.
#[derive(Debug, Default)]
pub struct RunStats {
    pub searches: AtomicU64,
    pub points_collected: AtomicU64,
    pub errors: AtomicU64,
    pub accounts_completed: AtomicU64,
    pub accounts_failed: AtomicU64,
    pub start_time: AtomicU64,
    outcomes: Mutex<Vec<AccountOutcome>>,
}

impl RunStats {
    pub fn new() -> Self {
        Self {
            start_time: AtomicU64::new(now_secs()),
            ..Default::default()
        }
    }

    /// Record one submitted search.
    pub fn record_search(&self) {
        self.searches.fetch_add(1, Ordering::Relaxed);
    }

    /// Record points confirmed collected for an account.
    pub fn record_points(&self, points: u64) {
        self.points_collected.fetch_add(points, Ordering::Relaxed);
    }

    /// Record an account-level error.
    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    /// File an account's final outcome and tally it.
    pub fn record_outcome(&self, outcome: AccountOutcome) {
        if outcome.failed {
            self.accounts_failed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.accounts_completed.fetch_add(1, Ordering::Relaxed);
        }
        self.outcomes.lock().push(outcome);
    }

    pub fn searches(&self) -> u64 {
        self.searches.load(Ordering::Relaxed)
    }

    pub fn points_collected(&self) -> u64 {
        self.points_collected.load(Ordering::Relaxed)
    }

    pub fn elapsed_secs(&self) -> u64 {
        now_secs().saturating_sub(self.start_time.load(Ordering::Relaxed))
    }

    /// Get snapshot for serialization
    pub fn snapshot(&self) -> RunStatsSnapshot {
        RunStatsSnapshot {
            searches: self.searches.load(Ordering::Relaxed),
            points_collected: self.points_collected.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            accounts_completed: self.accounts_completed.load(Ordering::Relaxed),
            accounts_failed: self.accounts_failed.load(Ordering::Relaxed),
            elapsed_secs: self.elapsed_secs(),
        }
    }

    /// The per-account report in filing order.
    pub fn outcome_report(&self) -> Vec<AccountOutcome> {
        self.outcomes.lock().clone()
    }
}

/// Serializable snapshot of the run counters
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunStatsSnapshot {
    pub searches: u64,
    pub points_collected: u64,
    pub errors: u64,
    pub accounts_completed: u64,
    pub accounts_failed: u64,
    pub elapsed_secs: u64,
}

/// How one account's sweep went, for the end-of-run report.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountOutcome {
    pub email: String,
    pub collected: u32,
    pub desktop: String,
    pub mobile: String,
    pub failed: bool,
    pub timestamp: String,
}
