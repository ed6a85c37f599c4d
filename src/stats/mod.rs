//! Statistics module
//!
//! Lock-free run counters plus the per-account outcome report.

mod atomic;

pub use atomic::{AccountOutcome, RunStats, RunStatsSnapshot};
