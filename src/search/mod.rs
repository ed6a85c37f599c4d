//! Adaptive search-point acquisition engine.
//!
//! Drives a browser through search queries until the account's point quota
//! for the active device mode is met, the query supply runs dry, or progress
//! stalls past repair. Split into small pieces so the campaign logic runs
//! against a mock driver in tests:
//!
//! - `points` - point snapshot model and quota arithmetic
//! - `queries` - trend-feed query generation and suggestion lookups
//! - `driver` - capability traits the engine drives the browser through
//! - `recovery` - tab-state repair after a failed action
//! - `engine` - the two-phase campaign loop itself

mod driver;
mod engine;
mod points;
mod queries;
mod recovery;

pub use driver::{PointOracle, SearchPage};
pub use engine::{run_search_campaign, CampaignOutcome};
pub use points::{missing_points, PointCategory, PointCounter, PointSnapshot};
pub use queries::{QueryPlan, QuerySource, TrendFeed, TrendTopic};
pub use recovery::{recover, RecoveryAction};

use serde::{Deserialize, Serialize};

/// Canonical search page all campaigns start from and recover back to.
pub const SEARCH_PAGE_URL: &str = "https://bing.com";

/// Device mode a campaign runs under. Point counters, query flattening and
/// the session user agent all key off this.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceMode {
    Desktop,
    Mobile,
}

impl DeviceMode {
    pub fn is_mobile(&self) -> bool {
        matches!(self, DeviceMode::Mobile)
    }

    pub fn label(&self) -> &'static str {
        match self {
            DeviceMode::Desktop => "DESKTOP",
            DeviceMode::Mobile => "MOBILE",
        }
    }
}

impl std::fmt::Display for DeviceMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// Engagement and pacing knobs, injected read-only into every campaign.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchSettings {
    #[serde(default)]
    pub use_geo_locale_queries: bool,
    #[serde(default = "default_true")]
    pub scroll_random_results: bool,
    #[serde(default = "default_true")]
    pub click_random_results: bool,
    #[serde(default = "default_search_delay")]
    pub search_delay: DelayRange,
}

/// Inclusive delay bounds in milliseconds.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct DelayRange {
    pub min: u64,
    pub max: u64,
}

fn default_true() -> bool {
    true
}

fn default_search_delay() -> DelayRange {
    DelayRange {
        min: 10_000,
        max: 20_000,
    }
}

impl Default for SearchSettings {
    fn default() -> Self {
        Self {
            use_geo_locale_queries: false,
            scroll_random_results: true,
            click_random_results: true,
            search_delay: default_search_delay(),
        }
    }
}
