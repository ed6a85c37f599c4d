//! Rewards dashboard wire model.
//!
//! Field names mirror the `dashboard` object embedded in the rewards portal
//! page. Only the slices this program reads are modeled; unknown fields are
//! ignored on deserialize.

use serde::{Deserialize, Serialize};

use crate::search::{missing_points, DeviceMode, PointSnapshot};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DashboardSnapshot {
    pub user_status: UserStatus,
    #[serde(default)]
    pub user_profile: Option<UserProfile>,
}

impl DashboardSnapshot {
    /// Two-letter market hint from the profile, when the portal provides one.
    pub fn country_hint(&self) -> Option<&str> {
        self.user_profile
            .as_ref()
            .and_then(|profile| profile.attributes.country.as_deref())
    }

    pub fn counters(&self) -> &SearchCounters {
        &self.user_status.counters
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserStatus {
    #[serde(default)]
    pub available_points: u64,
    #[serde(default)]
    pub counters: SearchCounters,
}

/// Search progress counters. `pc_search[0]` is the generic desktop counter,
/// `pc_search[1]` the secondary (Edge bonus) counter. `mobile_search` is
/// absent entirely on accounts that never earned mobile points.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchCounters {
    #[serde(default)]
    pub pc_search: Vec<CounterEntry>,
    #[serde(default)]
    pub mobile_search: Option<Vec<CounterEntry>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CounterEntry {
    #[serde(default)]
    pub name: Option<String>,
    pub point_progress: u32,
    pub point_progress_max: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserProfile {
    #[serde(default)]
    pub attributes: ProfileAttributes,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProfileAttributes {
    #[serde(default)]
    pub country: Option<String>,
}

/// Points still earnable today across both device modes.
pub fn earnable_points(dashboard: &DashboardSnapshot) -> u32 {
    let snapshot = PointSnapshot::from(dashboard.counters());
    missing_points(&snapshot, DeviceMode::Desktop) + missing_points(&snapshot, DeviceMode::Mobile)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "userStatus": {
            "availablePoints": 4120,
            "counters": {
                "pcSearch": [
                    {"name": "Search PC", "pointProgress": 10, "pointProgressMax": 90},
                    {"name": "Search Edge", "pointProgress": 0, "pointProgressMax": 12}
                ],
                "mobileSearch": [
                    {"name": "Search Mobile", "pointProgress": 30, "pointProgressMax": 60}
                ]
            }
        },
        "userProfile": {
            "attributes": {"country": "gb"}
        }
    }"#;

    #[test]
    fn test_parse_dashboard() {
        let dashboard: DashboardSnapshot = serde_json::from_str(SAMPLE).unwrap();
        assert_eq!(dashboard.user_status.available_points, 4120);
        assert_eq!(dashboard.counters().pc_search.len(), 2);
        assert_eq!(dashboard.counters().pc_search[1].point_progress_max, 12);
        assert_eq!(dashboard.country_hint(), Some("gb"));
    }

    #[test]
    fn test_earnable_points_sums_both_modes() {
        let dashboard: DashboardSnapshot = serde_json::from_str(SAMPLE).unwrap();
        // desktop 80 + 12, mobile 30
        assert_eq!(earnable_points(&dashboard), 122);
    }

    #[test]
    fn test_missing_counters_default_empty() {
        let dashboard: DashboardSnapshot =
            serde_json::from_str(r#"{"userStatus": {"availablePoints": 0, "counters": {}}}"#)
                .unwrap();
        assert!(dashboard.counters().pc_search.is_empty());
        assert!(dashboard.counters().mobile_search.is_none());
        assert_eq!(earnable_points(&dashboard), 0);
        assert_eq!(dashboard.country_hint(), None);
    }
}
