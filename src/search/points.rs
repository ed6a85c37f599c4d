//! Point snapshot model and quota arithmetic.

use crate::dashboard::SearchCounters;

use super::DeviceMode;

/// Counter categories the rewards platform reports for searches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PointCategory {
    Mobile,
    DesktopGeneric,
    DesktopSecondary,
}

/// One progress/max reading. `progress_max >= progress` on the wire; the
/// arithmetic saturates rather than trusting that.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PointCounter {
    pub progress: u32,
    pub progress_max: u32,
}

impl PointCounter {
    pub fn new(progress: u32, progress_max: u32) -> Self {
        Self {
            progress,
            progress_max,
        }
    }

    fn remaining(&self) -> u32 {
        self.progress_max.saturating_sub(self.progress)
    }
}

/// Categorized point state at one instant. At most one counter per category;
/// absent categories simply read as `None`. Snapshots are never mutated,
/// only superseded by a fresh fetch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PointSnapshot {
    pub mobile: Option<PointCounter>,
    pub desktop_generic: Option<PointCounter>,
    pub desktop_secondary: Option<PointCounter>,
}

impl PointSnapshot {
    pub fn get(&self, category: PointCategory) -> Option<&PointCounter> {
        match category {
            PointCategory::Mobile => self.mobile.as_ref(),
            PointCategory::DesktopGeneric => self.desktop_generic.as_ref(),
            PointCategory::DesktopSecondary => self.desktop_secondary.as_ref(),
        }
    }
}

impl From<&SearchCounters> for PointSnapshot {
    fn from(counters: &SearchCounters) -> Self {
        let entry = |e: Option<&crate::dashboard::CounterEntry>| {
            e.map(|c| PointCounter::new(c.point_progress, c.point_progress_max))
        };
        Self {
            mobile: entry(counters.mobile_search.as_deref().and_then(|m| m.first())),
            desktop_generic: entry(counters.pc_search.first()),
            desktop_secondary: entry(counters.pc_search.get(1)),
        }
    }
}

/// Quota remaining for one device mode.
///
/// Mobile mode reads the mobile counter only; desktop mode sums the generic
/// and secondary counters. An absent category contributes 0, so a snapshot
/// without the relevant counters yields 0 and the campaign is a no-op. Pure:
/// this is the single source of truth for "done" and for "did the last
/// search help".
pub fn missing_points(snapshot: &PointSnapshot, mode: DeviceMode) -> u32 {
    if mode.is_mobile() {
        return snapshot.mobile.map(|c| c.remaining()).unwrap_or(0);
    }

    let secondary = snapshot.desktop_secondary.map(|c| c.remaining()).unwrap_or(0);
    let generic = snapshot.desktop_generic.map(|c| c.remaining()).unwrap_or(0);
    secondary + generic
}
