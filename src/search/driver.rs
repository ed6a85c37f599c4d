//! Capability traits the engine drives the browser through.

use std::future::Future;

use crate::browser::BrowserError;

use super::points::PointSnapshot;

/// Browser operations one campaign needs, kept narrow so the loop logic runs
/// against a mock in tests. Implementations must resolve "the current tab"
/// freshly on every call; recovery can change which tab is frontmost at any
/// point between actions.
pub trait SearchPage {
    /// Clear the search box, enter `term` and submit it.
    fn submit_query(&self, term: &str) -> impl Future<Output = Result<(), BrowserError>> + Send;

    /// Scroll the result listing by `steps` keyboard steps.
    fn scroll(&self, steps: u32) -> impl Future<Output = Result<(), BrowserError>> + Send;

    /// Best-effort click on the first organic result, restoring the result
    /// listing afterward.
    fn click_first_result(&self) -> impl Future<Output = Result<(), BrowserError>> + Send;

    fn current_tab_count(&self) -> impl Future<Output = Result<usize, BrowserError>> + Send;

    fn focus_latest_tab(&self) -> impl Future<Output = Result<(), BrowserError>> + Send;

    /// History-back on the most-recently-opened tab.
    fn navigate_back(&self) -> impl Future<Output = Result<(), BrowserError>> + Send;

    /// Open a new tab at `url`.
    fn open_fresh(&self, url: &str) -> impl Future<Output = Result<(), BrowserError>> + Send;

    /// Close the most-recently-opened tab.
    fn close_tab(&self) -> impl Future<Output = Result<(), BrowserError>> + Send;

    /// Point the current tab at `url`.
    fn navigate(&self, url: &str) -> impl Future<Output = Result<(), BrowserError>> + Send;
}

/// Authoritative point-state read. May be stale by one action; the engine
/// diffs successive snapshots rather than trusting any single read.
pub trait PointOracle {
    fn point_snapshot(&self) -> impl Future<Output = Result<PointSnapshot, BrowserError>> + Send;
}
