//! Live driver for the search campaign
//!
//! `LiveSearchPage` binds the campaign's capability traits to a running
//! `BrowserSession`. The campaign owns the most-recently-opened tab; the
//! rewards home tab stays one below it and is where point state is read.

use std::sync::Arc;
use std::time::Duration;

use chromiumoxide::Page;
use tracing::{debug, warn};

use super::{BrowserError, BrowserSession};
use crate::dashboard::DashboardSnapshot;
use crate::search::{PointOracle, PointSnapshot, SearchPage};
use crate::stats::RunStats;

/// The rewards portal; the home tab lives here.
pub const PORTAL_URL: &str = "https://rewards.bing.com/";

const SEARCH_BOX: &str = "#sb_form_q";
const FIRST_RESULT: &str = "#b_results .b_algo h2";

const SEARCH_BOX_WAIT: Duration = Duration::from_secs(10);

/// How long a clicked result gets to load before we put the listing back.
const CLICK_SETTLE: Duration = Duration::from_secs(5);

const RESTORE_ATTEMPTS: usize = 5;

/// Blank tab, rewards home tab, search worker tab.
const NOMINAL_TABS: usize = 3;

const DASHBOARD_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// The portal keeps its state in a `dashboard` global; stringify it so the
/// whole object crosses the protocol as one value.
const DASHBOARD_JS: &str = r#"(() => {
    try { return JSON.stringify(dashboard); } catch (e) { return null; }
})()"#;

pub struct LiveSearchPage {
    session: Arc<BrowserSession>,
    stats: Arc<RunStats>,
}

impl LiveSearchPage {
    pub fn new(session: Arc<BrowserSession>, stats: Arc<RunStats>) -> Self {
        Self { session, stats }
    }

    /// After a result click the worker tab is either elsewhere in history or
    /// buried under a popup. Walk it back to the listing URL captured before
    /// the click; give up quietly after a few rounds.
    async fn restore_listing(&self, listing: &str) {
        for _ in 0..RESTORE_ATTEMPTS {
            let current = match self.session.current_url().await {
                Ok(url) => url,
                Err(e) => {
                    warn!("[Search] Could not read the landing URL: {}", e);
                    return;
                }
            };
            if current == listing {
                return;
            }

            let step = match self.session.page_count().await {
                Ok(count) if count > NOMINAL_TABS => self.session.close_latest().await,
                _ => self.session.back().await,
            };
            if let Err(e) = step {
                warn!("[Search] Restoring the result listing failed: {}", e);
                return;
            }
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
    }
}

impl SearchPage for LiveSearchPage {
    async fn submit_query(&self, term: &str) -> Result<(), BrowserError> {
        self.session
            .wait_for_element(SEARCH_BOX, SEARCH_BOX_WAIT)
            .await?;
        self.session.click(SEARCH_BOX).await?;
        tokio::time::sleep(Duration::from_millis(500)).await;
        self.session.clear_input().await?;
        self.session.type_text(term).await?;
        self.session.press_enter().await?;
        self.stats.record_search();
        Ok(())
    }

    async fn scroll(&self, steps: u32) -> Result<(), BrowserError> {
        self.session.press_arrow_down(steps).await
    }

    async fn click_first_result(&self) -> Result<(), BrowserError> {
        let listing = self.session.current_url().await?;
        self.session.click(FIRST_RESULT).await?;
        tokio::time::sleep(CLICK_SETTLE).await;
        self.restore_listing(&listing).await;
        Ok(())
    }

    async fn current_tab_count(&self) -> Result<usize, BrowserError> {
        self.session.page_count().await
    }

    async fn focus_latest_tab(&self) -> Result<(), BrowserError> {
        self.session.focus_latest().await
    }

    async fn navigate_back(&self) -> Result<(), BrowserError> {
        self.session.back().await
    }

    async fn open_fresh(&self, url: &str) -> Result<(), BrowserError> {
        self.session.new_page(url).await?;
        Ok(())
    }

    async fn close_tab(&self) -> Result<(), BrowserError> {
        self.session.close_latest().await
    }

    async fn navigate(&self, url: &str) -> Result<(), BrowserError> {
        self.session.navigate(url).await
    }
}

impl PointOracle for LiveSearchPage {
    async fn point_snapshot(&self) -> Result<PointSnapshot, BrowserError> {
        let dashboard = fetch_dashboard(&self.session).await?;
        Ok(PointSnapshot::from(dashboard.counters()))
    }
}

/// The home tab sits second in the tab list once the nominal population is
/// up; before that, whatever tab exists is it.
async fn home_page(session: &BrowserSession) -> Result<Page, BrowserError> {
    let mut pages = session.pages().await?;
    if pages.is_empty() {
        return Err(BrowserError::SessionClosed("no open tabs".to_string()));
    }
    let index = if pages.len() > 1 { 1 } else { 0 };
    Ok(pages.swap_remove(index))
}

/// Read the rewards dashboard from the home tab.
///
/// When the global is missing (stale tab, interrupted load) the tab is
/// pointed at the portal again and read once more.
pub async fn fetch_dashboard(
    session: &BrowserSession,
) -> Result<DashboardSnapshot, BrowserError> {
    if let Some(snapshot) = read_dashboard(session).await? {
        return Ok(snapshot);
    }

    debug!(
        "[Session] {} dashboard global missing, reloading the portal",
        session.label()
    );
    let home = home_page(session).await?;
    home.goto(PORTAL_URL)
        .await
        .map_err(|e| BrowserError::NavigationFailed(e.to_string()))?;
    let _ = tokio::time::timeout(DASHBOARD_READ_TIMEOUT, home.wait_for_navigation()).await;

    read_dashboard(session).await?.ok_or_else(|| {
        BrowserError::JavaScriptError("dashboard global not present on the portal".to_string())
    })
}

async fn read_dashboard(
    session: &BrowserSession,
) -> Result<Option<DashboardSnapshot>, BrowserError> {
    let home = home_page(session).await?;
    let raw = tokio::time::timeout(DASHBOARD_READ_TIMEOUT, home.evaluate(DASHBOARD_JS))
        .await
        .map_err(|_| BrowserError::Timeout("dashboard read timed out".to_string()))?
        .map_err(|e| BrowserError::JavaScriptError(e.to_string()))?;

    let value = raw
        .into_value::<serde_json::Value>()
        .unwrap_or(serde_json::Value::Null);
    let Some(text) = value.as_str() else {
        return Ok(None);
    };

    serde_json::from_str(text)
        .map(Some)
        .map_err(|e| BrowserError::JavaScriptError(format!("dashboard did not parse: {}", e)))
}
