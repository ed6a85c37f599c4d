//! The two-phase campaign loop.
//!
//! One run drives searches for a single account and device mode until the
//! point quota is met, the query supply runs dry, or progress stalls past
//! repair. Nothing in here returns an error: failures are retried, recovered
//! around, or folded into the outcome.

use std::time::Duration;

use rand::Rng;
use tracing::{error, info, warn};

use crate::browser::BrowserError;
use crate::dashboard::DashboardSnapshot;

use super::driver::{PointOracle, SearchPage};
use super::points::{missing_points, PointSnapshot};
use super::queries::{resolve_geo, QuerySource, TrendFeed, TrendTopic};
use super::recovery::recover;
use super::{DeviceMode, SearchSettings, SEARCH_PAGE_URL};

/// Attempts per logical search before the envelope gives up on the term.
const SEARCH_ATTEMPTS: u32 = 5;

/// Fixed cooldown between attempts, applied after recovery has run.
const SEARCH_RETRY_COOLDOWN: Duration = Duration::from_secs(4);

/// The two phases tolerate different dry spells on purpose: the primary pass
/// still has fresh queries ahead of it and can afford patience, while the
/// fallback pass is the last resort, so a stall there means the account is
/// stuck for today.
const PRIMARY_STALL_LIMIT: u32 = 10;
const SECONDARY_STALL_LIMIT: u32 = 5;

/// Keyboard-step bounds for the engagement scroll.
const SCROLL_STEPS_MIN: u32 = 5;
const SCROLL_STEPS_MAX: u32 = 400;

/// Settle time before each optional engagement action.
const ENGAGEMENT_SETTLE: Duration = Duration::from_secs(2);

/// How one campaign run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CampaignOutcome {
    /// Quota met, or there was nothing to do.
    Completed,
    /// Query and topic supply ran out with points still missing.
    Shortfall { missing: u32 },
    /// The fallback phase stalled out; this account/mode is stuck for now.
    Aborted { missing: u32 },
}

impl std::fmt::Display for CampaignOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CampaignOutcome::Completed => write!(f, "completed"),
            CampaignOutcome::Shortfall { missing } => {
                write!(f, "ended {} points short", missing)
            }
            CampaignOutcome::Aborted { missing } => {
                write!(f, "aborted with {} points left", missing)
            }
        }
    }
}

/// Mutable state for one run, built fresh per account/mode and dropped when
/// the run ends.
struct CampaignState {
    missing: u32,
    stall: StallCounter,
    last_snapshot: PointSnapshot,
}

impl CampaignState {
    /// Fold a fresh snapshot into the state and return the new missing value.
    fn adopt(&mut self, snapshot: PointSnapshot, mode: DeviceMode) -> u32 {
        let current = missing_points(&snapshot, mode);
        self.stall.observe(self.missing, current);
        self.missing = current;
        self.last_snapshot = snapshot;
        current
    }
}

/// Counts consecutive actions that left MissingPoints unchanged. Any change,
/// in either direction, resets the run: an increase is counter noise, not
/// negative progress.
struct StallCounter {
    consecutive: u32,
}

impl StallCounter {
    fn new() -> Self {
        Self { consecutive: 0 }
    }

    fn observe(&mut self, previous: u32, current: u32) {
        if current == previous {
            self.consecutive += 1;
        } else {
            self.consecutive = 0;
        }
    }

    fn exceeded(&self, limit: u32) -> bool {
        self.consecutive > limit
    }

    fn reset(&mut self) {
        self.consecutive = 0;
    }
}

enum PrimaryExit {
    QuotaMet,
    Stalled,
    Exhausted,
}

/// Run one search campaign against the live query feeds.
///
/// Never returns an error and is safe to call again: the next call
/// re-evaluates the quota from the dashboard it is given and may no-op.
pub async fn run_search_campaign<P>(
    page: &P,
    dashboard: &DashboardSnapshot,
    mode: DeviceMode,
    settings: &SearchSettings,
) -> CampaignOutcome
where
    P: SearchPage + PointOracle,
{
    run_campaign(page, &TrendFeed, dashboard, mode, settings).await
}

pub(crate) async fn run_campaign<P, S>(
    page: &P,
    source: &S,
    dashboard: &DashboardSnapshot,
    mode: DeviceMode,
    settings: &SearchSettings,
) -> CampaignOutcome
where
    P: SearchPage + PointOracle,
    S: QuerySource,
{
    info!("[Search] Starting searches | Mode: {}", mode);

    if let Err(e) = page.focus_latest_tab().await {
        warn!("[Search] Could not focus the latest tab: {}", e);
    }

    let initial = PointSnapshot::from(dashboard.counters());
    let missing = missing_points(&initial, mode);
    if missing == 0 {
        info!("[Search] Searches for {} are already completed", mode);
        return CampaignOutcome::Completed;
    }

    let geo = resolve_geo(dashboard.country_hint(), settings.use_geo_locale_queries);
    let plan = source.query_plan(&geo, missing as usize, mode).await;

    if let Err(e) = page.navigate(SEARCH_PAGE_URL).await {
        // first submit will fail and go through the retry envelope instead
        warn!("[Search] Opening the search page failed: {}", e);
    }

    let mut state = CampaignState {
        missing,
        stall: StallCounter::new(),
        last_snapshot: initial,
    };

    if let PrimaryExit::QuotaMet =
        run_primary(page, &mut state, &plan.queries, mode, settings).await
    {
        info!("[Search] Completed searches");
        return CampaignOutcome::Completed;
    }

    info!(
        "[Search] Primary queries done but {} points remain, generating extra searches",
        state.missing
    );
    state.stall.reset();

    let outcome = run_secondary(page, source, &mut state, &plan.topics, mode, settings).await;
    info!("[Search] Run for {} {}", mode, outcome);
    outcome
}

/// First pass over the flattened query queue.
async fn run_primary<P>(
    page: &P,
    state: &mut CampaignState,
    queries: &[String],
    mode: DeviceMode,
    settings: &SearchSettings,
) -> PrimaryExit
where
    P: SearchPage + PointOracle,
{
    for term in queries {
        info!(
            "[Search] {} points remaining | Query: {} | Mode: {}",
            state.missing, term, mode
        );

        let snapshot = attempt_search(page, term, settings, &state.last_snapshot).await;
        if state.adopt(snapshot, mode) == 0 {
            return PrimaryExit::QuotaMet;
        }

        if state.stall.exceeded(PRIMARY_STALL_LIMIT) {
            warn!(
                "[Search] No points gained for {} searches, switching to fallback queries",
                PRIMARY_STALL_LIMIT
            );
            state.stall.reset();
            return PrimaryExit::Stalled;
        }
    }

    PrimaryExit::Exhausted
}

/// Fallback pass: walk the topic list again and search fresh suggestions.
async fn run_secondary<P, S>(
    page: &P,
    source: &S,
    state: &mut CampaignState,
    topics: &[TrendTopic],
    mode: DeviceMode,
    settings: &SearchSettings,
) -> CampaignOutcome
where
    P: SearchPage + PointOracle,
    S: QuerySource,
{
    for entry in topics {
        let related = source.related_terms(&entry.topic).await;
        // index 0 echoes the topic; indices 1 and 2 are the terms we want,
        // so anything shorter than 4 entries is not worth a search
        if related.len() < 4 {
            continue;
        }

        for term in &related[1..3] {
            info!(
                "[Search-Fallback] {} points remaining | Query: {} | Mode: {}",
                state.missing, term, mode
            );

            let snapshot = attempt_search(page, term, settings, &state.last_snapshot).await;
            if state.adopt(snapshot, mode) == 0 {
                info!("[Search] Completed searches");
                return CampaignOutcome::Completed;
            }

            if state.stall.exceeded(SECONDARY_STALL_LIMIT) {
                warn!(
                    "[Search-Fallback] No points gained for {} fallback searches, giving up",
                    SECONDARY_STALL_LIMIT
                );
                return CampaignOutcome::Aborted {
                    missing: state.missing,
                };
            }
        }
    }

    info!(
        "[Search-Fallback] Fallback topics exhausted with {} points left",
        state.missing
    );
    CampaignOutcome::Shortfall {
        missing: state.missing,
    }
}

/// Retry envelope around one logical search: on failure, repair the tab
/// state, cool down, and retry the same term. After the last attempt the
/// envelope degrades to a plain snapshot fetch so the campaign can carry on
/// with the next query; it never propagates an error.
async fn attempt_search<P>(
    page: &P,
    term: &str,
    settings: &SearchSettings,
    last: &PointSnapshot,
) -> PointSnapshot
where
    P: SearchPage + PointOracle,
{
    for attempt in 1..=SEARCH_ATTEMPTS {
        match perform_search(page, term, settings).await {
            Ok(snapshot) => return snapshot,
            Err(e) => {
                warn!(
                    "[Search] Attempt {}/{} for '{}' failed: {}",
                    attempt, SEARCH_ATTEMPTS, term, e
                );
                recover(page).await;
                tokio::time::sleep(SEARCH_RETRY_COOLDOWN).await;
            }
        }
    }

    error!(
        "[Search] '{}' failed after {} attempts, keeping last known point state",
        term, SEARCH_ATTEMPTS
    );
    match page.point_snapshot().await {
        Ok(snapshot) => snapshot,
        Err(_) => last.clone(),
    }
}

/// One browser-level search action: submit, optional engagement, paced
/// delay, fresh snapshot. Engagement failures are logged and swallowed;
/// submit and snapshot failures bubble to the retry envelope.
async fn perform_search<P>(
    page: &P,
    term: &str,
    settings: &SearchSettings,
) -> Result<PointSnapshot, BrowserError>
where
    P: SearchPage + PointOracle,
{
    page.submit_query(term).await?;

    if settings.scroll_random_results {
        tokio::time::sleep(ENGAGEMENT_SETTLE).await;
        let steps = rand::thread_rng().gen_range(SCROLL_STEPS_MIN..=SCROLL_STEPS_MAX);
        if let Err(e) = page.scroll(steps).await {
            warn!("[Search] Scroll failed: {}", e);
        }
    }

    if settings.click_random_results {
        tokio::time::sleep(ENGAGEMENT_SETTLE).await;
        if let Err(e) = page.click_first_result().await {
            warn!("[Search] Result click failed: {}", e);
        }
    }

    let lo = settings.search_delay.min;
    let hi = settings.search_delay.max.max(lo);
    let delay = rand::thread_rng().gen_range(lo..=hi);
    tokio::time::sleep(Duration::from_millis(delay)).await;

    page.point_snapshot().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dashboard::SearchCounters;
    use crate::search::queries::QueryPlan;
    use crate::search::points::PointCounter;
    use std::collections::{HashMap, VecDeque};
    use std::sync::Mutex;

    fn desktop_snapshot(progress: u32, max: u32) -> PointSnapshot {
        PointSnapshot {
            desktop_generic: Some(PointCounter::new(progress, max)),
            ..Default::default()
        }
    }

    fn desktop_dashboard(progress: u32, max: u32) -> DashboardSnapshot {
        let counters: SearchCounters = serde_json::from_value(serde_json::json!({
            "pcSearch": [{"pointProgress": progress, "pointProgressMax": max}]
        }))
        .unwrap();
        serde_json::from_value(serde_json::json!({
            "userStatus": {"availablePoints": 0, "counters": counters}
        }))
        .unwrap()
    }

    fn quick_settings() -> SearchSettings {
        SearchSettings {
            use_geo_locale_queries: false,
            scroll_random_results: false,
            click_random_results: false,
            search_delay: crate::search::DelayRange { min: 0, max: 1 },
        }
    }

    struct MockPage {
        submits: Mutex<Vec<String>>,
        ops: Mutex<Vec<String>>,
        snapshots: Mutex<VecDeque<PointSnapshot>>,
        steady_snapshot: PointSnapshot,
        fail_submits: Mutex<u32>,
        oracle_down: bool,
        tabs: usize,
    }

    impl MockPage {
        fn steady(snapshot: PointSnapshot) -> Self {
            Self {
                submits: Mutex::new(Vec::new()),
                ops: Mutex::new(Vec::new()),
                snapshots: Mutex::new(VecDeque::new()),
                steady_snapshot: snapshot,
                fail_submits: Mutex::new(0),
                oracle_down: false,
                tabs: 3,
            }
        }

        fn scripted(sequence: Vec<PointSnapshot>, steady: PointSnapshot) -> Self {
            let mock = Self::steady(steady);
            *mock.snapshots.lock().unwrap() = sequence.into();
            mock
        }

        fn submitted(&self) -> Vec<String> {
            self.submits.lock().unwrap().clone()
        }

        fn op_count(&self, op: &str) -> usize {
            self.ops.lock().unwrap().iter().filter(|o| *o == op).count()
        }
    }

    impl SearchPage for MockPage {
        async fn submit_query(&self, term: &str) -> Result<(), BrowserError> {
            self.submits.lock().unwrap().push(term.to_string());
            let mut failures = self.fail_submits.lock().unwrap();
            if *failures > 0 {
                *failures -= 1;
                return Err(BrowserError::ElementNotFound("search box".into()));
            }
            Ok(())
        }
        async fn scroll(&self, _steps: u32) -> Result<(), BrowserError> {
            self.ops.lock().unwrap().push("scroll".into());
            Ok(())
        }
        async fn click_first_result(&self) -> Result<(), BrowserError> {
            self.ops.lock().unwrap().push("click".into());
            Ok(())
        }
        async fn current_tab_count(&self) -> Result<usize, BrowserError> {
            Ok(self.tabs)
        }
        async fn focus_latest_tab(&self) -> Result<(), BrowserError> {
            self.ops.lock().unwrap().push("focus".into());
            Ok(())
        }
        async fn navigate_back(&self) -> Result<(), BrowserError> {
            self.ops.lock().unwrap().push("back".into());
            Ok(())
        }
        async fn open_fresh(&self, _url: &str) -> Result<(), BrowserError> {
            self.ops.lock().unwrap().push("open".into());
            Ok(())
        }
        async fn close_tab(&self) -> Result<(), BrowserError> {
            self.ops.lock().unwrap().push("close".into());
            Ok(())
        }
        async fn navigate(&self, _url: &str) -> Result<(), BrowserError> {
            self.ops.lock().unwrap().push("goto".into());
            Ok(())
        }
    }

    impl PointOracle for MockPage {
        async fn point_snapshot(&self) -> Result<PointSnapshot, BrowserError> {
            if self.oracle_down {
                return Err(BrowserError::Timeout("dashboard".into()));
            }
            Ok(self
                .snapshots
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| self.steady_snapshot.clone()))
        }
    }

    struct ScriptedSource {
        plan: QueryPlan,
        related: HashMap<String, Vec<String>>,
    }

    impl ScriptedSource {
        fn new(topics: Vec<(&str, Vec<&str>)>) -> Self {
            let mut related = HashMap::new();
            let mut plan = QueryPlan::default();
            for (name, suggestions) in topics {
                plan.topics.push(TrendTopic {
                    topic: name.to_string(),
                    related: Vec::new(),
                });
                plan.queries.push(name.to_string());
                related.insert(
                    name.to_string(),
                    suggestions.into_iter().map(String::from).collect(),
                );
            }
            Self { plan, related }
        }

        fn with_queries(mut self, queries: Vec<&str>) -> Self {
            self.plan.queries = queries.into_iter().map(String::from).collect();
            self
        }
    }

    impl QuerySource for ScriptedSource {
        async fn query_plan(
            &self,
            _geo_locale: &str,
            _target: usize,
            _mode: DeviceMode,
        ) -> QueryPlan {
            self.plan.clone()
        }
        async fn related_terms(&self, term: &str) -> Vec<String> {
            self.related.get(term).cloned().unwrap_or_default()
        }
    }

    #[test]
    fn test_stall_counter_resets_on_any_change() {
        let mut stall = StallCounter::new();
        stall.observe(30, 30);
        stall.observe(30, 30);
        assert_eq!(stall.consecutive, 2);

        // progress resets
        stall.observe(30, 25);
        assert_eq!(stall.consecutive, 0);

        stall.observe(25, 25);
        assert_eq!(stall.consecutive, 1);

        // an increase is noise but still a change
        stall.observe(25, 40);
        assert_eq!(stall.consecutive, 0);
        assert!(!stall.exceeded(0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_quota_already_met_runs_zero_searches() {
        let page = MockPage::steady(desktop_snapshot(10, 10));
        let source = ScriptedSource::new(vec![("alpha", vec![])]);
        let dashboard = desktop_dashboard(10, 10);

        let outcome = run_campaign(
            &page,
            &source,
            &dashboard,
            DeviceMode::Desktop,
            &quick_settings(),
        )
        .await;

        assert_eq!(outcome, CampaignOutcome::Completed);
        assert!(page.submitted().is_empty());
        assert_eq!(page.op_count("goto"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_primary_completes_when_points_drain() {
        let page = MockPage::scripted(
            vec![
                desktop_snapshot(10, 30),
                desktop_snapshot(20, 30),
                desktop_snapshot(30, 30),
            ],
            desktop_snapshot(30, 30),
        );
        let source =
            ScriptedSource::new(vec![("a", vec![]), ("b", vec![]), ("c", vec![]), ("d", vec![])]);
        let dashboard = desktop_dashboard(0, 30);

        let outcome = run_campaign(
            &page,
            &source,
            &dashboard,
            DeviceMode::Desktop,
            &quick_settings(),
        )
        .await;

        assert_eq!(outcome, CampaignOutcome::Completed);
        // quota hit on the third search; the fourth query is never issued
        assert_eq!(page.submitted(), vec!["a", "b", "c"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_primary_stall_hands_over_to_fallback() {
        // every snapshot identical: primary must stop at the 11th no-change
        // action, and the thin suggestion lists keep the fallback idle
        let page = MockPage::steady(desktop_snapshot(0, 30));
        let queries: Vec<&str> = (0..15).map(|_| "q").collect();
        let source = ScriptedSource::new(vec![("alpha", vec![])]).with_queries(queries);
        let dashboard = desktop_dashboard(0, 30);

        let outcome = run_campaign(
            &page,
            &source,
            &dashboard,
            DeviceMode::Desktop,
            &quick_settings(),
        )
        .await;

        assert_eq!(page.submitted().len(), 11);
        assert_eq!(outcome, CampaignOutcome::Shortfall { missing: 30 });
    }

    #[tokio::test(start_paused = true)]
    async fn test_fallback_stall_aborts_the_run() {
        let page = MockPage::steady(desktop_snapshot(0, 30));
        let source = ScriptedSource::new(vec![
            ("alpha", vec!["alpha", "a1", "a2", "a3"]),
            ("beta", vec!["beta", "b1", "b2", "b3"]),
            ("gamma", vec!["gamma", "g1", "g2", "g3"]),
            ("delta", vec!["delta", "d1", "d2", "d3"]),
        ])
        .with_queries(vec![]);
        let dashboard = desktop_dashboard(0, 30);

        let outcome = run_campaign(
            &page,
            &source,
            &dashboard,
            DeviceMode::Desktop,
            &quick_settings(),
        )
        .await;

        assert_eq!(outcome, CampaignOutcome::Aborted { missing: 30 });
        // six fallback searches stall out; delta's terms are never touched
        assert_eq!(page.submitted(), vec!["a1", "a2", "b1", "b2", "g1", "g2"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fallback_skips_thin_suggestion_lists() {
        let page = MockPage::steady(desktop_snapshot(0, 30));
        let source = ScriptedSource::new(vec![
            ("thin", vec!["thin", "t1", "t2"]),
            ("rich", vec!["rich", "r1", "r2", "r3"]),
        ])
        .with_queries(vec![]);
        let dashboard = desktop_dashboard(0, 30);

        let outcome = run_campaign(
            &page,
            &source,
            &dashboard,
            DeviceMode::Desktop,
            &quick_settings(),
        )
        .await;

        assert_eq!(page.submitted(), vec!["r1", "r2"]);
        assert_eq!(outcome, CampaignOutcome::Shortfall { missing: 30 });
    }

    #[tokio::test(start_paused = true)]
    async fn test_fallback_completes_mid_phase() {
        let page = MockPage::scripted(
            vec![desktop_snapshot(15, 30), desktop_snapshot(30, 30)],
            desktop_snapshot(30, 30),
        );
        let source = ScriptedSource::new(vec![("alpha", vec!["alpha", "a1", "a2", "a3"])])
            .with_queries(vec![]);
        let dashboard = desktop_dashboard(0, 30);

        let outcome = run_campaign(
            &page,
            &source,
            &dashboard,
            DeviceMode::Desktop,
            &quick_settings(),
        )
        .await;

        assert_eq!(outcome, CampaignOutcome::Completed);
        assert_eq!(page.submitted(), vec!["a1", "a2"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_envelope_recovers_and_retries_same_term() {
        let page = MockPage::scripted(vec![desktop_snapshot(30, 30)], desktop_snapshot(0, 30));
        *page.fail_submits.lock().unwrap() = 2;
        let source = ScriptedSource::new(vec![("alpha", vec![])]).with_queries(vec!["alpha"]);
        let dashboard = desktop_dashboard(0, 30);

        let outcome = run_campaign(
            &page,
            &source,
            &dashboard,
            DeviceMode::Desktop,
            &quick_settings(),
        )
        .await;

        assert_eq!(outcome, CampaignOutcome::Completed);
        // same term re-submitted across the failed attempts
        assert_eq!(page.submitted(), vec!["alpha", "alpha", "alpha"]);
        // three tabs at failure time means history-back recovery, twice
        assert_eq!(page.op_count("back"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_envelope_returns_last_snapshot() {
        let mut page = MockPage::steady(desktop_snapshot(0, 30));
        page.oracle_down = true;
        *page.fail_submits.lock().unwrap() = SEARCH_ATTEMPTS;
        let last = desktop_snapshot(12, 30);

        let snapshot = attempt_search(&page, "stuck", &quick_settings(), &last).await;

        assert_eq!(snapshot, last);
        assert_eq!(page.submitted().len(), SEARCH_ATTEMPTS as usize);
        assert_eq!(page.op_count("back"), SEARCH_ATTEMPTS as usize);
    }

    #[tokio::test(start_paused = true)]
    async fn test_primary_exhaustion_falls_through_to_fallback() {
        let page = MockPage::steady(desktop_snapshot(0, 30));
        let source = ScriptedSource::new(vec![("alpha", vec![])])
            .with_queries(vec!["a", "b"]);
        let dashboard = desktop_dashboard(0, 30);

        let outcome = run_campaign(
            &page,
            &source,
            &dashboard,
            DeviceMode::Desktop,
            &quick_settings(),
        )
        .await;

        // both queries issued, then the fallback finds nothing workable
        assert_eq!(page.submitted(), vec!["a", "b"]);
        assert_eq!(outcome, CampaignOutcome::Shortfall { missing: 30 });
    }
}
