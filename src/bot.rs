//! Account orchestration
//!
//! Fans the roster out across cluster tasks and walks each account through
//! its desktop and mobile passes. Each pass gets its own Chrome process;
//! the two passes share a profile directory so sign-ins persist.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{error, info, warn};

use crate::browser::{
    fetch_dashboard, BrowserSession, BrowserSessionConfig, LiveSearchPage, PORTAL_URL,
};
use crate::dashboard::{earnable_points, DashboardSnapshot};
use crate::search::{
    missing_points, run_search_campaign, DeviceMode, PointSnapshot, SEARCH_PAGE_URL,
};
use crate::stats::{AccountOutcome, RunStats};
use crate::{Account, AppConfig, AppState};

pub const DESKTOP_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36 Edg/120.0.0.0";

pub const MOBILE_USER_AGENT: &str = "Mozilla/5.0 (Linux; Android 10; K) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Mobile Safari/537.36 EdgA/120.0.0.0";

/// A mobile pass that leaves points on the table usually means the user
/// agent did not take; the pass is relaunched up to this many times total.
const MOBILE_PASS_ATTEMPTS: u32 = 3;

/// The session currently owned by an account run, so the panic guard can
/// close it if the run blows up mid-pass.
type ActiveSession = Arc<tokio::sync::Mutex<Option<Arc<BrowserSession>>>>;

/// How one device pass went.
struct PassReport {
    /// Earnable points before the campaign
    before: u32,
    /// Earnable points after the campaign, refetched
    after: u32,
    /// Mobile points still missing after the campaign (mobile passes only)
    leftover: u32,
    outcome: String,
    /// The zero-point gate tripped; skip the rest of this account
    halt: bool,
}

/// Partition the roster into at most `clusters` chunks, preserving order.
pub fn chunk_accounts(accounts: Vec<Account>, clusters: usize) -> Vec<Vec<Account>> {
    if accounts.is_empty() {
        return Vec::new();
    }
    let clusters = clusters.max(1);
    let chunk_size = accounts.len().div_ceil(clusters);
    accounts
        .chunks(chunk_size)
        .map(|chunk| chunk.to_vec())
        .collect()
}

/// Run the whole roster: accounts within a chunk sequentially, chunks in
/// parallel. Returns once every chunk is done or the run flag is cleared.
pub async fn run_all_accounts(state: &AppState) {
    let config = state.config.read().await.clone();
    let chunks = chunk_accounts(config.accounts.clone(), config.clusters);

    info!(
        "[Run] {} accounts across {} clusters (headless: {})",
        config.accounts.len(),
        chunks.len(),
        config.headless
    );

    let mut handles = Vec::new();
    for (index, chunk) in chunks.into_iter().enumerate() {
        let config = config.clone();
        let stats = state.stats.clone();
        let is_running = state.is_running.clone();

        handles.push(tokio::spawn(async move {
            for account in chunk {
                if !is_running.load(Ordering::Relaxed) {
                    info!("[Run] Cluster {} stopping early", index);
                    break;
                }
                run_account_safe(account, &config, &stats, &is_running).await;
            }
        }));
    }

    for handle in handles {
        if let Err(e) = handle.await {
            error!("[Run] Cluster task failed to join: {}", e);
        }
    }
}

/// Run one account behind a panic guard.
///
/// A panicking account is recorded as failed and its browser, if any, is
/// closed; the chunk moves on to the next account.
async fn run_account_safe(
    account: Account,
    config: &AppConfig,
    stats: &Arc<RunStats>,
    is_running: &Arc<AtomicBool>,
) {
    let active: ActiveSession = Arc::new(tokio::sync::Mutex::new(None));
    let email = account.email.clone();

    use futures::FutureExt;
    let result =
        std::panic::AssertUnwindSafe(run_account(account, config, stats, is_running, &active))
            .catch_unwind()
            .await;

    if let Err(panic_info) = result {
        let panic_msg = if let Some(s) = panic_info.downcast_ref::<&str>() {
            s.to_string()
        } else if let Some(s) = panic_info.downcast_ref::<String>() {
            s.clone()
        } else {
            "Unknown panic".to_string()
        };

        error!(
            "[PanicSafety] Account {} panicked: {}. Cleaning up.",
            email, panic_msg
        );

        if let Some(session) = active.lock().await.take() {
            session.close().await;
        }

        stats.record_error();
        stats.record_outcome(AccountOutcome {
            email,
            collected: 0,
            desktop: "panicked".to_string(),
            mobile: "panicked".to_string(),
            failed: true,
            timestamp: chrono::Utc::now().to_rfc3339(),
        });
    }
}

async fn run_account(
    account: Account,
    config: &AppConfig,
    stats: &Arc<RunStats>,
    is_running: &Arc<AtomicBool>,
    active: &ActiveSession,
) {
    info!("[Account] {} starting", account.email);

    let mut outcome = AccountOutcome {
        email: account.email.clone(),
        collected: 0,
        desktop: "skipped".to_string(),
        mobile: "skipped".to_string(),
        failed: false,
        timestamp: chrono::Utc::now().to_rfc3339(),
    };

    let mut first_before: Option<u32> = None;
    let mut last_after: u32 = 0;
    let mut halt = false;

    if config.workers.do_desktop_search {
        match desktop_pass(&account, config, stats, active).await {
            Ok(report) => {
                first_before = Some(report.before);
                last_after = report.after;
                halt = report.halt;
                outcome.desktop = report.outcome;
            }
            Err(e) => {
                error!("[Account] {} desktop pass failed: {}", account.email, e);
                stats.record_error();
                outcome.desktop = format!("failed: {}", e);
                outcome.failed = true;
                stats.record_outcome(outcome);
                return;
            }
        }
    }

    if halt {
        info!(
            "[Account] {} has nothing earnable today, skipping the rest",
            account.email
        );
        stats.record_outcome(outcome);
        return;
    }

    if !is_running.load(Ordering::Relaxed) {
        info!("[Account] {} stopping before the mobile pass", account.email);
        outcome.mobile = "interrupted".to_string();
        stats.record_outcome(outcome);
        return;
    }

    if config.workers.do_mobile_search {
        match mobile_pass(&account, config, stats, active).await {
            Ok(report) => {
                if first_before.is_none() {
                    first_before = Some(report.before);
                }
                last_after = report.after;
                outcome.mobile = report.outcome;
            }
            Err(e) => {
                error!("[Account] {} mobile pass failed: {}", account.email, e);
                stats.record_error();
                outcome.mobile = format!("failed: {}", e);
                outcome.failed = true;
                stats.record_outcome(outcome);
                return;
            }
        }
    }

    let collected = first_before.unwrap_or(0).saturating_sub(last_after);
    stats.record_points(collected as u64);
    outcome.collected = collected;

    info!(
        "[Account] {} collected {} points today",
        account.email, collected
    );
    stats.record_outcome(outcome);
}

/// Launch Chrome for one pass and park it in the active slot.
async fn launch_session(
    account: &Account,
    config: &AppConfig,
    mode: DeviceMode,
    active: &ActiveSession,
) -> Result<Arc<BrowserSession>, String> {
    let user_agent = match mode {
        DeviceMode::Desktop => DESKTOP_USER_AGENT,
        DeviceMode::Mobile => MOBILE_USER_AGENT,
    };

    let session = BrowserSession::launch(BrowserSessionConfig {
        email: account.email.clone(),
        headless: config.headless,
        chrome_path: config.chrome_path.clone(),
        user_agent: user_agent.to_string(),
        mode,
        proxy: account.proxy.clone(),
    })
    .await
    .map_err(|e| format!("launch failed: {}", e))?;

    let session = Arc::new(session);
    *active.lock().await = Some(session.clone());
    Ok(session)
}

async fn close_session(session: Arc<BrowserSession>, active: &ActiveSession) {
    active.lock().await.take();
    session.close().await;
}

/// Trim the restored tab clutter down to blank + home, point the home tab at
/// the rewards portal, and read the dashboard off it.
async fn bootstrap(session: &Arc<BrowserSession>) -> Result<DashboardSnapshot, String> {
    session.trim_tabs(2).await.map_err(|e| e.to_string())?;
    if session.page_count().await.map_err(|e| e.to_string())? < 2 {
        session
            .new_page(PORTAL_URL)
            .await
            .map_err(|e| format!("opening the portal failed: {}", e))?;
    } else {
        session
            .navigate(PORTAL_URL)
            .await
            .map_err(|e| format!("navigating to the portal failed: {}", e))?;
    }

    let dashboard = fetch_dashboard(session)
        .await
        .map_err(|e| format!("dashboard fetch failed: {}", e))?;

    info!(
        "[Account] {} has {} points in the bank",
        session.label(),
        dashboard.user_status.available_points
    );
    Ok(dashboard)
}

async fn desktop_pass(
    account: &Account,
    config: &AppConfig,
    stats: &Arc<RunStats>,
    active: &ActiveSession,
) -> Result<PassReport, String> {
    let session = launch_session(account, config, DeviceMode::Desktop, active).await?;

    let dashboard = match bootstrap(&session).await {
        Ok(dashboard) => dashboard,
        Err(e) => {
            close_session(session, active).await;
            return Err(e);
        }
    };

    let before = earnable_points(&dashboard);
    if before == 0 && !config.run_on_zero_points {
        close_session(session, active).await;
        return Ok(PassReport {
            before,
            after: before,
            leftover: 0,
            outcome: "nothing earnable".to_string(),
            halt: true,
        });
    }

    // worker tab; the campaign drives the deepest tab from here on
    if let Err(e) = session.new_page(SEARCH_PAGE_URL).await {
        close_session(session, active).await;
        return Err(format!("opening the worker tab failed: {}", e));
    }

    let page = LiveSearchPage::new(session.clone(), stats.clone());
    let outcome = run_search_campaign(
        &page,
        &dashboard,
        DeviceMode::Desktop,
        &config.search_settings,
    )
    .await;
    info!("[Account] {} desktop campaign {}", account.email, outcome);

    let after = match fetch_dashboard(&session).await {
        Ok(fresh) => earnable_points(&fresh),
        Err(e) => {
            warn!(
                "[Account] {} could not refetch the dashboard after desktop: {}",
                account.email, e
            );
            before
        }
    };

    close_session(session, active).await;
    Ok(PassReport {
        before,
        after,
        leftover: 0,
        outcome: outcome.to_string(),
        halt: false,
    })
}

/// Mobile pass with the bad-user-agent retry: when the campaign ends with
/// mobile points still missing, the whole pass is relaunched on a fresh
/// browser, at most `MOBILE_PASS_ATTEMPTS` times.
async fn mobile_pass(
    account: &Account,
    config: &AppConfig,
    stats: &Arc<RunStats>,
    active: &ActiveSession,
) -> Result<PassReport, String> {
    let mut report = mobile_attempt(account, config, stats, active).await?;
    let mut attempt = 1;

    while attempt < MOBILE_PASS_ATTEMPTS && report.leftover > 0 {
        attempt += 1;
        warn!(
            "[Account] {} mobile pass left {} points (attempt {}/{}), relaunching with a fresh browser",
            account.email, report.leftover, attempt, MOBILE_PASS_ATTEMPTS
        );
        report = mobile_attempt(account, config, stats, active).await?;
    }

    Ok(report)
}

async fn mobile_attempt(
    account: &Account,
    config: &AppConfig,
    stats: &Arc<RunStats>,
    active: &ActiveSession,
) -> Result<PassReport, String> {
    let session = launch_session(account, config, DeviceMode::Mobile, active).await?;

    let dashboard = match bootstrap(&session).await {
        Ok(dashboard) => dashboard,
        Err(e) => {
            close_session(session, active).await;
            return Err(e);
        }
    };

    let before = earnable_points(&dashboard);

    // Accounts that never earned mobile points have no counter to fill.
    if dashboard.counters().mobile_search.is_none() {
        info!(
            "[Account] {} has no mobile counters yet, skipping the mobile pass",
            account.email
        );
        close_session(session, active).await;
        return Ok(PassReport {
            before,
            after: before,
            leftover: 0,
            outcome: "no mobile counters".to_string(),
            halt: false,
        });
    }

    if let Err(e) = session.new_page(SEARCH_PAGE_URL).await {
        close_session(session, active).await;
        return Err(format!("opening the worker tab failed: {}", e));
    }

    let page = LiveSearchPage::new(session.clone(), stats.clone());
    let outcome = run_search_campaign(
        &page,
        &dashboard,
        DeviceMode::Mobile,
        &config.search_settings,
    )
    .await;
    info!("[Account] {} mobile campaign {}", account.email, outcome);

    let (after, leftover) = match fetch_dashboard(&session).await {
        Ok(fresh) => {
            let snapshot = PointSnapshot::from(fresh.counters());
            (
                earnable_points(&fresh),
                missing_points(&snapshot, DeviceMode::Mobile),
            )
        }
        Err(e) => {
            warn!(
                "[Account] {} could not refetch the dashboard after mobile: {}",
                account.email, e
            );
            // no data to justify a relaunch
            (before, 0)
        }
    };

    close_session(session, active).await;
    Ok(PassReport {
        before,
        after,
        leftover,
        outcome: outcome.to_string(),
        halt: false,
    })
}
