//! Rewards Harvester - CLI entry point
//!
//! Loads the config, fans the roster out across clusters, and prints a
//! per-account report when the run ends. Ctrl-C stops the run between
//! accounts and passes rather than mid-search.

use std::sync::atomic::Ordering;

use tracing::{error, info};

use rewards_harvester::{bot, init_logging, log_dir, AppConfig, AppState};

#[tokio::main]
async fn main() {
    let _guard = init_logging();

    info!("Starting Rewards Harvester");
    if let Some(dir) = log_dir() {
        info!("Log files saved to: {}", dir.display());
    }

    let state = AppState::new();

    {
        let config = state.config.read().await;
        if config.accounts.is_empty() {
            match AppConfig::config_path() {
                Some(path) => error!(
                    "No accounts configured. Add accounts to {} and run again.",
                    path.display()
                ),
                None => error!("No accounts configured and no config directory available."),
            }
            return;
        }
        info!(
            "Loaded {} accounts, {} clusters",
            config.accounts.len(),
            config.clusters
        );
    }

    // Ctrl-C clears the running flag; clusters notice it between accounts
    // and between passes.
    {
        let is_running = state.is_running.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Ctrl-C received, finishing the current pass then stopping");
                is_running.store(false, Ordering::Relaxed);
            }
        });
    }

    bot::run_all_accounts(&state).await;

    let snapshot = state.stats.snapshot();
    info!(
        "Run finished in {}s: {} accounts done, {} failed, {} searches, {} points collected",
        snapshot.elapsed_secs,
        snapshot.accounts_completed,
        snapshot.accounts_failed,
        snapshot.searches,
        snapshot.points_collected
    );

    match serde_json::to_string_pretty(&state.stats.outcome_report()) {
        Ok(report) => info!("Account report:\n{}", report),
        Err(e) => error!("Could not serialize the account report: {}", e),
    }
}
