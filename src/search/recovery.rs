//! Tab-state repair after a failed search action.
//!
//! The nominal tab population during a campaign is three: the initial blank
//! tab, the rewards home tab, and the search worker tab. Deviations from
//! that are what the counts below key off.

use tracing::{info, warn};

use super::driver::SearchPage;
use super::SEARCH_PAGE_URL;

/// Corrective action, resolved once per caught failure from the tab count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryAction {
    /// Four tabs: something popped a window on top of the worker. Close it.
    TooManyTabs,
    /// Two tabs: the worker tab is gone. Open a fresh one on the search page.
    TooFewTabs,
    /// Any other count: assume a recoverable mis-navigation and go back.
    Other,
}

impl RecoveryAction {
    pub fn classify(tab_count: usize) -> Self {
        match tab_count {
            4 => RecoveryAction::TooManyTabs,
            2 => RecoveryAction::TooFewTabs,
            _ => RecoveryAction::Other,
        }
    }
}

/// Repair the tab state after a failed action. Best-effort: every failure
/// in here, including failing to read the tab count, is logged and
/// swallowed so the retry loop always reaches its cooldown.
pub async fn recover<P: SearchPage>(page: &P) {
    let action = match page.current_tab_count().await {
        Ok(count) => RecoveryAction::classify(count),
        Err(e) => {
            warn!("[Recovery] Could not read tab count: {}", e);
            RecoveryAction::Other
        }
    };

    let result = match action {
        RecoveryAction::TooManyTabs => page.close_tab().await,
        RecoveryAction::TooFewTabs => page.open_fresh(SEARCH_PAGE_URL).await,
        RecoveryAction::Other => page.navigate_back().await,
    };

    match result {
        Ok(()) => info!("[Recovery] Applied {:?}", action),
        Err(e) => warn!("[Recovery] {:?} failed: {}", action, e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::BrowserError;
    use crate::search::{PointOracle, PointSnapshot};
    use std::sync::Mutex;

    #[test]
    fn test_classify_tab_counts() {
        assert_eq!(RecoveryAction::classify(4), RecoveryAction::TooManyTabs);
        assert_eq!(RecoveryAction::classify(2), RecoveryAction::TooFewTabs);
        assert_eq!(RecoveryAction::classify(3), RecoveryAction::Other);
        assert_eq!(RecoveryAction::classify(1), RecoveryAction::Other);
        assert_eq!(RecoveryAction::classify(7), RecoveryAction::Other);
    }

    struct RecordingPage {
        tabs: usize,
        fail_ops: bool,
        ops: Mutex<Vec<String>>,
    }

    impl RecordingPage {
        fn new(tabs: usize) -> Self {
            Self {
                tabs,
                fail_ops: false,
                ops: Mutex::new(Vec::new()),
            }
        }

        fn record(&self, op: &str) -> Result<(), BrowserError> {
            self.ops.lock().unwrap().push(op.to_string());
            if self.fail_ops {
                Err(BrowserError::NavigationFailed(op.to_string()))
            } else {
                Ok(())
            }
        }
    }

    impl SearchPage for RecordingPage {
        async fn submit_query(&self, _term: &str) -> Result<(), BrowserError> {
            self.record("submit")
        }
        async fn scroll(&self, _steps: u32) -> Result<(), BrowserError> {
            self.record("scroll")
        }
        async fn click_first_result(&self) -> Result<(), BrowserError> {
            self.record("click")
        }
        async fn current_tab_count(&self) -> Result<usize, BrowserError> {
            Ok(self.tabs)
        }
        async fn focus_latest_tab(&self) -> Result<(), BrowserError> {
            self.record("focus")
        }
        async fn navigate_back(&self) -> Result<(), BrowserError> {
            self.record("back")
        }
        async fn open_fresh(&self, url: &str) -> Result<(), BrowserError> {
            self.record(&format!("open:{}", url))
        }
        async fn close_tab(&self) -> Result<(), BrowserError> {
            self.record("close")
        }
        async fn navigate(&self, url: &str) -> Result<(), BrowserError> {
            self.record(&format!("goto:{}", url))
        }
    }

    impl PointOracle for RecordingPage {
        async fn point_snapshot(&self) -> Result<PointSnapshot, BrowserError> {
            Ok(PointSnapshot::default())
        }
    }

    #[tokio::test]
    async fn test_recover_closes_extra_tab() {
        let page = RecordingPage::new(4);
        recover(&page).await;
        assert_eq!(*page.ops.lock().unwrap(), vec!["close"]);
    }

    #[tokio::test]
    async fn test_recover_reopens_lost_worker_tab() {
        let page = RecordingPage::new(2);
        recover(&page).await;
        assert_eq!(
            *page.ops.lock().unwrap(),
            vec![format!("open:{}", SEARCH_PAGE_URL)]
        );
    }

    #[tokio::test]
    async fn test_recover_navigates_back_otherwise() {
        let page = RecordingPage::new(3);
        recover(&page).await;
        assert_eq!(*page.ops.lock().unwrap(), vec!["back"]);
    }

    #[tokio::test]
    async fn test_recover_swallows_failures() {
        let mut page = RecordingPage::new(3);
        page.fail_ops = true;
        // must not panic or propagate
        recover(&page).await;
        assert_eq!(*page.ops.lock().unwrap(), vec!["back"]);
    }
}
