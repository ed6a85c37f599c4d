//! Browser session management
//!
//! One `BrowserSession` wraps one Chrome process for one account and device
//! mode. Tabs are never cached: the portal opens and closes tabs behind our
//! back, so every operation resolves the page list freshly and treats the
//! deepest tab as the current one.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chromiumoxide::cdp::browser_protocol::emulation::{
    SetDeviceMetricsOverrideParams, SetTouchEmulationEnabledParams, SetUserAgentOverrideParams,
};
use chromiumoxide::cdp::browser_protocol::input::{DispatchKeyEventParams, DispatchKeyEventType};
use chromiumoxide::{Browser, BrowserConfig, Page};
use futures::StreamExt;
use once_cell::sync::Lazy;
use rand::Rng;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::BrowserError;
use crate::proxy::{ProxyRelay, ProxySettings};
use crate::search::DeviceMode;

/// Chrome must produce a CDP endpoint within this window or the account is
/// skipped.
const LAUNCH_TIMEOUT: Duration = Duration::from_secs(45);

const NAVIGATION_TIMEOUT: Duration = Duration::from_secs(30);

const DEFAULT_JS_TIMEOUT: Duration = Duration::from_secs(60);

/// Mobile emulation metrics, matching a current mid-size phone.
const MOBILE_VIEWPORT: (i64, i64) = (390, 844);
const MOBILE_SCALE_FACTOR: f64 = 3.0;

/// Chrome discovery is cached for the process lifetime; every session would
/// otherwise probe the filesystem again.
static CHROME_PATH: Lazy<Option<PathBuf>> = Lazy::new(find_chrome);

/// Find a Chrome/Chromium executable on the system.
fn find_chrome() -> Option<PathBuf> {
    let candidates: Vec<PathBuf> = if cfg!(target_os = "windows") {
        let mut paths = vec![
            PathBuf::from(r"C:\Program Files\Google\Chrome\Application\chrome.exe"),
            PathBuf::from(r"C:\Program Files (x86)\Google\Chrome\Application\chrome.exe"),
        ];
        if let Ok(local) = std::env::var("LOCALAPPDATA") {
            paths.push(PathBuf::from(format!(
                r"{}\Google\Chrome\Application\chrome.exe",
                local
            )));
        }
        paths
    } else if cfg!(target_os = "macos") {
        vec![
            PathBuf::from("/Applications/Google Chrome.app/Contents/MacOS/Google Chrome"),
            PathBuf::from("/Applications/Chromium.app/Contents/MacOS/Chromium"),
        ]
    } else {
        vec![
            PathBuf::from("/usr/bin/google-chrome"),
            PathBuf::from("/usr/bin/google-chrome-stable"),
            PathBuf::from("/usr/bin/chromium"),
            PathBuf::from("/usr/bin/chromium-browser"),
        ]
    };

    candidates.into_iter().find(|p| p.exists())
}

/// Per-account Chrome profile directory. Profiles survive restarts so
/// sign-ins stick between runs.
pub fn session_dir(email: &str) -> PathBuf {
    let base = dirs::data_local_dir().unwrap_or_else(std::env::temp_dir);
    base.join("rewards-harvester")
        .join("sessions")
        .join(sanitize_email(email))
}

fn sanitize_email(email: &str) -> String {
    email
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Everything needed to bring up one Chrome process for one account.
#[derive(Debug, Clone)]
pub struct BrowserSessionConfig {
    pub email: String,
    pub headless: bool,
    pub chrome_path: Option<String>,
    pub user_agent: String,
    pub mode: DeviceMode,
    pub proxy: Option<ProxySettings>,
}

/// A live Chrome process plus the relay serving its proxy, if any.
pub struct BrowserSession {
    label: String,
    mode: DeviceMode,
    user_agent: String,
    browser: Mutex<Option<Browser>>,
    alive: Arc<AtomicBool>,
    relay: Mutex<Option<ProxyRelay>>,
}

impl BrowserSession {
    /// Launch Chrome for the given account. The returned session owns the
    /// process and its proxy relay until `close`.
    pub async fn launch(config: BrowserSessionConfig) -> Result<Self, BrowserError> {
        let profile_dir = session_dir(&config.email);
        std::fs::create_dir_all(&profile_dir)?;

        info!(
            "[Session] Launching Chrome for {} ({}, headless: {})",
            config.email, config.mode, config.headless
        );

        let mut args: Vec<String> = vec![
            "--no-sandbox".to_string(),
            "--no-first-run".to_string(),
            "--mute-audio".to_string(),
            "--disable-setuid-sandbox".to_string(),
            "--ignore-certificate-errors".to_string(),
            "--no-default-browser-check".to_string(),
            "--disable-session-crashed-bubble".to_string(),
            "--disable-blink-features=AutomationControlled".to_string(),
            "--lang=en-US".to_string(),
        ];

        let mut relay = None;
        if let Some(ref proxy) = config.proxy {
            if proxy.has_credentials() {
                let running = ProxyRelay::start(proxy).await?;
                args.push(format!("--proxy-server={}", running.local_addr()));
                relay = Some(running);
            } else {
                args.push(format!("--proxy-server={}", proxy.upstream_addr()));
            }
        }

        let mut builder = BrowserConfig::builder()
            .user_data_dir(&profile_dir)
            .window_size(1280, 900)
            .args(args);

        if config.headless {
            builder = builder.arg("--headless=new");
        } else {
            builder = builder.with_head();
        }

        if let Some(ref path) = config.chrome_path {
            builder = builder.chrome_executable(path);
        } else if let Some(path) = CHROME_PATH.as_ref() {
            builder = builder.chrome_executable(path);
        } else {
            return Err(BrowserError::LaunchFailed(
                "Chrome not found. Install Chrome or set chromePath in the config.".to_string(),
            ));
        }

        let browser_config = builder.build().map_err(BrowserError::LaunchFailed)?;

        let (browser, mut handler) =
            tokio::time::timeout(LAUNCH_TIMEOUT, Browser::launch(browser_config))
                .await
                .map_err(|_| {
                    BrowserError::Timeout(format!(
                        "Chrome did not come up within {}s",
                        LAUNCH_TIMEOUT.as_secs()
                    ))
                })?
                .map_err(|e| BrowserError::LaunchFailed(e.to_string()))?;

        // When the event stream ends, Chrome is gone.
        let alive = Arc::new(AtomicBool::new(true));
        let alive_for_handler = alive.clone();
        let handler_label = config.email.clone();
        tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if event.is_err() {
                    break;
                }
            }
            warn!("[Session] {} Chrome disconnected", handler_label);
            alive_for_handler.store(false, Ordering::Relaxed);
        });

        let session = Self {
            label: config.email,
            mode: config.mode,
            user_agent: config.user_agent,
            browser: Mutex::new(Some(browser)),
            alive,
            relay: Mutex::new(relay),
        };

        // Chrome opens with at least one blank tab; stamp our identity on
        // everything that is already there.
        for page in session.pages().await? {
            session.apply_emulation(&page).await?;
        }

        Ok(session)
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn mode(&self) -> DeviceMode {
        self.mode
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Relaxed)
    }

    /// All open tabs, in creation order.
    pub async fn pages(&self) -> Result<Vec<Page>, BrowserError> {
        let guard = self.browser.lock().await;
        let browser = guard
            .as_ref()
            .ok_or_else(|| BrowserError::SessionClosed("browser already closed".to_string()))?;
        browser
            .pages()
            .await
            .map_err(|e| BrowserError::ConnectionLost(e.to_string()))
    }

    pub async fn page_count(&self) -> Result<usize, BrowserError> {
        Ok(self.pages().await?.len())
    }

    /// The most recently opened tab.
    pub async fn latest_page(&self) -> Result<Page, BrowserError> {
        self.pages()
            .await?
            .into_iter()
            .last()
            .ok_or_else(|| BrowserError::SessionClosed("no open tabs".to_string()))
    }

    /// Open a tab at `url` with this session's emulation applied.
    ///
    /// Overrides are per target, so pages the site opens itself do not get
    /// them; anything we open goes through here.
    pub async fn new_page(&self, url: &str) -> Result<Page, BrowserError> {
        let page = {
            let guard = self.browser.lock().await;
            let browser = guard.as_ref().ok_or_else(|| {
                BrowserError::SessionClosed("browser already closed".to_string())
            })?;
            browser
                .new_page(url)
                .await
                .map_err(|e| BrowserError::NavigationFailed(e.to_string()))?
        };
        self.apply_emulation(&page).await?;
        Ok(page)
    }

    pub async fn close_latest(&self) -> Result<(), BrowserError> {
        let page = self.latest_page().await?;
        page.close()
            .await
            .map_err(|e| BrowserError::ConnectionLost(e.to_string()))
    }

    /// Close tabs from the back of the list until at most `keep` remain.
    /// Errors out if a round makes no progress, so a tab that refuses to
    /// close cannot spin this forever.
    pub async fn trim_tabs(&self, keep: usize) -> Result<(), BrowserError> {
        let mut last_count = usize::MAX;
        loop {
            let pages = self.pages().await?;
            if pages.len() <= keep {
                return Ok(());
            }
            if pages.len() >= last_count {
                return Err(BrowserError::ConnectionLost(
                    "surplus tab refused to close".to_string(),
                ));
            }
            last_count = pages.len();
            if let Some(page) = pages.into_iter().last() {
                debug!("[Session] {} closing surplus tab", self.label);
                let _ = page.close().await;
            }
        }
    }

    pub async fn focus_latest(&self) -> Result<(), BrowserError> {
        let page = self.latest_page().await?;
        page.bring_to_front()
            .await
            .map_err(|e| BrowserError::ConnectionLost(e.to_string()))?;
        Ok(())
    }

    /// Navigate the current tab and wait for the load to settle.
    pub async fn navigate(&self, url: &str) -> Result<(), BrowserError> {
        let page = self.latest_page().await?;
        debug!("[Session] {} navigating to {}", self.label, url);
        page.goto(url)
            .await
            .map_err(|e| BrowserError::NavigationFailed(e.to_string()))?;
        match tokio::time::timeout(NAVIGATION_TIMEOUT, page.wait_for_navigation()).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => Err(BrowserError::NavigationFailed(e.to_string())),
            // some portal pages never fire a clean load event; the content
            // is usually there anyway
            Err(_) => Ok(()),
        }
    }

    /// History-back on the current tab.
    pub async fn back(&self) -> Result<(), BrowserError> {
        self.evaluate("history.back()").await?;
        Ok(())
    }

    pub async fn current_url(&self) -> Result<String, BrowserError> {
        let page = self.latest_page().await?;
        page.url()
            .await
            .map_err(|e| BrowserError::ConnectionLost(e.to_string()))?
            .ok_or_else(|| BrowserError::ConnectionLost("tab has no URL".to_string()))
    }

    /// Run JavaScript on the current tab within the default timeout.
    pub async fn evaluate(&self, script: &str) -> Result<serde_json::Value, BrowserError> {
        self.evaluate_with_timeout(script, DEFAULT_JS_TIMEOUT).await
    }

    pub async fn evaluate_with_timeout(
        &self,
        script: &str,
        timeout: Duration,
    ) -> Result<serde_json::Value, BrowserError> {
        let page = self.latest_page().await?;
        let result = tokio::time::timeout(timeout, page.evaluate(script))
            .await
            .map_err(|_| {
                BrowserError::Timeout(format!(
                    "JavaScript did not finish within {}s",
                    timeout.as_secs()
                ))
            })?
            .map_err(|e| BrowserError::JavaScriptError(e.to_string()))?;
        Ok(result
            .into_value::<serde_json::Value>()
            .unwrap_or(serde_json::Value::Null))
    }

    /// Poll for a visible element on the current tab.
    pub async fn wait_for_element(
        &self,
        selector: &str,
        timeout: Duration,
    ) -> Result<(), BrowserError> {
        let selector_json =
            serde_json::to_string(selector).unwrap_or_else(|_| "\"\"".to_string());
        let script = format!(
            r#"(async () => {{
                const deadline = Date.now() + {timeout_ms};
                while (Date.now() < deadline) {{
                    const el = document.querySelector({selector_json});
                    if (el && el.offsetParent !== null) return true;
                    await new Promise(r => setTimeout(r, 250));
                }}
                return false;
            }})()"#,
            timeout_ms = timeout.as_millis(),
            selector_json = selector_json,
        );

        let found = self
            .evaluate_with_timeout(&script, timeout + Duration::from_secs(5))
            .await?;
        if found.as_bool().unwrap_or(false) {
            Ok(())
        } else {
            Err(BrowserError::ElementNotFound(selector.to_string()))
        }
    }

    /// Click an element on the current tab.
    pub async fn click(&self, selector: &str) -> Result<(), BrowserError> {
        let page = self.latest_page().await?;
        let element = page
            .find_element(selector)
            .await
            .map_err(|e| BrowserError::ElementNotFound(format!("{}: {}", selector, e)))?;
        element
            .click()
            .await
            .map_err(|e| BrowserError::JavaScriptError(e.to_string()))?;
        Ok(())
    }

    /// Type into the focused element, one CDP key event pair per character.
    pub async fn type_text(&self, text: &str) -> Result<(), BrowserError> {
        let page = self.latest_page().await?;
        for c in text.chars() {
            let key_down = DispatchKeyEventParams::builder()
                .r#type(DispatchKeyEventType::KeyDown)
                .text(c.to_string())
                .build()
                .map_err(BrowserError::JavaScriptError)?;
            page.execute(key_down)
                .await
                .map_err(|e| BrowserError::JavaScriptError(format!("keyDown failed: {}", e)))?;

            let key_up = DispatchKeyEventParams::builder()
                .r#type(DispatchKeyEventType::KeyUp)
                .build()
                .map_err(BrowserError::JavaScriptError)?;
            page.execute(key_up)
                .await
                .map_err(|e| BrowserError::JavaScriptError(format!("keyUp failed: {}", e)))?;

            let delay = rand::thread_rng().gen_range(30..90);
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        Ok(())
    }

    /// Press Enter on the current tab. The char event with `\r` is what
    /// actually submits forms.
    pub async fn press_enter(&self) -> Result<(), BrowserError> {
        let page = self.latest_page().await?;

        let key_down = DispatchKeyEventParams::builder()
            .r#type(DispatchKeyEventType::RawKeyDown)
            .key("Enter")
            .code("Enter")
            .windows_virtual_key_code(13)
            .native_virtual_key_code(13)
            .build()
            .map_err(BrowserError::JavaScriptError)?;
        page.execute(key_down)
            .await
            .map_err(|e| BrowserError::JavaScriptError(format!("Enter keyDown failed: {}", e)))?;

        let char_event = DispatchKeyEventParams::builder()
            .r#type(DispatchKeyEventType::Char)
            .text("\r")
            .build()
            .map_err(BrowserError::JavaScriptError)?;
        page.execute(char_event)
            .await
            .map_err(|e| BrowserError::JavaScriptError(format!("Enter char failed: {}", e)))?;

        let key_up = DispatchKeyEventParams::builder()
            .r#type(DispatchKeyEventType::KeyUp)
            .key("Enter")
            .code("Enter")
            .windows_virtual_key_code(13)
            .native_virtual_key_code(13)
            .build()
            .map_err(BrowserError::JavaScriptError)?;
        page.execute(key_up)
            .await
            .map_err(|e| BrowserError::JavaScriptError(format!("Enter keyUp failed: {}", e)))?;

        Ok(())
    }

    /// Press ArrowDown a number of times, with small pauses, to walk down a
    /// result list the way a reader would.
    pub async fn press_arrow_down(&self, times: u32) -> Result<(), BrowserError> {
        let page = self.latest_page().await?;
        for _ in 0..times {
            let key_down = DispatchKeyEventParams::builder()
                .r#type(DispatchKeyEventType::RawKeyDown)
                .key("ArrowDown")
                .code("ArrowDown")
                .windows_virtual_key_code(40)
                .build()
                .map_err(BrowserError::JavaScriptError)?;
            page.execute(key_down)
                .await
                .map_err(|e| BrowserError::JavaScriptError(format!("ArrowDown failed: {}", e)))?;

            let key_up = DispatchKeyEventParams::builder()
                .r#type(DispatchKeyEventType::KeyUp)
                .key("ArrowDown")
                .code("ArrowDown")
                .build()
                .map_err(BrowserError::JavaScriptError)?;
            page.execute(key_up)
                .await
                .map_err(|e| BrowserError::JavaScriptError(format!("ArrowDown failed: {}", e)))?;

            let delay = rand::thread_rng().gen_range(20..60);
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        Ok(())
    }

    /// Select-all then Backspace, clearing whatever input has focus.
    pub async fn clear_input(&self) -> Result<(), BrowserError> {
        let page = self.latest_page().await?;

        let ctrl_down = DispatchKeyEventParams::builder()
            .r#type(DispatchKeyEventType::RawKeyDown)
            .key("Control")
            .code("ControlLeft")
            .windows_virtual_key_code(17)
            .build()
            .map_err(BrowserError::JavaScriptError)?;
        page.execute(ctrl_down)
            .await
            .map_err(|e| BrowserError::JavaScriptError(format!("Ctrl down failed: {}", e)))?;

        let a_down = DispatchKeyEventParams::builder()
            .r#type(DispatchKeyEventType::RawKeyDown)
            .key("a")
            .code("KeyA")
            .modifiers(2)
            .windows_virtual_key_code(65)
            .build()
            .map_err(BrowserError::JavaScriptError)?;
        page.execute(a_down)
            .await
            .map_err(|e| BrowserError::JavaScriptError(format!("select-all failed: {}", e)))?;

        let a_up = DispatchKeyEventParams::builder()
            .r#type(DispatchKeyEventType::KeyUp)
            .key("a")
            .code("KeyA")
            .modifiers(2)
            .build()
            .map_err(BrowserError::JavaScriptError)?;
        page.execute(a_up)
            .await
            .map_err(|e| BrowserError::JavaScriptError(format!("select-all failed: {}", e)))?;

        let ctrl_up = DispatchKeyEventParams::builder()
            .r#type(DispatchKeyEventType::KeyUp)
            .key("Control")
            .code("ControlLeft")
            .build()
            .map_err(BrowserError::JavaScriptError)?;
        page.execute(ctrl_up)
            .await
            .map_err(|e| BrowserError::JavaScriptError(format!("Ctrl up failed: {}", e)))?;

        let backspace_down = DispatchKeyEventParams::builder()
            .r#type(DispatchKeyEventType::RawKeyDown)
            .key("Backspace")
            .code("Backspace")
            .windows_virtual_key_code(8)
            .build()
            .map_err(BrowserError::JavaScriptError)?;
        page.execute(backspace_down)
            .await
            .map_err(|e| BrowserError::JavaScriptError(format!("Backspace failed: {}", e)))?;

        let backspace_up = DispatchKeyEventParams::builder()
            .r#type(DispatchKeyEventType::KeyUp)
            .key("Backspace")
            .code("Backspace")
            .build()
            .map_err(BrowserError::JavaScriptError)?;
        page.execute(backspace_up)
            .await
            .map_err(|e| BrowserError::JavaScriptError(format!("Backspace failed: {}", e)))?;

        Ok(())
    }

    /// Apply this session's user agent (and, in mobile mode, device metrics
    /// and touch) to one page.
    pub async fn apply_emulation(&self, page: &Page) -> Result<(), BrowserError> {
        let ua = SetUserAgentOverrideParams::builder()
            .user_agent(&self.user_agent)
            .build()
            .map_err(BrowserError::JavaScriptError)?;
        page.execute(ua)
            .await
            .map_err(|e| BrowserError::JavaScriptError(format!("UA override failed: {}", e)))?;

        if self.mode.is_mobile() {
            let (width, height) = MOBILE_VIEWPORT;
            let metrics =
                SetDeviceMetricsOverrideParams::new(width, height, MOBILE_SCALE_FACTOR, true);
            page.execute(metrics).await.map_err(|e| {
                BrowserError::JavaScriptError(format!("metrics override failed: {}", e))
            })?;

            let touch = SetTouchEmulationEnabledParams::new(true);
            page.execute(touch).await.map_err(|e| {
                BrowserError::JavaScriptError(format!("touch emulation failed: {}", e))
            })?;
        }

        Ok(())
    }

    /// Tear down Chrome and the proxy relay. Safe to call once per session;
    /// errors during shutdown are not worth surfacing.
    pub async fn close(&self) {
        self.alive.store(false, Ordering::Relaxed);

        {
            let mut guard = self.browser.lock().await;
            if let Some(mut browser) = guard.take() {
                if let Ok(pages) = browser.pages().await {
                    for page in pages {
                        let _ = page.close().await;
                    }
                }
                let _ = browser.close().await;
                // grace period for Chrome's children before the hard kill
                tokio::time::sleep(Duration::from_millis(500)).await;
                let _ = browser.kill().await;
            }
        }

        let mut relay = self.relay.lock().await;
        if let Some(mut running) = relay.take() {
            running.stop();
        }

        info!("[Session] {} closed", self.label);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_email_keeps_filesystem_safe_chars() {
        assert_eq!(sanitize_email("user@example.com"), "user_example.com");
        assert_eq!(sanitize_email("first.last-2@host.io"), "first.last-2_host.io");
        assert_eq!(sanitize_email("weird+tag@x"), "weird_tag_x");
    }

    #[test]
    fn test_session_dir_is_scoped_per_account() {
        let dir = session_dir("user@example.com");
        let rendered = dir.to_string_lossy();
        assert!(rendered.contains("rewards-harvester"));
        assert!(rendered.ends_with("user_example.com"));

        assert_ne!(session_dir("a@x.com"), session_dir("b@x.com"));
    }
}
