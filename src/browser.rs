use std::collections::HashMap;
use std::ffi::OsStr;
use std::sync::{Arc, LazyLock, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use headless_chrome::protocol::cdp::Page::CaptureScreenshotFormatOption;
use headless_chrome::{Browser, LaunchOptions, Tab};
use regex::Regex;
use uuid::Uuid;

use crate::config::Settings;
use crate::error::BrowserError;

/// The executor's only window onto a real browser. One instance per
/// session; never shared across sessions.
#[async_trait]
pub trait BrowserCapability: Send + Sync {
    async fn navigate(&self, url: &str) -> Result<(), BrowserError>;
    async fn click(&self, selector: &str) -> Result<(), BrowserError>;
    async fn type_text(&self, selector: &str, text: &str) -> Result<(), BrowserError>;
    async fn press(&self, selector: &str, key: &str) -> Result<(), BrowserError>;
    async fn scroll(&self, amount: i64) -> Result<(), BrowserError>;
    /// Base64-encoded PNG of the current viewport.
    async fn screenshot(&self) -> Result<String, BrowserError>;
    async fn current_url(&self) -> Option<String>;
    async fn is_login_page(&self) -> bool;
    /// Run a script that evaluates to a JSON-encoded string and parse it.
    async fn evaluate_json(&self, script: &str) -> Result<serde_json::Value, BrowserError>;
}

/// Creates browser instances; the live implementation launches Chrome.
#[async_trait]
pub trait BrowserProvider: Send + Sync {
    async fn create(&self, persistent: bool) -> Result<Arc<dyn BrowserCapability>, BrowserError>;
}

/// Tracks the one browser instance each session owns. Acquire and release
/// are atomic with respect to other sessions; dropping the last handle
/// closes the underlying Chrome process.
pub struct BrowserRegistry {
    provider: Arc<dyn BrowserProvider>,
    active: Mutex<HashMap<Uuid, Arc<dyn BrowserCapability>>>,
}

impl BrowserRegistry {
    pub fn new(provider: Arc<dyn BrowserProvider>) -> Self {
        Self {
            provider,
            active: Mutex::new(HashMap::new()),
        }
    }

    pub async fn acquire(
        &self,
        session: Uuid,
    ) -> Result<Arc<dyn BrowserCapability>, BrowserError> {
        let browser = self.provider.create(true).await?;
        self.active
            .lock()
            .expect("browser registry poisoned")
            .insert(session, browser.clone());
        Ok(browser)
    }

    pub fn release(&self, session: &Uuid) {
        self.active
            .lock()
            .expect("browser registry poisoned")
            .remove(session);
    }

    /// Throwaway instance outside the per-session registry, used by flows
    /// that fan out over several pages at once.
    pub async fn ephemeral(&self) -> Result<Arc<dyn BrowserCapability>, BrowserError> {
        self.provider.create(false).await
    }
}

pub struct ChromeProvider {
    settings: Arc<Settings>,
}

impl ChromeProvider {
    pub fn new(settings: Arc<Settings>) -> Self {
        Self { settings }
    }
}

#[async_trait]
impl BrowserProvider for ChromeProvider {
    async fn create(&self, persistent: bool) -> Result<Arc<dyn BrowserCapability>, BrowserError> {
        let browser = ChromeBrowser::launch(&self.settings, persistent).await?;
        Ok(Arc::new(browser))
    }
}

/// Live browser driven over CDP. All headless_chrome calls are blocking,
/// so every operation hops onto the blocking pool.
pub struct ChromeBrowser {
    _browser: Browser,
    tab: Arc<Tab>,
}

impl ChromeBrowser {
    pub async fn launch(settings: &Settings, persistent: bool) -> Result<Self, BrowserError> {
        let headless = settings.headless;
        let user_data_dir = persistent.then(|| settings.user_data_dir.clone());
        let timeout = settings.browser_timeout;

        tokio::task::spawn_blocking(move || {
            let options = LaunchOptions {
                headless,
                user_data_dir,
                args: vec![
                    OsStr::new("--no-first-run"),
                    OsStr::new("--no-default-browser-check"),
                ],
                idle_browser_timeout: Duration::from_secs(600),
                ..Default::default()
            };

            let browser =
                Browser::new(options).map_err(|e| BrowserError::Launch(e.to_string()))?;
            let tab = browser
                .new_tab()
                .map_err(|e| BrowserError::Launch(e.to_string()))?;
            tab.set_default_timeout(timeout);
            tab.navigate_to("about:blank")
                .map_err(|e| BrowserError::Launch(e.to_string()))?;

            Ok(Self {
                _browser: browser,
                tab,
            })
        })
        .await
        .map_err(|e| BrowserError::Launch(e.to_string()))?
    }

    async fn with_tab<T, F>(&self, f: F) -> Result<T, BrowserError>
    where
        T: Send + 'static,
        F: FnOnce(&Arc<Tab>) -> Result<T, BrowserError> + Send + 'static,
    {
        let tab = self.tab.clone();
        tokio::task::spawn_blocking(move || f(&tab))
            .await
            .map_err(|_| BrowserError::Closed)?
    }
}

#[async_trait]
impl BrowserCapability for ChromeBrowser {
    async fn navigate(&self, url: &str) -> Result<(), BrowserError> {
        let target = sanitize_url(url);
        self.with_tab(move |tab| {
            tab.navigate_to(&target)
                .map_err(|e| BrowserError::Navigation(e.to_string()))?;
            tab.wait_for_element("body")
                .map_err(|e| BrowserError::Navigation(e.to_string()))?;
            // Let late scripts settle before the next step looks at the page.
            std::thread::sleep(Duration::from_millis(1500));
            Ok(())
        })
        .await
    }

    async fn click(&self, selector: &str) -> Result<(), BrowserError> {
        let selector = normalize_selector(selector);
        self.with_tab(move |tab| {
            let element = tab
                .find_element(&selector)
                .map_err(|_| BrowserError::ElementNotFound(selector.clone()))?;
            element
                .click()
                .map_err(|e| BrowserError::Script(e.to_string()))?;
            std::thread::sleep(Duration::from_millis(1000));
            Ok(())
        })
        .await
    }

    async fn type_text(&self, selector: &str, text: &str) -> Result<(), BrowserError> {
        let selector = normalize_selector(selector);
        let text = text.to_string();
        self.with_tab(move |tab| {
            let element = tab
                .find_element(&selector)
                .map_err(|_| BrowserError::ElementNotFound(selector.clone()))?;
            element
                .click()
                .map_err(|e| BrowserError::Script(e.to_string()))?;
            let escaped = selector.replace('\'', "\\'");
            tab.evaluate(
                &format!("document.querySelector('{escaped}').value = ''"),
                false,
            )
            .map_err(|e| BrowserError::Script(e.to_string()))?;
            tab.type_str(&text)
                .map_err(|e| BrowserError::Script(e.to_string()))?;
            Ok(())
        })
        .await
    }

    async fn press(&self, selector: &str, key: &str) -> Result<(), BrowserError> {
        let selector = normalize_selector(selector);
        let key = key.to_string();
        self.with_tab(move |tab| {
            let element = tab
                .find_element(&selector)
                .map_err(|_| BrowserError::ElementNotFound(selector.clone()))?;
            element
                .click()
                .map_err(|e| BrowserError::Script(e.to_string()))?;
            tab.press_key(&key)
                .map_err(|e| BrowserError::Script(e.to_string()))?;
            std::thread::sleep(Duration::from_millis(1000));
            Ok(())
        })
        .await
    }

    async fn scroll(&self, amount: i64) -> Result<(), BrowserError> {
        self.with_tab(move |tab| {
            tab.evaluate(&format!("window.scrollBy(0, {amount})"), false)
                .map_err(|e| BrowserError::Script(e.to_string()))?;
            Ok(())
        })
        .await
    }

    async fn screenshot(&self) -> Result<String, BrowserError> {
        self.with_tab(|tab| {
            let bytes = tab
                .capture_screenshot(CaptureScreenshotFormatOption::Png, None, None, true)
                .map_err(|e| BrowserError::Script(e.to_string()))?;
            Ok(BASE64.encode(bytes))
        })
        .await
    }

    async fn current_url(&self) -> Option<String> {
        self.with_tab(|tab| Ok(tab.get_url())).await.ok()
    }

    async fn is_login_page(&self) -> bool {
        let Some(url) = self.current_url().await else {
            return false;
        };
        let lowered = url.to_lowercase();
        lowered.contains("accounts.google.com")
            || lowered.contains("login")
            || lowered.contains("signin")
    }

    async fn evaluate_json(&self, script: &str) -> Result<serde_json::Value, BrowserError> {
        let script = script.to_string();
        self.with_tab(move |tab| {
            let result = tab
                .evaluate(&script, false)
                .map_err(|e| BrowserError::Script(e.to_string()))?;
            let raw = result
                .value
                .and_then(|v| v.as_str().map(String::from))
                .unwrap_or_else(|| "null".to_string());
            serde_json::from_str(&raw).map_err(|e| BrowserError::Script(e.to_string()))
        })
        .await
    }
}

static URL_HOST: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"https?://([^\s/]+)").expect("valid host pattern"));

/// Make whatever the planner produced navigable: keep proper URLs, promote
/// bare domains, and fall back to a search for free text.
pub fn sanitize_url(url: &str) -> String {
    let raw = url.trim();
    if !raw.contains(' ') && (raw.starts_with("http://") || raw.starts_with("https://")) {
        return raw.to_string();
    }
    if let Some(domain) = extract_domain(raw) {
        return format!("https://{domain}");
    }
    format!("https://www.google.com/search?q={}", raw.replace(' ', "+"))
}

fn extract_domain(text: &str) -> Option<String> {
    let lowered = text.to_lowercase();
    if let Some(captures) = URL_HOST.captures(&lowered) {
        let host = captures[1].trim_matches('.').replace("www.", "");
        if !host.is_empty() && host.contains('.') && !host.contains(' ') {
            return Some(host);
        }
    }
    for token in lowered.split([' ', ',', '(', ')']) {
        let cleaned = token
            .trim_matches('.')
            .trim_start_matches("https://")
            .trim_start_matches("http://")
            .replace("www.", "");
        if cleaned.contains('.') && !cleaned.is_empty() && !cleaned.contains(' ') {
            return Some(cleaned);
        }
    }
    None
}

/// Rewrite the pseudo-selectors models like to emit into valid CSS.
pub fn normalize_selector(selector: &str) -> String {
    let trimmed = selector.trim();
    let lowered = trimmed.to_lowercase();
    for (prefix, open, close) in [
        ("aria-label=", "[aria-label=\"", "\"]"),
        ("name=", "[name=\"", "\"]"),
        ("id=", "#", ""),
    ] {
        if lowered.starts_with(prefix) {
            let value = trimmed[prefix.len()..].trim().trim_matches(['"', '\'']);
            return format!("{open}{value}{close}");
        }
    }
    trimmed.to_string()
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn proper_urls_pass_through() {
        assert_eq!(
            sanitize_url("https://example.com/a?b=c"),
            "https://example.com/a?b=c"
        );
    }

    #[test]
    fn bare_domains_gain_a_scheme() {
        assert_eq!(sanitize_url("example.com"), "https://example.com");
        assert_eq!(sanitize_url("www.rust-lang.org"), "https://rust-lang.org");
    }

    #[test]
    fn free_text_becomes_a_search() {
        assert_eq!(
            sanitize_url("cheap mechanical keyboards"),
            "https://www.google.com/search?q=cheap+mechanical+keyboards"
        );
    }

    #[test]
    fn pseudo_selectors_are_rewritten() {
        assert_eq!(
            normalize_selector("aria-label=Search"),
            "[aria-label=\"Search\"]"
        );
        assert_eq!(normalize_selector("name='q'"), "[name=\"q\"]");
        assert_eq!(normalize_selector("id=submit"), "#submit");
        assert_eq!(normalize_selector(" input.search "), "input.search");
    }

    #[tokio::test]
    async fn registry_tracks_one_instance_per_session() {
        let browser = Arc::new(testing::ScriptedBrowser::default());
        let registry = BrowserRegistry::new(Arc::new(testing::ScriptedProvider(browser)));

        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        registry.acquire(a).await.unwrap();
        registry.acquire(b).await.unwrap();
        assert_eq!(registry.active.lock().unwrap().len(), 2);

        registry.release(&a);
        assert_eq!(registry.active.lock().unwrap().len(), 1);
        registry.release(&a);
        assert_eq!(registry.active.lock().unwrap().len(), 1);
    }
}
