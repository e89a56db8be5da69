//! DOM session management
//!
//! A `DomSession` owns one rendering session: navigate, evaluate a script,
//! read text or attributes, press a key, close. Sessions are never shared
//! between concurrent tasks; `SessionGuard` makes sure a session is released
//! on every exit path of the task that owns it, including panics.

use crate::{create_browser_config, session_data_dir, HarvestError, SessionConfig};
use async_trait::async_trait;
use chromiumoxide::browser::Browser;
use chromiumoxide::page::Page;
use futures::StreamExt;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

/// Script used by pooled sessions to confirm the renderer still answers.
pub const HEALTH_CHECK_SCRIPT: &str = "() => true";

#[async_trait]
pub trait DomSession: Send + Sync {
    /// Load `url`, bounded by the session's navigation timeout.
    async fn navigate(&self, url: &str) -> Result<(), HarvestError>;

    /// Evaluate `script` (a JavaScript function source) with JSON `args`.
    async fn execute_script(&self, script: &str, args: &[Value]) -> Result<Value, HarvestError>;

    /// Visible text of the first element matching `selector`; a missing
    /// element is `Ok(None)`.
    async fn query_text(&self, selector: &str) -> Result<Option<String>, HarvestError>;

    /// Attribute value of the first element matching `selector`.
    async fn query_attribute(
        &self,
        selector: &str,
        attribute: &str,
    ) -> Result<Option<String>, HarvestError>;

    /// Dispatch a key press to the focused document.
    async fn press_key(&self, key: &str) -> Result<(), HarvestError>;

    /// Tear the session down. Calling it twice is harmless.
    async fn close(&self) -> Result<(), HarvestError>;

    async fn is_healthy(&self) -> bool {
        matches!(
            self.execute_script(HEALTH_CHECK_SCRIPT, &[]).await,
            Ok(Value::Bool(true))
        )
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SessionFactory: Send + Sync {
    async fn open(&self, config: &SessionConfig) -> Result<Box<dyn DomSession>, HarvestError>;
}

/// Build the expression that applies a function source to JSON arguments.
pub fn script_invocation(script: &str, args: &[Value]) -> String {
    let args = args
        .iter()
        .map(Value::to_string)
        .collect::<Vec<_>>()
        .join(", ");
    format!("({script})({args})")
}

/// A chromium browser process with a single page
pub struct ChromeSession {
    id: usize,
    browser: Mutex<Browser>,
    page: Page,
    handler: tokio::task::JoinHandle<Result<(), chromiumoxide::error::CdpError>>,
    navigation_timeout: std::time::Duration,
    closed: AtomicBool,
}

impl ChromeSession {
    pub async fn launch(
        config: &SessionConfig,
        chrome_path: Option<&str>,
        id: usize,
    ) -> Result<Self, HarvestError> {
        let data_dir = session_data_dir(id);
        tokio::fs::create_dir_all(&data_dir).await.map_err(|e| {
            HarvestError::BrowserLaunchFailed(format!("Failed to create user data dir: {e}"))
        })?;

        let browser_config = match create_browser_config(config, chrome_path, id) {
            Ok(browser_config) => browser_config,
            Err(e) => {
                remove_session_data_dir(id).await;
                return Err(e);
            }
        };
        let (mut browser, mut handler) = match Browser::launch(browser_config).await {
            Ok(launched) => launched,
            Err(e) => {
                remove_session_data_dir(id).await;
                return Err(HarvestError::BrowserLaunchFailed(e.to_string()));
            }
        };

        // The handler drives the CDP connection and must be polled for the
        // lifetime of the browser.
        let handler_task = tokio::spawn(async move {
            loop {
                match handler.next().await {
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        error!("Session handler error: {}", e);
                        return Err(e);
                    }
                    None => {
                        debug!("Session handler stream ended");
                        break;
                    }
                }
            }
            Ok(())
        });

        let page = match browser.new_page("about:blank").await {
            Ok(page) => page,
            Err(e) => {
                if let Err(close_err) = browser.close().await {
                    debug!("Session {} close after failed page returned: {}", id, close_err);
                }
                let _ = browser.wait().await;
                handler_task.abort();
                remove_session_data_dir(id).await;
                return Err(HarvestError::BrowserLaunchFailed(e.to_string()));
            }
        };

        let user_agent = config.user_agent.clone();
        if let Err(e) = page.set_user_agent(user_agent).await {
            warn!("Session {} could not set user agent: {}", id, e);
        }

        debug!("Session {} opened", id);

        Ok(Self {
            id,
            browser: Mutex::new(browser),
            page,
            handler: handler_task,
            navigation_timeout: config.navigation_timeout,
            closed: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> usize {
        self.id
    }

    fn ensure_alive(&self) -> Result<(), HarvestError> {
        if self.closed.load(Ordering::Relaxed) {
            return Err(HarvestError::SessionCrash(format!(
                "session {} already closed",
                self.id
            )));
        }
        if self.handler.is_finished() {
            return Err(HarvestError::SessionCrash(format!(
                "session {} lost its browser connection",
                self.id
            )));
        }
        Ok(())
    }

    // A CDP failure after the handler stopped is a crash, not a page problem.
    fn classify(&self, err: chromiumoxide::error::CdpError) -> HarvestError {
        if self.handler.is_finished() {
            HarvestError::SessionCrash(err.to_string())
        } else {
            HarvestError::NavigationError(err.to_string())
        }
    }
}

#[async_trait]
impl DomSession for ChromeSession {
    async fn navigate(&self, url: &str) -> Result<(), HarvestError> {
        self.ensure_alive()?;
        debug!("Session {} navigating to {}", self.id, url);

        match timeout(self.navigation_timeout, self.page.goto(url)).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => Err(self.classify(e)),
            Err(_) => Err(HarvestError::NavigationTimeout(self.navigation_timeout)),
        }
    }

    async fn execute_script(&self, script: &str, args: &[Value]) -> Result<Value, HarvestError> {
        self.ensure_alive()?;
        let expression = script_invocation(script, args);

        let result = timeout(self.navigation_timeout, self.page.evaluate(expression.as_str()))
            .await
            .map_err(|_| HarvestError::ScriptError("script evaluation timed out".to_string()))?
            .map_err(|e| match self.classify(e) {
                HarvestError::NavigationError(msg) => HarvestError::ScriptError(msg),
                other => other,
            })?;

        Ok(result.value().cloned().unwrap_or(Value::Null))
    }

    async fn query_text(&self, selector: &str) -> Result<Option<String>, HarvestError> {
        self.ensure_alive()?;
        let element = match self.page.find_element(selector).await {
            Ok(element) => element,
            Err(_) => return Ok(None),
        };
        Ok(element.inner_text().await.ok().flatten())
    }

    async fn query_attribute(
        &self,
        selector: &str,
        attribute: &str,
    ) -> Result<Option<String>, HarvestError> {
        self.ensure_alive()?;
        let element = match self.page.find_element(selector).await {
            Ok(element) => element,
            Err(_) => return Ok(None),
        };
        Ok(element.attribute(attribute).await.ok().flatten())
    }

    async fn press_key(&self, key: &str) -> Result<(), HarvestError> {
        self.ensure_alive()?;
        let body = self
            .page
            .find_element("body")
            .await
            .map_err(|e| HarvestError::ElementNotFound(format!("body: {e}")))?;
        body.press_key(key)
            .await
            .map_err(|e| HarvestError::ScriptError(e.to_string()))?;
        Ok(())
    }

    async fn close(&self) -> Result<(), HarvestError> {
        if self.closed.swap(true, Ordering::Relaxed) {
            return Ok(());
        }

        let mut browser = self.browser.lock().await;
        if let Err(e) = browser.close().await {
            debug!("Session {} close returned: {}", self.id, e);
        }
        let _ = browser.wait().await;
        self.handler.abort();

        remove_session_data_dir(self.id).await;
        debug!("Session {} closed", self.id);
        Ok(())
    }
}

async fn remove_session_data_dir(id: usize) {
    let dir = session_data_dir(id);
    match tokio::fs::remove_dir_all(&dir).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("Could not remove {}: {}", dir.display(), e),
    }
}

/// Opens a fresh chromium process per session
pub struct ChromeSessionFactory {
    chrome_path: Option<String>,
    next_id: AtomicUsize,
}

impl ChromeSessionFactory {
    pub fn new(chrome_path: Option<String>) -> Self {
        Self {
            chrome_path,
            next_id: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl SessionFactory for ChromeSessionFactory {
    async fn open(&self, config: &SessionConfig) -> Result<Box<dyn DomSession>, HarvestError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let session = ChromeSession::launch(config, self.chrome_path.as_deref(), id).await?;
        Ok(Box::new(session))
    }
}

/// Scoped ownership of a session
///
/// Call [`SessionGuard::release`] on the normal path. If the guard is dropped
/// while still holding its session (an early return or a panic unwinding
/// through the task), the session is closed from a background task.
pub struct SessionGuard {
    session: Box<dyn DomSession>,
    owned: bool,
    label: String,
    runtime_handle: tokio::runtime::Handle,
}

impl SessionGuard {
    pub fn new(session: Box<dyn DomSession>, label: impl Into<String>) -> Self {
        Self {
            session,
            owned: true,
            label: label.into(),
            runtime_handle: tokio::runtime::Handle::current(),
        }
    }

    pub fn session(&self) -> &dyn DomSession {
        self.session.as_ref()
    }

    /// Close the session and consume the guard.
    pub async fn release(self) {
        let label = self.label.clone();
        let session = self.into_inner();
        if let Err(e) = session.close().await {
            warn!("Failed to close session for {}: {}", label, e);
        }
    }

    /// Hand the session back without closing it (used for pool check-in).
    pub fn into_inner(mut self) -> Box<dyn DomSession> {
        self.owned = false;
        std::mem::replace(&mut self.session, Box::new(ReleasedSession))
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        if !self.owned {
            return;
        }
        let session = std::mem::replace(&mut self.session, Box::new(ReleasedSession));
        let label = std::mem::take(&mut self.label);
        info!("Closing abandoned session for {}", label);
        self.runtime_handle.spawn(async move {
            if let Err(e) = session.close().await {
                warn!("Session drop cleanup failed for {}: {}", label, e);
            }
        });
    }
}

/// Left behind in a guard whose session has been handed out
struct ReleasedSession;

impl ReleasedSession {
    fn gone<T>() -> Result<T, HarvestError> {
        Err(HarvestError::SessionCrash("session already released".to_string()))
    }
}

#[async_trait]
impl DomSession for ReleasedSession {
    async fn navigate(&self, _url: &str) -> Result<(), HarvestError> {
        Self::gone()
    }

    async fn execute_script(&self, _script: &str, _args: &[Value]) -> Result<Value, HarvestError> {
        Self::gone()
    }

    async fn query_text(&self, _selector: &str) -> Result<Option<String>, HarvestError> {
        Self::gone()
    }

    async fn query_attribute(
        &self,
        _selector: &str,
        _attribute: &str,
    ) -> Result<Option<String>, HarvestError> {
        Self::gone()
    }

    async fn press_key(&self, _key: &str) -> Result<(), HarvestError> {
        Self::gone()
    }

    async fn close(&self) -> Result<(), HarvestError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeSession, PageBehavior};
    use serde_json::json;

    #[test]
    fn script_invocation_serializes_arguments() {
        let expr = script_invocation("(sel, i) => i", &[json!("div.item"), json!(3)]);
        assert_eq!(expr, r#"((sel, i) => i)("div.item", 3)"#);
    }

    #[test]
    fn script_invocation_without_arguments() {
        assert_eq!(script_invocation(HEALTH_CHECK_SCRIPT, &[]), "(() => true)()");
    }

    #[tokio::test]
    async fn guard_release_closes_session() {
        let fake = FakeSession::builder()
            .page("https://a.example", PageBehavior::Body("hi".into()))
            .build();
        let probe = fake.probe();

        let guard = SessionGuard::new(Box::new(fake), "a.example");
        guard.session().navigate("https://a.example").await.unwrap();
        guard.release().await;

        assert!(probe.is_closed());
    }

    #[tokio::test]
    async fn dropped_guard_closes_session_in_background() {
        let fake = FakeSession::builder().build();
        let probe = fake.probe();

        {
            let _guard = SessionGuard::new(Box::new(fake), "dropped");
        }
        for _ in 0..50 {
            if probe.is_closed() {
                break;
            }
            tokio::task::yield_now().await;
        }

        assert!(probe.is_closed());
    }

    #[tokio::test]
    async fn into_inner_hands_over_an_open_session() {
        let fake = FakeSession::builder().build();
        let probe = fake.probe();

        let session = SessionGuard::new(Box::new(fake), "pooled").into_inner();
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
        assert!(!probe.is_closed());
        assert!(session.is_healthy().await);

        session.close().await.unwrap();
        assert!(probe.is_closed());
    }

    #[tokio::test]
    async fn released_placeholder_refuses_work() {
        let placeholder = ReleasedSession;
        assert!(matches!(
            placeholder.navigate("https://a.example").await,
            Err(HarvestError::SessionCrash(_))
        ));
        assert!(!placeholder.is_healthy().await);
        assert!(placeholder.close().await.is_ok());
    }

    #[tokio::test]
    async fn session_data_dir_is_removed_and_missing_dir_is_fine() {
        let id = 9_000_000 + std::process::id() as usize % 1000;
        let dir = session_data_dir(id);
        tokio::fs::create_dir_all(dir.join("Default")).await.unwrap();
        tokio::fs::write(dir.join("Default/Preferences"), b"{}").await.unwrap();

        remove_session_data_dir(id).await;
        assert!(!dir.exists());

        // A second removal finds nothing and stays quiet.
        remove_session_data_dir(id).await;
        assert!(!dir.exists());
    }

    #[tokio::test]
    async fn default_health_check_uses_script() {
        let fake = FakeSession::builder().build();
        assert!(fake.is_healthy().await);

        let crashed = FakeSession::builder().crashed().build();
        assert!(!crashed.is_healthy().await);
    }

    #[tokio::test]
    async fn mocked_factory_launch_failure_surfaces() {
        let mut factory = MockSessionFactory::new();
        factory
            .expect_open()
            .times(1)
            .returning(|_| Err(HarvestError::BrowserLaunchFailed("no chromium".to_string())));

        let result = factory.open(&SessionConfig::default()).await;
        assert!(matches!(result, Err(HarvestError::BrowserLaunchFailed(_))));
    }
}
