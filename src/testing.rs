//! Scripted in-memory sessions for tests

use crate::harvester::scripts;
use crate::{
    DomSession, HarvestConfig, HarvestError, SelectorTable, SessionConfig, SessionFactory,
    DiscoveryConfig, HEALTH_CHECK_SCRIPT, WINDOW_SCROLL_SCRIPT,
};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// What navigating to a URL does
#[derive(Debug, Clone)]
pub enum PageBehavior {
    Body(String),
    Timeout,
    Error,
    Crash,
    Panic,
    Slow(Duration, String),
}

#[derive(Debug, Clone)]
pub struct FakeListing {
    name: String,
    detail_name: Option<String>,
    website: Option<String>,
    phone: Option<String>,
}

impl FakeListing {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            detail_name: None,
            website: None,
            phone: None,
        }
    }

    pub fn website(mut self, website: &str) -> Self {
        self.website = Some(website.to_string());
        self
    }

    pub fn phone(mut self, phone: &str) -> Self {
        self.phone = Some(phone.to_string());
        self
    }

    /// Title the detail pane shows instead of the listing name.
    pub fn detail_name(mut self, name: &str) -> Self {
        self.detail_name = Some(name.to_string());
        self
    }

    fn markup(&self) -> String {
        format!(
            r#"<div class="Nv2PK"><a href="https://maps.example/place"></a><div class="qBF1Pd">{}</div><span class="MW4etd">4.5</span><span class="UY7F9">(120)</span><div class="W4Efsd"><span>Cafe</span><span>·</span><span>1 Beach Rd</span></div></div>"#,
            self.name
        )
    }

    fn title(&self) -> &str {
        self.detail_name.as_deref().unwrap_or(&self.name)
    }
}

#[derive(Debug, Clone)]
struct Script {
    pages: HashMap<String, PageBehavior>,
    default_page: Option<PageBehavior>,
    heights: Vec<u64>,
    listings: Vec<FakeListing>,
    has_container: bool,
    has_back_button: bool,
    failing_clicks: Vec<usize>,
    crashed: bool,
}

impl Default for Script {
    fn default() -> Self {
        Self {
            pages: HashMap::new(),
            default_page: None,
            heights: vec![0],
            listings: Vec::new(),
            has_container: true,
            has_back_button: true,
            failing_clicks: Vec::new(),
            crashed: false,
        }
    }
}

#[derive(Default)]
struct ProbeState {
    closed: AtomicBool,
    navigations: Mutex<Vec<String>>,
    height_reads: AtomicUsize,
    back_clicks: AtomicUsize,
    escapes: AtomicUsize,
    window_scrolls: AtomicUsize,
}

/// Read-only view of what a `FakeSession` was asked to do
#[derive(Clone)]
pub struct SessionProbe(Arc<ProbeState>);

impl SessionProbe {
    pub fn is_closed(&self) -> bool {
        self.0.closed.load(Ordering::SeqCst)
    }

    pub fn navigations(&self) -> Vec<String> {
        self.0.navigations.lock().unwrap().clone()
    }

    pub fn height_reads(&self) -> usize {
        self.0.height_reads.load(Ordering::SeqCst)
    }

    pub fn back_clicks(&self) -> usize {
        self.0.back_clicks.load(Ordering::SeqCst)
    }

    pub fn escapes(&self) -> usize {
        self.0.escapes.load(Ordering::SeqCst)
    }

    pub fn window_scrolls(&self) -> usize {
        self.0.window_scrolls.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
struct PageState {
    body: Option<String>,
    open_detail: Option<usize>,
    next_height: usize,
}

#[derive(Default)]
struct ActiveSessions {
    active: AtomicUsize,
    max_active: AtomicUsize,
    opened: AtomicUsize,
}

impl ActiveSessions {
    fn open(&self) {
        self.opened.fetch_add(1, Ordering::SeqCst);
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now, Ordering::SeqCst);
    }

    fn close(&self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct FakeSession {
    script: Arc<Script>,
    state: Mutex<PageState>,
    probe: Arc<ProbeState>,
    active: Option<Arc<ActiveSessions>>,
    selectors: SelectorTable,
}

impl FakeSession {
    pub fn builder() -> FakeSessionBuilder {
        FakeSessionBuilder::default()
    }

    pub fn probe(&self) -> SessionProbe {
        SessionProbe(self.probe.clone())
    }

    fn from_script(script: Arc<Script>, active: Option<Arc<ActiveSessions>>) -> Self {
        if let Some(active) = &active {
            active.open();
        }
        Self {
            script,
            state: Mutex::new(PageState::default()),
            probe: Arc::new(ProbeState::default()),
            active,
            selectors: SelectorTable::default(),
        }
    }

    fn crashed(&self) -> Result<(), HarvestError> {
        if self.script.crashed {
            return Err(HarvestError::SessionCrash("renderer gone".to_string()));
        }
        Ok(())
    }

    fn behavior_for(&self, url: &str) -> Option<PageBehavior> {
        if url == "about:blank" {
            return Some(PageBehavior::Body(String::new()));
        }
        self.script
            .pages
            .get(url)
            .or(self.script.default_page.as_ref())
            .cloned()
    }

    fn arg_str(args: &[Value], index: usize) -> &str {
        args.get(index).and_then(Value::as_str).unwrap_or_default()
    }

    fn arg_index(args: &[Value], index: usize) -> usize {
        args.get(index).and_then(Value::as_u64).unwrap_or_default() as usize
    }
}

#[async_trait]
impl DomSession for FakeSession {
    async fn navigate(&self, url: &str) -> Result<(), HarvestError> {
        self.crashed()?;
        self.probe.navigations.lock().unwrap().push(url.to_string());
        self.state.lock().unwrap().body = None;

        let body = match self.behavior_for(url) {
            Some(PageBehavior::Body(body)) => body,
            Some(PageBehavior::Slow(delay, body)) => {
                tokio::time::sleep(delay).await;
                body
            }
            Some(PageBehavior::Timeout) => {
                return Err(HarvestError::NavigationTimeout(Duration::from_millis(15)))
            }
            Some(PageBehavior::Crash) => {
                return Err(HarvestError::SessionCrash(format!("crashed loading {url}")))
            }
            Some(PageBehavior::Panic) => panic!("renderer panicked loading {url}"),
            Some(PageBehavior::Error) | None => {
                return Err(HarvestError::NavigationError(format!("net::ERR_FAILED {url}")))
            }
        };

        self.state.lock().unwrap().body = Some(body);
        Ok(())
    }

    async fn execute_script(&self, script: &str, args: &[Value]) -> Result<Value, HarvestError> {
        self.crashed()?;
        let mut state = self.state.lock().unwrap();

        let value = match script {
            HEALTH_CHECK_SCRIPT => Value::Bool(true),
            WINDOW_SCROLL_SCRIPT => {
                self.probe.window_scrolls.fetch_add(1, Ordering::SeqCst);
                Value::Bool(true)
            }
            scripts::ELEMENT_EXISTS => Value::Bool(self.script.has_container),
            scripts::SCROLL_TO_BOTTOM => Value::Bool(self.script.has_container),
            scripts::SCROLL_HEIGHT => {
                if !self.script.has_container {
                    return Ok(Value::Null);
                }
                self.probe.height_reads.fetch_add(1, Ordering::SeqCst);
                let heights = &self.script.heights;
                let height = heights
                    .get(state.next_height)
                    .or(heights.last())
                    .copied()
                    .unwrap_or_default();
                state.next_height += 1;
                Value::from(height)
            }
            scripts::ITEM_COUNT => Value::from(self.script.listings.len()),
            scripts::ITEM_MARKUP => self
                .script
                .listings
                .get(Self::arg_index(args, 1))
                .map(|listing| Value::String(listing.markup()))
                .unwrap_or(Value::Null),
            scripts::CLICK_ITEM => {
                let index = Self::arg_index(args, 2);
                if self.script.failing_clicks.contains(&index) {
                    return Err(HarvestError::ScriptError(
                        "Execution context was destroyed".to_string(),
                    ));
                }
                if index < self.script.listings.len() {
                    state.open_detail = Some(index);
                    Value::Bool(true)
                } else {
                    Value::Bool(false)
                }
            }
            scripts::CLICK => {
                let selector = Self::arg_str(args, 0);
                if selector == self.selectors.back_button && self.script.has_back_button {
                    self.probe.back_clicks.fetch_add(1, Ordering::SeqCst);
                    state.open_detail = None;
                    Value::Bool(true)
                } else {
                    Value::Bool(false)
                }
            }
            other => {
                return Err(HarvestError::ScriptError(format!("unscripted: {other}")));
            }
        };
        Ok(value)
    }

    async fn query_text(&self, selector: &str) -> Result<Option<String>, HarvestError> {
        self.crashed()?;
        let state = self.state.lock().unwrap();

        if selector == "body" {
            return Ok(state.body.clone());
        }
        if selector == self.selectors.detail_title {
            return Ok(state
                .open_detail
                .and_then(|index| self.script.listings.get(index))
                .map(|listing| listing.title().to_string()));
        }
        Ok(None)
    }

    async fn query_attribute(
        &self,
        selector: &str,
        attribute: &str,
    ) -> Result<Option<String>, HarvestError> {
        self.crashed()?;
        if attribute != "aria-label" {
            return Ok(None);
        }
        let state = self.state.lock().unwrap();
        let Some(listing) = state.open_detail.and_then(|i| self.script.listings.get(i)) else {
            return Ok(None);
        };

        if selector == self.selectors.website {
            Ok(listing.website.as_ref().map(|w| format!("Website: {w}")))
        } else if selector == self.selectors.phone {
            Ok(listing.phone.as_ref().map(|p| format!("Phone: {p}")))
        } else {
            Ok(None)
        }
    }

    async fn press_key(&self, key: &str) -> Result<(), HarvestError> {
        self.crashed()?;
        if key == "Escape" {
            self.probe.escapes.fetch_add(1, Ordering::SeqCst);
            self.state.lock().unwrap().open_detail = None;
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), HarvestError> {
        if !self.probe.closed.swap(true, Ordering::SeqCst) {
            if let Some(active) = &self.active {
                active.close();
            }
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeSessionBuilder {
    script: Script,
}

impl FakeSessionBuilder {
    pub fn page(mut self, url: &str, behavior: PageBehavior) -> Self {
        self.script.pages.insert(url.to_string(), behavior);
        self
    }

    pub fn default_page(mut self, behavior: PageBehavior) -> Self {
        self.script.default_page = Some(behavior);
        self
    }

    pub fn heights(mut self, heights: &[u64]) -> Self {
        self.script.heights = heights.to_vec();
        self
    }

    pub fn listing(mut self, listing: FakeListing) -> Self {
        self.script.listings.push(listing);
        self
    }

    pub fn without_container(mut self) -> Self {
        self.script.has_container = false;
        self
    }

    pub fn without_back_button(mut self) -> Self {
        self.script.has_back_button = false;
        self
    }

    /// Clicking the item at `index` throws inside the page.
    pub fn failing_click(mut self, index: usize) -> Self {
        self.script.failing_clicks.push(index);
        self
    }

    pub fn crashed(mut self) -> Self {
        self.script.crashed = true;
        self
    }

    pub fn build(self) -> FakeSession {
        FakeSession::from_script(Arc::new(self.script), None)
    }

    /// A factory whose sessions all follow this script.
    pub fn factory(self) -> FakeFactory {
        FakeFactory {
            script: Arc::new(self.script),
            sessions: Arc::new(ActiveSessions::default()),
            fail_opens: false,
        }
    }
}

/// Opens `FakeSession`s and tracks how many are alive at once
pub struct FakeFactory {
    script: Arc<Script>,
    sessions: Arc<ActiveSessions>,
    fail_opens: bool,
}

impl FakeFactory {
    pub fn failing(mut self) -> Self {
        self.fail_opens = true;
        self
    }

    pub fn opened(&self) -> usize {
        self.sessions.opened.load(Ordering::SeqCst)
    }

    pub fn active(&self) -> usize {
        self.sessions.active.load(Ordering::SeqCst)
    }

    pub fn max_active(&self) -> usize {
        self.sessions.max_active.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SessionFactory for FakeFactory {
    async fn open(&self, _config: &SessionConfig) -> Result<Box<dyn DomSession>, HarvestError> {
        if self.fail_opens {
            return Err(HarvestError::BrowserLaunchFailed("chromium not found".to_string()));
        }
        // Yield so concurrently dispatched tasks interleave.
        tokio::task::yield_now().await;
        Ok(Box::new(FakeSession::from_script(
            self.script.clone(),
            Some(self.sessions.clone()),
        )))
    }
}

pub fn fast_harvest_config() -> HarvestConfig {
    HarvestConfig {
        poll_interval: Duration::from_millis(1),
        container_timeout: Duration::from_millis(20),
        detail_timeout: Duration::from_millis(20),
        detail_settle: Duration::from_millis(1),
        item_delay: Duration::from_millis(1),
        location_delay: Duration::from_millis(1),
        ..HarvestConfig::default()
    }
}

pub fn fast_discovery_config() -> DiscoveryConfig {
    DiscoveryConfig {
        probe_settle: Duration::from_millis(1),
        homepage_settle: Duration::from_millis(1),
        homepage_scroll_pause: Duration::from_millis(1),
        ..DiscoveryConfig::default()
    }
}
