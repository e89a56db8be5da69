//! Configuration management with serde serialization/deserialization
//!
//! This module provides all configuration structures for the harvester,
//! including browser session settings, scroll and detail-pane timing, the
//! discovery worker pool, and output locations. Every entry point receives a
//! `Config` value explicitly; nothing here is process-wide state.

use crate::{HarvestError, SelectorTable};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Main configuration structure for the harvester
///
/// # Examples
///
/// ```rust
/// use contact_harvester::Config;
///
/// // Use default configuration
/// let config = Config::default();
/// assert_eq!(config.discovery.concurrency, 5);
///
/// // Create custom configuration
/// let mut config = Config::default();
/// config.discovery.concurrency = 8;
/// config.session.headless = false;
/// ```
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// Browser session settings shared by the harvester and discovery workers
    pub session: SessionConfig,

    /// Listing harvest timing, caps and selectors
    pub harvest: HarvestConfig,

    /// Email discovery worker pool and probing heuristics
    pub discovery: DiscoveryConfig,

    /// Where tables are read from and written to
    pub output: OutputConfig,

    /// Path to Chrome/Chromium executable (default: auto-detect)
    pub chrome_path: Option<String>,
}

impl Config {
    /// Reject configurations that would stall or never terminate.
    pub fn validate(&self) -> Result<(), HarvestError> {
        if self.discovery.concurrency == 0 {
            return Err(HarvestError::ConfigurationError(
                "Discovery concurrency must be greater than 0".to_string(),
            ));
        }

        if self.session.navigation_timeout.is_zero() {
            return Err(HarvestError::ConfigurationError(
                "Navigation timeout must be greater than 0".to_string(),
            ));
        }

        if self.session.viewport.width == 0 || self.session.viewport.height == 0 {
            return Err(HarvestError::ConfigurationError(
                "Viewport dimensions must be greater than 0".to_string(),
            ));
        }

        if self.harvest.max_scroll_iterations == 0 || self.harvest.max_scroll_duration.is_zero() {
            return Err(HarvestError::ConfigurationError(
                "Scroll caps must be greater than 0".to_string(),
            ));
        }

        if self.harvest.detail_timeout.is_zero() || self.harvest.container_timeout.is_zero() {
            return Err(HarvestError::ConfigurationError(
                "Harvest wait timeouts must be greater than 0".to_string(),
            ));
        }

        if self.discovery.contact_paths.is_empty() {
            return Err(HarvestError::ConfigurationError(
                "At least one contact path is required".to_string(),
            ));
        }

        Ok(())
    }

    /// Load a JSON configuration file, falling back to defaults for any
    /// section the file leaves out.
    pub fn from_json_file(path: &std::path::Path) -> Result<Self, HarvestError> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&content)?;
        Ok(config)
    }
}

/// Settings for one rendering/automation session
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Run chromium without a window (default: true)
    pub headless: bool,

    /// Browser window size
    pub viewport: Viewport,

    /// User-Agent header sent with every navigation
    pub user_agent: String,

    /// UI language requested from the browser and the search page (default: "en")
    pub locale: String,

    /// Upper bound for a single navigation (default: 15 seconds)
    ///
    /// This is the only thing bounding a hung page: there is no deadline over
    /// a whole discovery batch.
    pub navigation_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            headless: true,
            viewport: Viewport::default(),
            user_agent: "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0 Safari/537.36".to_string(),
            locale: "en".to_string(),
            navigation_timeout: Duration::from_secs(15),
        }
    }
}

/// Browser window dimensions
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Viewport {
    /// Window width in pixels (default: 1920)
    pub width: u32,

    /// Window height in pixels (default: 1080)
    pub height: u32,
}

impl Default for Viewport {
    fn default() -> Self {
        Self {
            width: 1920,
            height: 1080,
        }
    }
}

/// Listing harvest settings
///
/// The scroll loop stops once two consecutive height reads match, or when
/// either cap is reached; a capped scroll is reported as a partial harvest.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct HarvestConfig {
    /// Search URL template; `{query}` and `{locale}` are substituted
    pub search_url: String,

    /// Pause between scroll-to-bottom and the next height read (default: 2s)
    pub poll_interval: Duration,

    /// Maximum scroll iterations before giving up on stability (default: 200)
    pub max_scroll_iterations: usize,

    /// Maximum wall-clock time spent scrolling (default: 10 minutes)
    pub max_scroll_duration: Duration,

    /// How long to wait for the results container to appear (default: 15s)
    pub container_timeout: Duration,

    /// How long to wait for the detail pane to show the clicked item (default: 10s)
    pub detail_timeout: Duration,

    /// Pause after every detail-pane wait, confirmed or not, for late fields (default: 1.5s)
    pub detail_settle: Duration,

    /// Pause between items (default: 1s)
    pub item_delay: Duration,

    /// Pause between locations in a multi-location run (default: 30s)
    pub location_delay: Duration,

    /// Versioned selector table for list items and the detail pane
    pub selectors: SelectorTable,
}

impl Default for HarvestConfig {
    fn default() -> Self {
        Self {
            search_url: "https://www.google.com/maps/search/{query}/?hl={locale}".to_string(),
            poll_interval: Duration::from_secs(2),
            max_scroll_iterations: 200,
            max_scroll_duration: Duration::from_secs(600),
            container_timeout: Duration::from_secs(15),
            detail_timeout: Duration::from_secs(10),
            detail_settle: Duration::from_millis(1500),
            item_delay: Duration::from_secs(1),
            location_delay: Duration::from_secs(30),
            selectors: SelectorTable::default(),
        }
    }
}

/// Email discovery settings
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Number of concurrent discovery workers (default: 5)
    pub concurrency: usize,

    /// Contact paths probed in order before the homepage fallback
    pub contact_paths: Vec<String>,

    /// Host substrings that are never probed
    pub blocklist: Vec<String>,

    /// Pause after a contact page loads, before reading its text (default: 2s)
    pub probe_settle: Duration,

    /// Pause after the homepage loads (default: 3s)
    pub homepage_settle: Duration,

    /// Fixed number of scroll-and-wait passes on the homepage (default: 3)
    pub homepage_scroll_iterations: usize,

    /// Pause after each homepage scroll (default: 1s)
    pub homepage_scroll_pause: Duration,

    /// Reuse health-checked sessions across tasks instead of one per task (default: false)
    pub reuse_sessions: bool,

    /// Idle sessions kept when `reuse_sessions` is on (default: 5)
    pub max_idle_sessions: usize,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            concurrency: 5,
            contact_paths: vec![
                "/contact".to_string(),
                "/contact-us".to_string(),
                "/kontakt".to_string(),
            ],
            blocklist: vec![
                "facebook.com".to_string(),
                "instagram.com".to_string(),
                "tripadvisor.com".to_string(),
                "wolt.com".to_string(),
            ],
            probe_settle: Duration::from_secs(2),
            homepage_settle: Duration::from_secs(3),
            homepage_scroll_iterations: 3,
            homepage_scroll_pause: Duration::from_secs(1),
            reuse_sessions: false,
            max_idle_sessions: 5,
        }
    }
}

/// Output locations and naming
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct OutputConfig {
    /// Working directory for harvested and updated tables (default: "data")
    pub data_dir: PathBuf,

    /// Suffix appended to a table's stem once discovery has run (default: "_updated")
    pub updated_suffix: String,

    /// Summary table written after a multi-location run
    pub summary_file: String,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            updated_suffix: "_updated".to_string(),
            summary_file: "scraping_summary.csv".to_string(),
        }
    }
}

/// Generate chromium command-line arguments for a session
///
/// `instance_id` keeps the user-data directory of concurrent sessions apart.
///
/// # Examples
///
/// ```rust
/// use contact_harvester::{get_chrome_args, SessionConfig};
///
/// let args = get_chrome_args(&SessionConfig::default(), 0);
/// assert!(args.contains(&"--lang=en".to_string()));
/// ```
pub fn get_chrome_args(config: &SessionConfig, instance_id: usize) -> Vec<String> {
    let mut args = vec![
        "--no-sandbox".to_string(),
        "--disable-dev-shm-usage".to_string(),
        "--disable-gpu".to_string(),
        "--disable-extensions".to_string(),
        "--disable-default-apps".to_string(),
        "--disable-sync".to_string(),
        "--no-first-run".to_string(),
        "--disable-features=TranslateUI".to_string(),
        "--disable-background-timer-throttling".to_string(),
        "--disable-renderer-backgrounding".to_string(),
        format!(
            "--window-size={},{}",
            config.viewport.width, config.viewport.height
        ),
        format!("--lang={}", config.locale),
        format!("--user-agent={}", config.user_agent),
        format!(
            "--user-data-dir={}",
            session_data_dir(instance_id).display()
        ),
    ];

    if config.headless {
        args.insert(0, "--headless=new".to_string());
    }

    args
}

/// Per-instance user-data directory, unique per process.
pub fn session_data_dir(instance_id: usize) -> PathBuf {
    std::env::temp_dir().join(format!(
        "contact-harvester-{}-{}",
        std::process::id(),
        instance_id
    ))
}

pub fn create_browser_config(
    config: &SessionConfig,
    chrome_path: Option<&str>,
    instance_id: usize,
) -> Result<chromiumoxide::browser::BrowserConfig, HarvestError> {
    use chromiumoxide::browser::BrowserConfig;

    let mut builder = BrowserConfig::builder()
        .window_size(config.viewport.width, config.viewport.height)
        .request_timeout(config.navigation_timeout)
        .args(get_chrome_args(config, instance_id));

    if !config.headless {
        builder = builder.with_head();
    }

    if let Some(chrome_path) = chrome_path {
        builder = builder.chrome_executable(chrome_path);
    }

    builder.build().map_err(HarvestError::BrowserLaunchFailed)
}
