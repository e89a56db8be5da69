//! Listing harvester
//!
//! Drives one session through a search results page: scroll the results
//! container until its height stops growing, then open each item's detail
//! pane in turn. The item count is fixed at the moment scrolling stabilizes;
//! items that would load after a further scroll are not visited.

use crate::{
    aria_label_value, parse_listing_markup, BusinessRecord, DomSession, HarvestConfig,
    HarvestError, ListingFields, Metrics, RecordStore, SelectorTable, NOT_AVAILABLE,
};
use serde_json::{json, Value};
use std::time::{Duration, Instant};
use tokio::time::sleep;
use tracing::{debug, info, warn};

pub(crate) mod scripts {
    pub const SCROLL_HEIGHT: &str =
        "(sel) => { const el = document.querySelector(sel); return el ? el.scrollHeight : null; }";
    pub const SCROLL_TO_BOTTOM: &str = "(sel) => { const el = document.querySelector(sel); if (el) { el.scrollTop = el.scrollHeight; } return el !== null; }";
    pub const ELEMENT_EXISTS: &str = "(sel) => document.querySelector(sel) !== null";
    pub const ITEM_COUNT: &str = "(sel) => document.querySelectorAll(sel).length";
    pub const ITEM_MARKUP: &str = "(sel, i) => { const item = document.querySelectorAll(sel)[i]; return item ? item.outerHTML : null; }";
    pub const CLICK_ITEM: &str = "(sel, link, i) => { const item = document.querySelectorAll(sel)[i]; const target = item && (item.querySelector(link) || item); if (!target) { return false; } target.click(); return true; }";
    pub const CLICK: &str = "(sel) => { const el = document.querySelector(sel); if (!el) { return false; } el.click(); return true; }";
}

/// Consecutive height reads of the results container
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScrollState {
    pub previous_height: u64,
    pub current_height: u64,
}

impl ScrollState {
    pub fn new(initial_height: u64) -> Self {
        Self {
            previous_height: initial_height,
            current_height: initial_height,
        }
    }

    /// Record a new read; returns true when it equals the previous one.
    pub fn advance(&mut self, height: u64) -> bool {
        self.previous_height = self.current_height;
        self.current_height = height;
        self.previous_height == self.current_height
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScrollCap {
    Iterations,
    WallClock,
}

/// How the scroll loop ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScrollOutcome {
    /// Two consecutive reads matched.
    Stable { height: u64, iterations: usize },
    /// A cap was hit while the height was still changing; the harvest is partial.
    Capped {
        cap: ScrollCap,
        height: u64,
        iterations: usize,
    },
}

impl ScrollOutcome {
    pub fn is_partial(&self) -> bool {
        matches!(self, ScrollOutcome::Capped { .. })
    }

    pub fn iterations(&self) -> usize {
        match self {
            ScrollOutcome::Stable { iterations, .. } | ScrollOutcome::Capped { iterations, .. } => {
                *iterations
            }
        }
    }
}

/// Per-record count of fields that were actually found
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtractionQuality {
    pub found: usize,
    pub expected: usize,
    pub detail_confirmed: bool,
}

impl ExtractionQuality {
    pub fn score(&self) -> f64 {
        if self.expected == 0 {
            return 0.0;
        }
        self.found as f64 / self.expected as f64
    }
}

/// Result of harvesting one search
#[derive(Debug)]
pub struct HarvestReport {
    pub scroll: ScrollOutcome,
    pub item_count: usize,
    pub unconfirmed_details: usize,
    /// Mean of the per-record field scores; `None` when nothing was visited
    pub mean_quality: Option<f64>,
    pub selector_version: String,
}

impl HarvestReport {
    pub fn is_partial(&self) -> bool {
        self.scroll.is_partial()
    }
}

/// Build the search URL for a `{location, service}` pair.
///
/// ```rust
/// use contact_harvester::search_url;
///
/// let url = search_url("https://maps.example/search/{query}/?hl={locale}", "dental clinic", "Patong Beach", "en");
/// assert_eq!(url, "https://maps.example/search/dental+clinic+Patong+Beach/?hl=en");
/// ```
pub fn search_url(template: &str, service: &str, location: &str, locale: &str) -> String {
    let query = format!("{} {}", service.trim(), location.trim())
        .split_whitespace()
        .collect::<Vec<_>>()
        .join("+");
    template
        .replace("{query}", &query)
        .replace("{locale}", locale)
}

pub struct ListingHarvester<'a> {
    session: &'a dyn DomSession,
    config: &'a HarvestConfig,
    metrics: &'a Metrics,
}

impl<'a> ListingHarvester<'a> {
    pub fn new(session: &'a dyn DomSession, config: &'a HarvestConfig, metrics: &'a Metrics) -> Self {
        Self {
            session,
            config,
            metrics,
        }
    }

    fn selectors(&self) -> &SelectorTable {
        &self.config.selectors
    }

    /// Navigate to the results page and wait for the results container.
    pub async fn open_search(&self, url: &str) -> Result<(), HarvestError> {
        info!("Opening search results: {}", url);
        self.session.navigate(url).await?;

        let consent = json!(self.selectors().consent_button);
        if let Ok(Value::Bool(true)) = self.session.execute_script(scripts::CLICK, &[consent]).await {
            info!("Dismissed consent dialog");
        }

        self.wait_for_container().await
    }

    async fn wait_for_container(&self) -> Result<(), HarvestError> {
        let container = json!(self.selectors().container);
        let deadline = Instant::now() + self.config.container_timeout;
        let poll = Duration::from_millis(250).min(self.config.container_timeout);

        loop {
            let present = self
                .session
                .execute_script(scripts::ELEMENT_EXISTS, std::slice::from_ref(&container))
                .await?;
            if present == Value::Bool(true) {
                debug!("Results container present");
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(HarvestError::ElementNotFound(format!(
                    "results container {}",
                    self.selectors().container
                )));
            }
            sleep(poll).await;
        }
    }

    async fn read_height(&self, container: &Value) -> Result<u64, HarvestError> {
        let value = self
            .session
            .execute_script(scripts::SCROLL_HEIGHT, std::slice::from_ref(container))
            .await?;
        value
            .as_u64()
            .or_else(|| value.as_f64().map(|h| h.max(0.0) as u64))
            .ok_or_else(|| HarvestError::ElementNotFound(format!("scroll height of {container}")))
    }

    /// Scroll `container` until two consecutive height reads are equal, or a
    /// cap is reached.
    pub async fn scroll_until_stable(
        &self,
        container: &str,
        poll_interval: Duration,
    ) -> Result<ScrollOutcome, HarvestError> {
        let container = json!(container);
        let started = Instant::now();
        let mut state = ScrollState::new(self.read_height(&container).await?);
        let mut iterations = 0;

        loop {
            if iterations >= self.config.max_scroll_iterations {
                return Ok(self.capped(ScrollCap::Iterations, state, iterations));
            }
            if started.elapsed() >= self.config.max_scroll_duration {
                return Ok(self.capped(ScrollCap::WallClock, state, iterations));
            }

            self.session
                .execute_script(scripts::SCROLL_TO_BOTTOM, std::slice::from_ref(&container))
                .await?;
            sleep(poll_interval).await;
            let height = self.read_height(&container).await?;
            iterations += 1;
            self.metrics.record_scroll_iteration();

            debug!(
                "Scroll {}: height {} -> {}",
                iterations, state.current_height, height
            );
            if state.advance(height) {
                info!(
                    "Results stopped growing at height {} after {} scrolls",
                    height, iterations
                );
                return Ok(ScrollOutcome::Stable { height, iterations });
            }
        }
    }

    fn capped(&self, cap: ScrollCap, state: ScrollState, iterations: usize) -> ScrollOutcome {
        warn!(
            "Scrolling stopped by {:?} cap after {} iterations at height {}; harvest is partial",
            cap, iterations, state.current_height
        );
        ScrollOutcome::Capped {
            cap,
            height: state.current_height,
            iterations,
        }
    }

    /// Scroll the results and return a cursor over the items present once
    /// scrolling has stopped.
    pub async fn listings(&self) -> Result<(ListingCursor<'_>, ScrollOutcome), HarvestError> {
        let scroll = self
            .scroll_until_stable(&self.selectors().container, self.config.poll_interval)
            .await?;

        let count = self
            .session
            .execute_script(scripts::ITEM_COUNT, &[json!(self.selectors().item)])
            .await?
            .as_u64()
            .unwrap_or(0) as usize;
        info!("Found {} results, extracting details...", count);

        Ok((
            ListingCursor {
                harvester: self,
                index: 0,
                count,
            },
            scroll,
        ))
    }

    /// Harvest every listing into `store`, in page order.
    pub async fn harvest_into(&self, store: &mut RecordStore) -> Result<HarvestReport, HarvestError> {
        let (mut cursor, scroll) = self.listings().await?;
        let item_count = cursor.len();
        let mut unconfirmed_details = 0;
        let mut scores = Vec::with_capacity(item_count);

        while let Some(record) = cursor.next().await? {
            if let Some(quality) = record.quality {
                if !quality.detail_confirmed {
                    unconfirmed_details += 1;
                }
                scores.push(quality.score());
            }
            store.push(record);
            self.metrics.record_listing();
        }

        Ok(HarvestReport {
            scroll,
            item_count,
            unconfirmed_details,
            mean_quality: (!scores.is_empty())
                .then(|| scores.iter().sum::<f64>() / scores.len() as f64),
            selector_version: self.selectors().version.clone(),
        })
    }

    async fn extract_item(&self, index: usize) -> Result<BusinessRecord, HarvestError> {
        let selectors = self.selectors();
        let item = json!(selectors.item);

        // Items are re-queried by position; node identities do not survive
        // detail-pane navigation.
        let markup = self
            .soften(
                self.session
                    .execute_script(scripts::ITEM_MARKUP, &[item.clone(), json!(index)])
                    .await,
                index,
            )?
            .unwrap_or(Value::Null);
        let fields = match markup.as_str() {
            Some(markup) => parse_listing_markup(markup, selectors),
            None => {
                warn!("Result {} disappeared before it could be read", index);
                ListingFields::default()
            }
        };

        let clicked = self
            .soften(
                self.session
                    .execute_script(
                        scripts::CLICK_ITEM,
                        &[item, json!(selectors.item_link), json!(index)],
                    )
                    .await,
                index,
            )?
            .unwrap_or(Value::Null);

        let detail_confirmed = if clicked == Value::Bool(true) {
            let waited = self.wait_for_detail(fields.name.as_deref()).await;
            self.soften(waited, index)?.unwrap_or(false)
        } else {
            warn!("Result {} could not be opened", index);
            false
        };
        // Late fields can render after the title, confirmed or not.
        sleep(self.config.detail_settle).await;

        let website = self
            .soften(self.detail_value(&selectors.website, "Website:").await, index)?
            .flatten();
        let phone = self
            .soften(self.detail_value(&selectors.phone, "Phone:").await, index)?
            .flatten();

        self.return_to_list().await?;

        let found = fields.found() + usize::from(website.is_some()) + usize::from(phone.is_some());
        let quality = ExtractionQuality {
            found,
            expected: ListingFields::EXPECTED + 2,
            detail_confirmed,
        };

        Ok(BusinessRecord {
            name: fields.name.unwrap_or_else(|| NOT_AVAILABLE.to_string()),
            address: fields.address.unwrap_or_else(|| NOT_AVAILABLE.to_string()),
            rating: fields.rating,
            review_count: fields.review_count,
            phone,
            website_url: website,
            quality: Some(quality),
            ..BusinessRecord::default()
        })
    }

    /// Wait until the detail pane shows `name`; a timeout is logged and the
    /// caller continues with whatever the pane currently shows.
    async fn wait_for_detail(&self, name: Option<&str>) -> Result<bool, HarvestError> {
        let Some(name) = name else {
            return Ok(false);
        };

        let deadline = Instant::now() + self.config.detail_timeout;
        let poll = Duration::from_millis(200).min(self.config.detail_timeout);

        loop {
            if let Some(title) = self.session.query_text(&self.selectors().detail_title).await? {
                if title.contains(name) {
                    return Ok(true);
                }
            }
            if Instant::now() >= deadline {
                warn!("Timeout waiting for detail pane for {}", name);
                return Ok(false);
            }
            sleep(poll).await;
        }
    }

    /// Turn a soft failure on one item into a missing value so the rest of
    /// the item, and the harvest, carry on.
    fn soften<T>(
        &self,
        result: Result<T, HarvestError>,
        index: usize,
    ) -> Result<Option<T>, HarvestError> {
        match result {
            Ok(value) => Ok(Some(value)),
            Err(err) if err.is_soft() => {
                warn!("Result {}: {}; continuing with partial fields", index, err);
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    async fn detail_value(&self, selector: &str, prefix: &str) -> Result<Option<String>, HarvestError> {
        Ok(self
            .session
            .query_attribute(selector, "aria-label")
            .await?
            .and_then(|label| aria_label_value(&label, prefix)))
    }

    async fn return_to_list(&self) -> Result<(), HarvestError> {
        let back = json!(self.selectors().back_button);
        match self.session.execute_script(scripts::CLICK, &[back]).await {
            Ok(Value::Bool(true)) => Ok(()),
            Ok(_) | Err(HarvestError::ScriptError(_)) => {
                debug!("No back button, sending Escape");
                match self.session.press_key("Escape").await {
                    Err(err) if err.is_soft() => {
                        warn!("Could not dismiss detail pane: {}", err);
                        Ok(())
                    }
                    other => other,
                }
            }
            Err(err) => Err(err),
        }
    }
}

/// Finite, forward-only sequence of harvested listings
pub struct ListingCursor<'h> {
    harvester: &'h ListingHarvester<'h>,
    index: usize,
    count: usize,
}

impl ListingCursor<'_> {
    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn remaining(&self) -> usize {
        self.count - self.index
    }

    /// Visit the next item. Returns `Ok(None)` once every item counted at
    /// scroll stabilization has been visited.
    pub async fn next(&mut self) -> Result<Option<BusinessRecord>, HarvestError> {
        if self.index >= self.count {
            return Ok(None);
        }
        let index = self.index;
        self.index += 1;

        let record = self.harvester.extract_item(index).await?;
        info!(
            "[{}/{}] {} ({})",
            index + 1,
            self.count,
            record.name,
            record.website_url.as_deref().unwrap_or(NOT_AVAILABLE)
        );

        if self.index < self.count {
            sleep(self.harvester.config.item_delay).await;
        }
        Ok(Some(record))
    }
}
