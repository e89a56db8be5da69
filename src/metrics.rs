use crate::{EmailStatus, HarvestError};
use metrics::{register_counter, register_histogram, Counter, Histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::path::Path;
use std::time::Duration;
use tracing::info;

/// Run counters for both stages
///
/// `Metrics::new()` records nothing; `Metrics::register()` binds the handles
/// to whatever recorder is installed.
pub struct Metrics {
    pub listings_harvested: Counter,
    pub scroll_iterations: Counter,
    pub emails_found: Counter,
    pub emails_not_found: Counter,
    pub discovery_errors: Counter,
    pub websites_skipped: Counter,
    pub navigation_timeouts: Counter,
    pub discovery_duration: Histogram,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            listings_harvested: Counter::noop(),
            scroll_iterations: Counter::noop(),
            emails_found: Counter::noop(),
            emails_not_found: Counter::noop(),
            discovery_errors: Counter::noop(),
            websites_skipped: Counter::noop(),
            navigation_timeouts: Counter::noop(),
            discovery_duration: Histogram::noop(),
        }
    }

    pub fn register() -> Self {
        Self {
            listings_harvested: register_counter!("harvester_listings_total"),
            scroll_iterations: register_counter!("harvester_scroll_iterations_total"),
            emails_found: register_counter!("discovery_emails_found_total"),
            emails_not_found: register_counter!("discovery_emails_not_found_total"),
            discovery_errors: register_counter!("discovery_errors_total"),
            websites_skipped: register_counter!("discovery_websites_skipped_total"),
            navigation_timeouts: register_counter!("navigation_timeouts_total"),
            discovery_duration: register_histogram!("discovery_duration_seconds"),
        }
    }

    pub fn record_listing(&self) {
        self.listings_harvested.increment(1);
    }

    pub fn record_scroll_iteration(&self) {
        self.scroll_iterations.increment(1);
    }

    pub fn record_navigation_timeout(&self) {
        self.navigation_timeouts.increment(1);
    }

    pub fn record_skipped(&self, count: usize) {
        self.websites_skipped.increment(count as u64);
    }

    pub fn record_outcome(&self, status: &EmailStatus, duration: Duration) {
        match status {
            EmailStatus::Found(_) => self.emails_found.increment(1),
            EmailStatus::NotFound => self.emails_not_found.increment(1),
            EmailStatus::Error(_) => self.discovery_errors.increment(1),
            EmailStatus::Unset => {}
        }
        self.discovery_duration.record(duration.as_secs_f64());
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Prometheus recorder whose exposition text is written to a file on exit
pub struct MetricsExporter {
    handle: PrometheusHandle,
}

impl MetricsExporter {
    /// Install the process-wide recorder. Call once, before `Metrics::register`.
    pub fn install() -> Result<Self, HarvestError> {
        let handle = PrometheusBuilder::new()
            .install_recorder()
            .map_err(|e| HarvestError::ConfigurationError(format!("metrics recorder: {e}")))?;
        Ok(Self { handle })
    }

    pub fn render(&self) -> String {
        self.handle.render()
    }

    pub fn write_to(&self, path: &Path) -> Result<(), HarvestError> {
        std::fs::write(path, self.render())?;
        info!("Metrics written to {}", path.display());
        Ok(())
    }
}
