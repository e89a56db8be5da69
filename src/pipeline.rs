//! Harvesting, discovery and batch entry points
//!
//! Each entry point takes everything it needs from `Pipeline`: the config,
//! the session factory and the metrics handles. Tables are CSV files under
//! `output.data_dir`.

use crate::{
    is_updated_table, location_table_name, run_discovery, search_url, updated_table_path,
    format_duration, Config, DiscoveryReport, HarvestError, HarvestReport, ListingHarvester, Metrics,
    RecordStore, SessionFactory, SessionGuard, SessionPool, SessionSource, TABLE_EXTENSION,
};
use anyhow::{Context, Result};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

/// A harvested location, already written to disk
#[derive(Debug)]
pub struct HarvestedTable {
    pub path: PathBuf,
    pub records: usize,
    pub report: HarvestReport,
    /// Set when discovery was chained onto the harvest.
    pub discovery: Option<(PathBuf, DiscoveryReport)>,
}

/// One row of the multi-location summary table
#[derive(Debug, Clone, Serialize)]
pub struct LocationSummary {
    pub location: String,
    pub status: String,
    pub file: Option<String>,
    pub records: Option<usize>,
    pub error: Option<String>,
}

#[derive(Debug, Default)]
pub struct BatchSummary {
    pub processed: Vec<PathBuf>,
    pub failed: Vec<(PathBuf, String)>,
}

pub struct Pipeline {
    config: Config,
    factory: Arc<dyn SessionFactory>,
    metrics: Arc<Metrics>,
}

impl Pipeline {
    pub fn new(config: Config, factory: Arc<dyn SessionFactory>, metrics: Arc<Metrics>) -> Self {
        Self {
            config,
            factory,
            metrics,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    fn session_source(&self) -> SessionSource {
        if self.config.discovery.reuse_sessions {
            SessionSource::Pooled(Arc::new(SessionPool::new(
                self.factory.clone(),
                self.config.session.clone(),
                self.config.discovery.max_idle_sessions,
            )))
        } else {
            SessionSource::Fresh {
                factory: self.factory.clone(),
                config: self.config.session.clone(),
            }
        }
    }

    /// Harvest one `{location, service}` search into a new table.
    pub async fn harvest(&self, location: &str, service: &str) -> Result<HarvestedTable> {
        let url = search_url(
            &self.config.harvest.search_url,
            service,
            location,
            &self.config.session.locale,
        );
        info!("Harvesting {} in {}", service, location);

        let session = self
            .factory
            .open(&self.config.session)
            .await
            .context("Failed to open harvest session")?;
        let guard = SessionGuard::new(session, format!("harvest {location}"));

        let mut store = RecordStore::new();
        let result: Result<HarvestReport, HarvestError> = async {
            let harvester =
                ListingHarvester::new(guard.session(), &self.config.harvest, &self.metrics);
            harvester.open_search(&url).await?;
            harvester.harvest_into(&mut store).await
        }
        .await;
        guard.release().await;

        let report = result.with_context(|| format!("Harvest of {location} failed"))?;
        if report.is_partial() {
            warn!(
                "Harvest of {} is partial: {} results kept after {:?}",
                location, report.item_count, report.scroll
            );
        }
        if report.unconfirmed_details > 0 {
            warn!(
                "{} of {} results in {} were read without a confirmed detail pane",
                report.unconfirmed_details, report.item_count, location
            );
        }
        if let Some(quality) = report.mean_quality {
            debug!("Mean field coverage for {}: {:.0}%", location, quality * 100.0);
        }

        let path = self
            .config
            .output
            .data_dir
            .join(location_table_name(location, service));
        store
            .write_csv(&path)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        info!(
            "Saved {} records to {} (selectors {})",
            store.len(),
            path.display(),
            report.selector_version
        );

        Ok(HarvestedTable {
            path,
            records: store.len(),
            report,
            discovery: None,
        })
    }

    /// Harvest a location and optionally run discovery on the new table.
    pub async fn harvest_location(
        &self,
        location: &str,
        service: &str,
        chain_discovery: bool,
    ) -> Result<HarvestedTable> {
        let mut harvested = self.harvest(location, service).await?;
        if chain_discovery {
            info!("Running email discovery on {}", harvested.path.display());
            let discovered = self.discover_table(&harvested.path).await?;
            harvested.discovery = Some(discovered);
        }
        Ok(harvested)
    }

    /// Harvest several locations in turn and write the summary table.
    ///
    /// A failed location is recorded in the summary; the run continues.
    pub async fn harvest_locations(
        &self,
        locations: &[String],
        service: &str,
        chain_discovery: bool,
    ) -> Result<Vec<LocationSummary>> {
        info!("Starting harvest for {} locations", locations.len());
        let mut summaries = Vec::with_capacity(locations.len());

        for (i, location) in locations.iter().enumerate() {
            if i > 0 {
                sleep(self.config.harvest.location_delay).await;
            }
            let summary = match self.harvest_location(location, service, chain_discovery).await {
                Ok(harvested) => LocationSummary {
                    location: location.clone(),
                    status: "success".to_string(),
                    file: Some(harvested.path.display().to_string()),
                    records: Some(harvested.records),
                    error: None,
                },
                Err(e) => {
                    error!("Error harvesting {}: {:#}", location, e);
                    LocationSummary {
                        location: location.clone(),
                        status: "failed".to_string(),
                        file: None,
                        records: None,
                        error: Some(format!("{e:#}")),
                    }
                }
            };
            summaries.push(summary);
        }

        let summary_path = self
            .config
            .output
            .data_dir
            .join(&self.config.output.summary_file);
        write_summary(&summary_path, &summaries)?;

        let successful = summaries.iter().filter(|s| s.status == "success").count();
        info!(
            "Harvest completed: {} locations, {} successful, {} failed; summary in {}",
            summaries.len(),
            successful,
            summaries.len() - successful,
            summary_path.display()
        );
        Ok(summaries)
    }

    /// Run discovery over an in-memory store.
    pub async fn enrich(&self, store: &mut RecordStore) -> Result<DiscoveryReport> {
        run_discovery(store, self.session_source(), &self.config, self.metrics.clone())
            .await
            .context("Email discovery failed")
    }

    /// Discover emails for a table and write `<stem><suffix>.csv` next to it.
    pub async fn discover_table(&self, table: &Path) -> Result<(PathBuf, DiscoveryReport)> {
        let mut store = RecordStore::read_csv(table)
            .with_context(|| format!("Failed to read {}", table.display()))?;
        info!("Loaded {} records from {}", store.len(), table.display());

        let report = self.enrich(&mut store).await?;

        let output = updated_table_path(table, &self.config.output.updated_suffix);
        store
            .write_csv(&output)
            .with_context(|| format!("Failed to write {}", output.display()))?;
        info!(
            "Saved updated table to {} in {}",
            output.display(),
            format_duration(report.elapsed)
        );
        Ok((output, report))
    }

    /// Run discovery on every table in `dir` that has no updated counterpart.
    pub async fn discover_pending(&self, dir: &Path) -> Result<BatchSummary> {
        let tables = pending_tables(
            dir,
            &self.config.output.updated_suffix,
            &self.config.output.summary_file,
        )?;
        let mut summary = BatchSummary::default();

        if tables.is_empty() {
            warn!("No pending tables in {}", dir.display());
            return Ok(summary);
        }
        let total = tables.len();
        info!("Found {} tables to process", total);

        let started = Instant::now();
        for (i, table) in tables.into_iter().enumerate() {
            info!("[{}/{}] Processing {}", i + 1, total, table.display());
            match self.discover_table(&table).await {
                Ok(_) => summary.processed.push(table),
                Err(e) => {
                    error!("Failed processing {}: {:#}", table.display(), e);
                    summary.failed.push((table, format!("{e:#}")));
                }
            }
        }

        info!(
            "Batch complete in {}: {} processed, {} failed",
            format_duration(started.elapsed()),
            summary.processed.len(),
            summary.failed.len()
        );
        Ok(summary)
    }
}

/// Tables in `dir` that still need discovery, sorted by name.
pub fn pending_tables(dir: &Path, suffix: &str, summary_file: &str) -> Result<Vec<PathBuf>> {
    let entries =
        std::fs::read_dir(dir).with_context(|| format!("Failed to read {}", dir.display()))?;

    let mut tables = Vec::new();
    for entry in entries {
        let path = entry?.path();
        let is_table = path
            .extension()
            .map(|e| e == TABLE_EXTENSION)
            .unwrap_or(false);
        let is_summary = path
            .file_name()
            .map(|name| name == summary_file)
            .unwrap_or(false);
        if !is_table || is_summary || is_updated_table(&path, suffix) {
            continue;
        }
        if updated_table_path(&path, suffix).exists() {
            continue;
        }
        tables.push(path);
    }

    tables.sort();
    Ok(tables)
}

fn write_summary(path: &Path, summaries: &[LocationSummary]) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let mut writer = csv::Writer::from_path(path)
        .with_context(|| format!("Failed to create {}", path.display()))?;
    for summary in summaries {
        writer.serialize(summary)?;
    }
    writer.flush()?;
    Ok(())
}
