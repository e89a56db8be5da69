use crate::{parse_location_list, Config, Metrics, Pipeline, SessionFactory};
use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

#[derive(Parser)]
#[command(name = "contact-harvester")]
#[command(about = "Harvest business listings from map search results and find their contact emails")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    #[arg(long, global = true, help = "Configuration file path (JSON)")]
    pub config: Option<PathBuf>,

    #[arg(long, global = true, help = "Concurrent discovery workers")]
    pub concurrency: Option<usize>,

    #[arg(long, global = true, help = "Navigation timeout in seconds")]
    pub timeout: Option<u64>,

    #[arg(long, global = true, help = "Show the browser window")]
    pub windowed: bool,

    #[arg(long, global = true, help = "Enable verbose logging")]
    pub verbose: bool,

    #[arg(long, global = true, help = "Chrome executable path")]
    pub chrome_path: Option<String>,

    #[arg(long, global = true, help = "Directory for harvested and updated tables")]
    pub data_dir: Option<PathBuf>,

    #[arg(long, global = true, help = "User-Agent sent by the browser")]
    pub user_agent: Option<String>,

    #[arg(long, global = true, help = "Browser and search locale, e.g. en")]
    pub locale: Option<String>,

    #[arg(long, global = true, help = "Write Prometheus metrics to this file on exit")]
    pub metrics_file: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Harvest one location, then discover emails for the new table
    Harvest {
        #[arg(short, long, help = "Location to search, e.g. \"patong beach\"")]
        location: String,

        #[arg(short, long, default_value = "restaurants", help = "Kind of business")]
        service: String,

        #[arg(long, help = "Only harvest; do not run email discovery")]
        skip_discovery: bool,
    },

    /// Harvest several locations in turn and write a summary table
    HarvestMany {
        #[arg(
            short,
            long,
            help = "Comma-separated locations, or a .json file holding an array of locations"
        )]
        locations: String,

        #[arg(short, long, default_value = "restaurants", help = "Kind of business")]
        service: String,

        #[arg(long, help = "Only harvest; do not run email discovery")]
        skip_discovery: bool,
    },

    /// Discover emails for one table
    Discover {
        #[arg(short, long, help = "Table to enrich (CSV)")]
        table: PathBuf,
    },

    /// Discover emails for every table in the data directory without an updated copy
    DiscoverPending {
        #[arg(short, long, help = "Directory to scan (default: the data directory)")]
        dir: Option<PathBuf>,
    },

    /// Validate configuration
    Validate {
        #[arg(short, long, help = "Configuration file to validate")]
        config: PathBuf,
    },
}

/// Apply command-line overrides on top of a loaded configuration.
pub fn apply_overrides(config: &mut Config, args: &Cli) {
    if let Some(concurrency) = args.concurrency {
        config.discovery.concurrency = concurrency;
    }
    if let Some(timeout) = args.timeout {
        config.session.navigation_timeout = Duration::from_secs(timeout);
    }
    if args.windowed {
        config.session.headless = false;
    }
    if let Some(chrome_path) = &args.chrome_path {
        config.chrome_path = Some(chrome_path.clone());
    }
    if let Some(data_dir) = &args.data_dir {
        config.output.data_dir = data_dir.clone();
    }
    if let Some(user_agent) = &args.user_agent {
        config.session.user_agent = user_agent.clone();
    }
    if let Some(locale) = &args.locale {
        config.session.locale = locale.clone();
    }
}

/// Locations from a comma-separated list or a JSON array file.
pub fn read_locations(input: &str) -> Result<Vec<String>> {
    let locations = if input.ends_with(".json") {
        let content = std::fs::read_to_string(input)
            .with_context(|| format!("Failed to read locations file {input}"))?;
        serde_json::from_str::<Vec<String>>(&content)
            .with_context(|| format!("{input} must contain an array of location strings"))?
    } else {
        parse_location_list(input)
    };

    if locations.is_empty() {
        bail!("No locations given");
    }
    Ok(locations)
}

pub struct CliRunner {
    pub config: Config,
    pub pipeline: Pipeline,
}

impl CliRunner {
    pub fn new(config: Config, factory: Arc<dyn SessionFactory>, metrics: Arc<Metrics>) -> Self {
        let pipeline = Pipeline::new(config.clone(), factory, metrics);
        Self { config, pipeline }
    }

    pub async fn run(&self, command: Commands) -> Result<()> {
        match command {
            Commands::Harvest {
                location,
                service,
                skip_discovery,
            } => self.run_harvest(&location, &service, !skip_discovery).await,
            Commands::HarvestMany {
                locations,
                service,
                skip_discovery,
            } => {
                self.run_harvest_many(&locations, &service, !skip_discovery)
                    .await
            }
            Commands::Discover { table } => self.run_discover(&table).await,
            Commands::DiscoverPending { dir } => {
                let dir = dir.unwrap_or_else(|| self.config.output.data_dir.clone());
                self.run_discover_pending(&dir).await
            }
            Commands::Validate { config } => self.validate_config(&config),
        }
    }

    pub async fn run_harvest(&self, location: &str, service: &str, discover: bool) -> Result<()> {
        let harvested = self
            .pipeline
            .harvest_location(location, service, discover)
            .await?;

        println!("Harvest complete:");
        println!("  Location: {location}");
        println!("  Records: {}", harvested.records);
        println!("  Table: {}", harvested.path.display());
        if harvested.report.is_partial() {
            println!("  Partial: scrolling stopped at a cap ({:?})", harvested.report.scroll);
        }
        if let Some((path, report)) = &harvested.discovery {
            println!("  Updated table: {}", path.display());
            println!(
                "  Emails: {} found, {} not found, {} errors, {} skipped",
                report.found,
                report.not_found,
                report.errors,
                report.skipped.len()
            );
        }
        Ok(())
    }

    pub async fn run_harvest_many(&self, input: &str, service: &str, discover: bool) -> Result<()> {
        let locations = read_locations(input)?;
        let summaries = self
            .pipeline
            .harvest_locations(&locations, service, discover)
            .await?;

        let successful = summaries.iter().filter(|s| s.status == "success").count();
        println!("Harvest completed:");
        println!("  Total locations: {}", summaries.len());
        println!("  Successful: {successful}");
        println!("  Failed: {}", summaries.len() - successful);
        Ok(())
    }

    pub async fn run_discover(&self, table: &Path) -> Result<()> {
        let (output, report) = self.pipeline.discover_table(table).await?;

        println!("Discovery complete:");
        println!("  Updated table: {}", output.display());
        println!("  Probed: {}", report.dispatched);
        println!("  Found: {}", report.found);
        println!("  Not found: {}", report.not_found);
        println!("  Errors: {}", report.errors);
        println!("  Skipped: {}", report.skipped.len());
        if report.already_resolved > 0 {
            println!("  Already resolved: {}", report.already_resolved);
        }
        Ok(())
    }

    pub async fn run_discover_pending(&self, dir: &Path) -> Result<()> {
        let summary = self.pipeline.discover_pending(dir).await?;

        println!("Batch processing complete:");
        println!("  Processed: {}", summary.processed.len());
        for (table, error) in &summary.failed {
            println!("  Failed: {} ({error})", table.display());
        }
        Ok(())
    }

    pub fn validate_config(&self, config_path: &Path) -> Result<()> {
        println!("Validating configuration: {}", config_path.display());

        let config = Config::from_json_file(config_path)
            .with_context(|| format!("Failed to load {}", config_path.display()))?;
        config.validate()?;

        println!("Configuration is valid:");
        println!("  Concurrency: {}", config.discovery.concurrency);
        println!("  Navigation timeout: {:?}", config.session.navigation_timeout);
        println!("  Headless: {}", config.session.headless);
        println!(
            "  Viewport: {}x{}",
            config.session.viewport.width, config.session.viewport.height
        );
        println!("  Selector table: {}", config.harvest.selectors.version);
        println!("  Data directory: {}", config.output.data_dir.display());

        Ok(())
    }
}

pub fn setup_logging(verbose: bool) -> Result<()> {
    let level = if verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .init();

    info!("Logging initialized at {}", level);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_flags_override_config() {
        let args = Cli::parse_from([
            "contact-harvester",
            "--concurrency",
            "8",
            "--timeout",
            "30",
            "--windowed",
            "--locale",
            "de",
            "--data-dir",
            "out",
            "discover",
            "--table",
            "out/kata_spa.csv",
        ]);
        let mut config = Config::default();
        apply_overrides(&mut config, &args);

        assert_eq!(config.discovery.concurrency, 8);
        assert_eq!(config.session.navigation_timeout, Duration::from_secs(30));
        assert!(!config.session.headless);
        assert_eq!(config.session.locale, "de");
        assert_eq!(config.output.data_dir, PathBuf::from("out"));
        assert!(matches!(args.command, Commands::Discover { .. }));
    }

    #[test]
    fn harvest_defaults_to_chained_discovery() {
        let args = Cli::parse_from(["contact-harvester", "harvest", "--location", "patong beach"]);
        match args.command {
            Commands::Harvest {
                location,
                service,
                skip_discovery,
            } => {
                assert_eq!(location, "patong beach");
                assert_eq!(service, "restaurants");
                assert!(!skip_discovery);
            }
            _ => panic!("expected harvest"),
        }
    }

    #[test]
    fn locations_from_list_and_json() {
        assert_eq!(read_locations("kata, karon").unwrap(), vec!["kata", "karon"]);
        assert!(read_locations(" , ").is_err());

        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("locations.json");
        std::fs::write(&file, r#"["patong beach", "kata"]"#).unwrap();
        assert_eq!(
            read_locations(file.to_str().unwrap()).unwrap(),
            vec!["patong beach", "kata"]
        );

        std::fs::write(&file, r#"{"location": "kata"}"#).unwrap();
        assert!(read_locations(file.to_str().unwrap()).is_err());
    }
}
