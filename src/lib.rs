//! # Contact Harvester
//!
//! Collects business listings from a map-search results page and enriches
//! each listing with a contact email found on the business's own website.
//! Both stages drive a real Chrome instance through chromiumoxide.
//!
//! ## Stages
//!
//! 1. **Harvest**: open the map search for `{service} {location}`, scroll the
//!    results feed until its height stops changing (or a cap is reached),
//!    then visit every listing and read name, address, rating, review count,
//!    phone and website. Rows are written to `{location}_{service}.csv`.
//! 2. **Discover**: for every record with a probe-able website, a bounded
//!    pool of workers tries a few contact paths, then scans the home page,
//!    and records the first email address found. Results are merged back by
//!    record position, so the updated table keeps the input order.
//!
//! Every record ends with one of four email states: unset, found, not found,
//! or an error message scoped to that record. Records already resolved in an
//! input table are never probed again, so an interrupted run can be resumed
//! by running discovery on its output.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use contact_harvester::{ChromeSessionFactory, Config, Metrics, Pipeline};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::default();
//!     let factory = Arc::new(ChromeSessionFactory::new(None));
//!     let pipeline = Pipeline::new(config, factory, Arc::new(Metrics::new()));
//!
//!     let table = pipeline.harvest_location("patong beach", "restaurants", true).await?;
//!     println!("Harvested {} records into {}", table.records, table.path.display());
//!     Ok(())
//! }
//! ```
//!
//! ## CLI Usage
//!
//! ### Single Location
//! ```bash
//! contact-harvester harvest --location "patong beach" --service restaurants
//! ```
//!
//! ### Several Locations
//! ```bash
//! contact-harvester harvest-many --locations "patong beach, kata, karon" --service spa
//! ```
//!
//! ### Discovery Only
//! ```bash
//! contact-harvester discover --table data/kata_spa.csv --concurrency 8
//! contact-harvester discover-pending --dir data/
//! ```

/// Configuration and settings for the harvester
pub mod config;

/// Error types and error handling utilities
pub mod error;

/// Browser session abstraction and the Chrome-backed implementation
pub mod session;

/// Optional reuse of discovery sessions between tasks
pub mod session_pool;

/// Versioned selector table and listing markup parsing
pub mod selectors;

/// Search results scrolling and listing extraction
pub mod harvester;

/// Website classification, URL normalization and email probing
pub mod discovery;

/// Bounded worker pool for concurrent email discovery
pub mod worker;

/// Ordered business record table with CSV persistence
pub mod store;

/// Harvest and discovery runs over locations and tables
pub mod pipeline;

/// Counters and histograms with an optional Prometheus exporter
pub mod metrics;

/// Command-line interface implementation
pub mod cli;

/// Utility functions and helpers
pub mod utils;

#[cfg(test)]
mod testing;


pub use cli::*;
pub use config::*;
pub use discovery::*;
pub use error::*;
pub use harvester::*;
pub use metrics::*;
pub use pipeline::*;
pub use selectors::*;
pub use session::*;
pub use session_pool::*;
pub use store::*;
pub use utils::*;
pub use worker::*;
