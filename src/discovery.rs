//! Email discovery for a single website
//!
//! Probing order: each configured contact path, then the bare homepage with a
//! few scroll passes. The first match wins. Navigation failures on one step
//! only move discovery on to the next step; a crashed session ends it.

use crate::{DiscoveryConfig, DomSession, HarvestError, Metrics};
use once_cell::sync::Lazy;
use regex::Regex;
use std::fmt;
use tokio::time::sleep;
use tracing::debug;
use url::Url;

pub const WINDOW_SCROLL_SCRIPT: &str =
    "() => { window.scrollTo(0, document.body.scrollHeight); return true; }";

static EMAIL_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}").expect("email pattern compiles")
});

/// A website reference that passed normalization and may be probed
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NormalizedUrl(String);

impl NormalizedUrl {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// `self` with `path` appended, without doubling the slash.
    pub fn with_path(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.0.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }
}

impl fmt::Display for NormalizedUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Why a website was not probed. Not an error: these records are skipped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    Missing,
    Blank,
    Blocklisted(String),
    Unparseable,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::Missing => f.write_str("no website"),
            SkipReason::Blank => f.write_str("blank website"),
            SkipReason::Blocklisted(domain) => write!(f, "blocklisted domain {domain}"),
            SkipReason::Unparseable => f.write_str("unparseable website"),
        }
    }
}

/// Normalize a raw website value, or say why it is skipped.
///
/// Trims whitespace, rejects hosts containing a blocklisted substring
/// (case-insensitively) and prepends `https://` when no scheme is present.
/// Normalizing an already normalized value returns it unchanged.
pub fn classify_website(
    raw: Option<&str>,
    blocklist: &[String],
) -> Result<NormalizedUrl, SkipReason> {
    let raw = raw.ok_or(SkipReason::Missing)?.trim();
    if raw.is_empty() {
        return Err(SkipReason::Blank);
    }

    let candidate = if has_scheme(raw) {
        raw.to_string()
    } else {
        format!("https://{raw}")
    };

    let parsed = Url::parse(&candidate).map_err(|_| SkipReason::Unparseable)?;
    let host = parsed
        .host_str()
        .ok_or(SkipReason::Unparseable)?
        .to_lowercase();

    if let Some(domain) = blocklist
        .iter()
        .find(|domain| host.contains(&domain.to_lowercase()))
    {
        return Err(SkipReason::Blocklisted(domain.clone()));
    }

    Ok(NormalizedUrl(candidate))
}

/// `classify_website` without the reason.
pub fn normalize(raw: Option<&str>, blocklist: &[String]) -> Option<NormalizedUrl> {
    classify_website(raw, blocklist).ok()
}

fn has_scheme(raw: &str) -> bool {
    match raw.split_once("://") {
        Some((scheme, _)) => {
            !scheme.is_empty()
                && scheme
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'))
        }
        None => false,
    }
}

/// First email-shaped substring of `text`, scanning left to right.
pub fn find_email(text: &str) -> Option<String> {
    EMAIL_REGEX.find(text).map(|m| m.as_str().to_string())
}

/// Where a discovered address came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EmailSource {
    ContactPage(String),
    Homepage,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredEmail {
    pub email: String,
    pub source: EmailSource,
}

pub struct EmailDiscovery<'a> {
    config: &'a DiscoveryConfig,
    metrics: &'a Metrics,
}

impl<'a> EmailDiscovery<'a> {
    pub fn new(config: &'a DiscoveryConfig, metrics: &'a Metrics) -> Self {
        Self { config, metrics }
    }

    /// Find a contact email for `url`.
    ///
    /// `Ok(None)` means every strategy ran without a match. Only a session
    /// crash is returned as an error.
    pub async fn discover(
        &self,
        session: &dyn DomSession,
        url: &NormalizedUrl,
    ) -> Result<Option<DiscoveredEmail>, HarvestError> {
        for path in &self.config.contact_paths {
            let target = url.with_path(path);
            match self.probe_contact_page(session, &target).await {
                Ok(Some(email)) => {
                    debug!("Found {} on {}", email, target);
                    return Ok(Some(DiscoveredEmail {
                        email,
                        source: EmailSource::ContactPage(path.clone()),
                    }));
                }
                Ok(None) => debug!("No email on {}", target),
                Err(err) if err.is_soft() => {
                    self.note_soft_failure(&err);
                    debug!("Skipping {}: {}", target, err);
                }
                Err(err) => return Err(err),
            }
        }

        match self.scan_homepage(session, url).await {
            Ok(found) => Ok(found.map(|email| DiscoveredEmail {
                email,
                source: EmailSource::Homepage,
            })),
            Err(err) if err.is_soft() => {
                self.note_soft_failure(&err);
                debug!("Homepage scan of {} failed: {}", url, err);
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    async fn probe_contact_page(
        &self,
        session: &dyn DomSession,
        target: &str,
    ) -> Result<Option<String>, HarvestError> {
        session.navigate(target).await?;
        sleep(self.config.probe_settle).await;
        Ok(session.query_text("body").await?.as_deref().and_then(find_email))
    }

    async fn scan_homepage(
        &self,
        session: &dyn DomSession,
        url: &NormalizedUrl,
    ) -> Result<Option<String>, HarvestError> {
        session.navigate(url.as_str()).await?;
        sleep(self.config.homepage_settle).await;

        // A fixed number of passes: contact details are usually near the
        // top or in the footer.
        for _ in 0..self.config.homepage_scroll_iterations {
            session.execute_script(WINDOW_SCROLL_SCRIPT, &[]).await?;
            sleep(self.config.homepage_scroll_pause).await;
        }

        Ok(session.query_text("body").await?.as_deref().and_then(find_email))
    }

    fn note_soft_failure(&self, err: &HarvestError) {
        if err.is_timeout() {
            self.metrics.record_navigation_timeout();
        }
    }
}
