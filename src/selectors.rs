//! Versioned selector table and list-item markup parsing
//!
//! All knowledge of the results page's markup lives here, so a markup change
//! breaks individual fields rather than the whole harvest.

use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};

/// CSS selectors used against the search results page
///
/// `version` is logged with each harvest so output can be traced back to the
/// table that produced it.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct SelectorTable {
    pub version: String,
    /// Scrollable results container
    pub container: String,
    /// One result item inside the container
    pub item: String,
    /// Link inside an item that opens its detail pane
    pub item_link: String,
    /// Item name, inside the item markup
    pub name: String,
    /// Star rating, inside the item markup
    pub rating: String,
    /// Review count, inside the item markup; rendered as "(123)"
    pub review_count: String,
    /// Spans of the item's secondary lines that make up the address
    pub address_spans: String,
    /// Title of the open detail pane
    pub detail_title: String,
    /// Detail element whose aria-label reads "Website: ..."
    pub website: String,
    /// Detail element whose aria-label reads "Phone: ..."
    pub phone: String,
    /// Dedicated "back to list" button
    pub back_button: String,
    /// Consent dialog accept button, when the page shows one
    pub consent_button: String,
}

impl Default for SelectorTable {
    fn default() -> Self {
        Self {
            version: "maps-2024.1".to_string(),
            container: "div[role='feed']".to_string(),
            item: "div.Nv2PK".to_string(),
            item_link: "a".to_string(),
            name: "div.qBF1Pd".to_string(),
            rating: "span.MW4etd".to_string(),
            review_count: "span.UY7F9".to_string(),
            address_spans: "div.W4Efsd span".to_string(),
            detail_title: "h1.DUwDvf".to_string(),
            website: "[aria-label^='Website']".to_string(),
            phone: "[aria-label^='Phone']".to_string(),
            back_button: "button[jsaction='pane.homeBack']".to_string(),
            consent_button: "form[action*='consent'] button".to_string(),
        }
    }
}

/// Fields readable from the list view alone
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ListingFields {
    pub name: Option<String>,
    pub rating: Option<String>,
    pub review_count: Option<String>,
    pub address: Option<String>,
}

impl ListingFields {
    /// Number of fields that were present in the markup.
    pub fn found(&self) -> usize {
        [
            self.name.is_some(),
            self.rating.is_some(),
            self.review_count.is_some(),
            self.address.is_some(),
        ]
        .iter()
        .filter(|present| **present)
        .count()
    }

    pub const EXPECTED: usize = 4;
}

/// Parse the serialized markup of one list item.
///
/// A selector that does not compile or does not match leaves its field empty.
pub fn parse_listing_markup(markup: &str, selectors: &SelectorTable) -> ListingFields {
    let fragment = Html::parse_fragment(markup);

    let name = select_text(&fragment, &selectors.name);
    let rating = select_text(&fragment, &selectors.rating);
    let review_count = select_text(&fragment, &selectors.review_count).and_then(|reviews| {
        let trimmed = reviews.trim_matches(|c| c == '(' || c == ')').trim().to_string();
        (!trimmed.is_empty()).then_some(trimmed)
    });
    let address = select_address(&fragment, &selectors.address_spans);

    ListingFields {
        name,
        rating,
        review_count,
        address,
    }
}

/// Strip the "Website:" / "Phone:" prefix from a detail-pane aria-label.
pub fn aria_label_value(label: &str, prefix: &str) -> Option<String> {
    let value = label.rsplit(prefix).next().unwrap_or(label).trim();
    (!value.is_empty()).then(|| value.to_string())
}

fn select_text(fragment: &Html, selector: &str) -> Option<String> {
    let selector = Selector::parse(selector).ok()?;
    fragment
        .select(&selector)
        .next()
        .map(element_text)
        .filter(|text| !text.is_empty())
}

// Only leaf spans count: wrapper spans repeat their children's text.
fn select_address(fragment: &Html, selector: &str) -> Option<String> {
    let selector = Selector::parse(selector).ok()?;
    let mut parts: Vec<String> = Vec::new();

    for span in fragment.select(&selector) {
        let has_nested_span = span
            .children()
            .filter_map(ElementRef::wrap)
            .any(|child| child.value().name() == "span");
        if has_nested_span {
            continue;
        }

        let text = element_text(span);
        if text.is_empty() || is_separator(&text) {
            continue;
        }
        if parts.last() != Some(&text) {
            parts.push(text);
        }
    }

    (!parts.is_empty()).then(|| parts.join(" / "))
}

fn element_text(element: ElementRef<'_>) -> String {
    element
        .text()
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

fn is_separator(text: &str) -> bool {
    text.chars().all(|c| c == '·' || c == '⋅' || c.is_whitespace())
}
