//! Extraction of organization memberships from a citizen's organizations page.
//!
//! The page markup is not under our control and changes without notice, so
//! each piece of data has an ordered list of selector strategies. The first
//! strategy that yields a result wins; if none do, the result is empty rather
//! than an error.

use scraper::{Html, Selector};
use tracing::debug;

use super::normalize_org_name;

/// Selector strategies for the main organization name, newest markup first.
const MAIN_ORG_SELECTORS: &[&str] = &[
    "div.box-content.org.main .info .entry a.value",
    "div.box-content.org.main .info .entry .value",
    "div.main-org .org-name",
];

/// Selector strategies for affiliate organization names.
const AFFILIATE_ORG_SELECTORS: &[&str] = &[
    "div.box-content.org.affiliation .info .entry a.value",
    "div.box-content.org.affiliation .info .entry .value",
    "div.affiliate-orgs .org-name",
];

/// Organization names extracted from one organizations page, normalized
/// (whitespace-collapsed, lowercase).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedOrgs {
    /// Main organization, when the page reports one
    pub main: Option<String>,

    /// Affiliate organizations, first-seen order, literal duplicates removed
    pub affiliates: Vec<String>,
}

impl ParsedOrgs {
    /// Main org as a list, for snapshot construction.
    pub fn main_list(&self) -> Vec<String> {
        self.main.iter().cloned().collect()
    }
}

/// Parse a citizen's organizations page.
///
/// Never fails: empty or unrecognizable markup yields an empty result.
pub fn parse_org_page(html: &str) -> ParsedOrgs {
    if html.trim().is_empty() {
        return ParsedOrgs::default();
    }

    let document = Html::parse_document(html);

    let main = first_strategy_text(&document, MAIN_ORG_SELECTORS);
    let affiliates = first_strategy_list(&document, AFFILIATE_ORG_SELECTORS);

    if main.is_none() && affiliates.is_empty() {
        debug!("No organization structure found on page");
    }

    ParsedOrgs { main, affiliates }
}

/// Try each selector in order; return the first non-empty single match.
fn first_strategy_text(document: &Html, selectors: &[&str]) -> Option<String> {
    for raw in selectors {
        let Ok(selector) = Selector::parse(raw) else {
            continue;
        };
        if let Some(element) = document.select(&selector).next() {
            let name = normalize_org_name(&element.text().collect::<Vec<_>>().join(" "));
            if !name.is_empty() {
                return Some(name);
            }
        }
    }
    None
}

/// Try each selector in order; return all matches from the first selector
/// that yields any, deduplicated preserving first occurrence.
fn first_strategy_list(document: &Html, selectors: &[&str]) -> Vec<String> {
    for raw in selectors {
        let Ok(selector) = Selector::parse(raw) else {
            continue;
        };
        let mut names: Vec<String> = Vec::new();
        for element in document.select(&selector) {
            let name = normalize_org_name(&element.text().collect::<Vec<_>>().join(" "));
            if !name.is_empty() && !names.contains(&name) {
                names.push(name);
            }
        }
        if !names.is_empty() {
            return names;
        }
    }
    Vec::new()
}
