//! Bio and moniker extraction from a citizen's profile page, plus the
//! 4-digit verification token matcher.

use once_cell::sync::Lazy;
use regex::Regex;
use scraper::{Html, Selector};

use super::collapse_whitespace;

/// Selector strategies for the profile biography block.
const BIO_SELECTORS: &[&str] = &[
    "div.entry.bio div.value",
    "div.bio div.value",
    "div.profile-bio",
];

/// Selector strategies for the community moniker.
const MONIKER_SELECTORS: &[&str] = &[
    "div.profile .info .entry:first-child .value",
    "div.profile .moniker",
    "span.moniker",
];

static DIGIT_RUN_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\d+").unwrap());

/// Extract the free-text bio from a profile page.
///
/// Inner text is joined with single spaces. Returns `None` when no strategy
/// matches or the matched element is empty.
pub fn extract_bio(html: &str) -> Option<String> {
    first_strategy_text(html, BIO_SELECTORS)
}

/// Extract the community moniker from a profile page. Always non-fatal for
/// callers; absence just leaves the snapshot field empty.
pub fn extract_moniker(html: &str) -> Option<String> {
    first_strategy_text(html, MONIKER_SELECTORS)
}

fn first_strategy_text(html: &str, selectors: &[&str]) -> Option<String> {
    if html.trim().is_empty() {
        return None;
    }
    let document = Html::parse_document(html);
    for raw in selectors {
        let Ok(selector) = Selector::parse(raw) else {
            continue;
        };
        if let Some(element) = document.select(&selector).next() {
            let text = collapse_whitespace(&element.text().collect::<Vec<_>>().join(" "));
            if !text.is_empty() {
                return Some(text);
            }
        }
    }
    None
}

/// Test whether `candidate_token` appears in the bio as a standalone 4-digit
/// number.
///
/// The candidate is zero-padded to 4 digits, then compared against every
/// maximal digit run of exactly length 4 in the bio (word-boundary
/// semantics). If the bio contains several distinct 4-digit numbers, any of
/// them matching counts; the matcher does not guess which one the user meant
/// as the token.
pub fn token_matches(bio_text: &str, candidate_token: &str) -> bool {
    let candidate = candidate_token.trim();
    if candidate.is_empty() || !candidate.chars().all(|c| c.is_ascii_digit()) {
        return false;
    }
    let padded = format!("{:0>4}", candidate);
    if padded.len() != 4 {
        return false;
    }

    DIGIT_RUN_RE
        .find_iter(bio_text)
        .filter(|run| run.as_str().len() == 4)
        .any(|run| run.as_str() == padded)
}
