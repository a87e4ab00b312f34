pub mod bio;
pub mod membership;
pub mod org_page;

pub use bio::{extract_bio, extract_moniker, token_matches};
pub use membership::resolve_status;
pub use org_page::{parse_org_page, ParsedOrgs};

use once_cell::sync::Lazy;
use regex::Regex;

static WHITESPACE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").unwrap());

/// Collapse runs of whitespace to single spaces and trim.
pub(crate) fn collapse_whitespace(text: &str) -> String {
    WHITESPACE_RE.replace_all(text.trim(), " ").to_string()
}

/// Canonical form for organization names: collapsed whitespace, lowercase.
pub fn normalize_org_name(name: &str) -> String {
    collapse_whitespace(name).to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collapse_whitespace() {
        assert_eq!(collapse_whitespace("  a\n\t b   c "), "a b c");
        assert_eq!(collapse_whitespace(""), "");
    }

    #[test]
    fn test_normalize_org_name() {
        assert_eq!(normalize_org_name("  TEST \n Squadron "), "test squadron");
    }
}
