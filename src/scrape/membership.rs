//! Classification of a parsed organization set against the target org.

use crate::models::MembershipStatus;

use super::normalize_org_name;
use super::org_page::ParsedOrgs;

/// Classify parsed org data against a target organization name.
///
/// Comparison is case-insensitive and exact; no substring matching. The main
/// organization is checked first and wins outright, even if the target also
/// appears in the affiliate set.
pub fn resolve_status(orgs: &ParsedOrgs, target_org: &str) -> MembershipStatus {
    let target = normalize_org_name(target_org);

    if orgs.main.as_deref() == Some(target.as_str()) {
        return MembershipStatus::Main;
    }
    if orgs.affiliates.iter().any(|a| a == &target) {
        return MembershipStatus::Affiliate;
    }
    MembershipStatus::NonMember
}
