use chrono::{DateTime, Utc};
use poise::serenity_prelude::UserId;
use serde::{Deserialize, Serialize};

/// Placeholder name the directory site renders for hidden memberships.
/// Org names are normalized to lowercase before they reach this check.
const REDACTED_PLACEHOLDER: &str = "redacted";

/// Membership classification for one user against the directory data
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MembershipStatus {
    Main,
    Affiliate,
    NonMember,
}

impl MembershipStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MembershipStatus::Main => "main",
            MembershipStatus::Affiliate => "affiliate",
            MembershipStatus::NonMember => "non_member",
        }
    }
}

impl std::fmt::Display for MembershipStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Point-in-time organization-membership truth for one user.
///
/// Created fresh on every fetch. Cached snapshots are immutable and expire
/// by TTL; persisted snapshots are overwritten wholesale on each store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationSnapshot {
    /// Discord user ID
    pub user_id: UserId,

    /// RSI handle, case-preserved as the site returns it
    pub handle: String,

    /// Derived from the org lists, never set directly
    pub status: MembershipStatus,

    /// Main organization names (normalized lowercase, ordered)
    pub main_orgs: Vec<String>,

    /// Affiliate organization names (normalized lowercase, ordered, deduped)
    pub affiliate_orgs: Vec<String>,

    /// Community moniker from the profile page, when one was found
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_moniker: Option<String>,

    /// When this snapshot was taken
    pub checked_at: DateTime<Utc>,

    /// Present when the fetch was degraded; the snapshot is then a
    /// best-effort result and is never cached
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl VerificationSnapshot {
    /// Build a snapshot from parsed org lists, deriving the status field.
    pub fn new(
        user_id: UserId,
        handle: String,
        main_orgs: Vec<String>,
        affiliate_orgs: Vec<String>,
        display_moniker: Option<String>,
    ) -> Self {
        let status = derive_status(&main_orgs, &affiliate_orgs);
        Self {
            user_id,
            handle,
            status,
            main_orgs,
            affiliate_orgs,
            display_moniker,
            checked_at: Utc::now(),
            error: None,
        }
    }

    /// Degraded snapshot for a fetch that failed in a non-terminal way.
    pub fn degraded(user_id: UserId, handle: String, error: String) -> Self {
        Self {
            user_id,
            handle,
            status: MembershipStatus::NonMember,
            main_orgs: Vec::new(),
            affiliate_orgs: Vec::new(),
            display_moniker: None,
            checked_at: Utc::now(),
            error: Some(error),
        }
    }

    /// Whether the fetch behind this snapshot completed cleanly
    pub fn is_clean(&self) -> bool {
        self.error.is_none()
    }
}

/// True for the site's hidden-membership placeholder. Redacted entries
/// never count toward membership status.
pub fn is_redacted(org_name: &str) -> bool {
    org_name == REDACTED_PLACEHOLDER
}

/// Derive a membership status from org lists: main wins if any non-redacted
/// main org exists, then affiliate, else non-member.
pub fn derive_status(main_orgs: &[String], affiliate_orgs: &[String]) -> MembershipStatus {
    if main_orgs.iter().any(|o| !is_redacted(o)) {
        MembershipStatus::Main
    } else if affiliate_orgs.iter().any(|o| !is_redacted(o)) {
        MembershipStatus::Affiliate
    } else {
        MembershipStatus::NonMember
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_derivation_main_wins() {
        let status = derive_status(&["test squadron".to_string()], &["other org".to_string()]);
        assert_eq!(status, MembershipStatus::Main);
    }

    #[test]
    fn test_status_derivation_affiliate_only() {
        let status = derive_status(&[], &["other org".to_string()]);
        assert_eq!(status, MembershipStatus::Affiliate);
    }

    #[test]
    fn test_status_derivation_empty() {
        let status = derive_status(&[], &[]);
        assert_eq!(status, MembershipStatus::NonMember);
    }

    #[test]
    fn test_redacted_entries_never_count() {
        let status = derive_status(&["redacted".to_string()], &["redacted".to_string()]);
        assert_eq!(status, MembershipStatus::NonMember);

        // A redacted main does not shadow a visible affiliate
        let status = derive_status(&["redacted".to_string()], &["other org".to_string()]);
        assert_eq!(status, MembershipStatus::Affiliate);
    }

    #[test]
    fn test_snapshot_new_derives_status() {
        let snapshot = VerificationSnapshot::new(
            UserId::new(1),
            "SomeHandle".to_string(),
            vec!["test squadron".to_string()],
            vec![],
            Some("Tester".to_string()),
        );
        assert_eq!(snapshot.status, MembershipStatus::Main);
        assert!(snapshot.is_clean());
    }

    #[test]
    fn test_degraded_snapshot() {
        let snapshot = VerificationSnapshot::degraded(
            UserId::new(1),
            "Foo".to_string(),
            "timeout".to_string(),
        );
        assert_eq!(snapshot.status, MembershipStatus::NonMember);
        assert!(!snapshot.is_clean());
        assert_eq!(snapshot.error.as_deref(), Some("timeout"));
    }
}
