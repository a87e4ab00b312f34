//! Interactive verification flow.
//!
//! `/verify <handle>` issues a 4-digit token the user places in their RSI
//! profile bio; confirming re-reads the bio through the shared gateway,
//! takes a live snapshot, and persists it with the handle-conflict check.

use dashmap::DashMap;
use poise::serenity_prelude::UserId;
use rand::Rng;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::{BotError, Result};
use crate::models::VerificationSnapshot;
use crate::rsi::SharedRsiGateway;
use crate::storage::SharedVerificationStore;

/// Pending verification state
#[derive(Debug, Clone)]
pub struct PendingVerification {
    pub user_id: UserId,
    pub handle: String,
    pub token: String,
    pub started_at: u64,
}

/// Result of a confirmation attempt
#[derive(Debug, Clone)]
pub struct ConfirmResult {
    pub success: bool,
    pub snapshot: Option<VerificationSnapshot>,
    pub error: Option<String>,
}

impl ConfirmResult {
    fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            snapshot: None,
            error: Some(message.into()),
        }
    }
}

/// Manages the token handshake between Discord users and their RSI profiles.
pub struct VerifyFlow {
    gateway: SharedRsiGateway,
    store: SharedVerificationStore,

    /// Pending verifications (user_id -> pending state)
    pending: DashMap<UserId, PendingVerification>,
}

impl VerifyFlow {
    pub fn new(gateway: SharedRsiGateway, store: SharedVerificationStore) -> Self {
        Self {
            gateway,
            store,
            pending: DashMap::new(),
        }
    }

    /// Start a verification for a user, issuing a fresh token.
    ///
    /// Rejects immediately when the handle is empty or already owned by a
    /// different user, so the admin-visible conflict happens before the user
    /// edits their bio.
    pub async fn begin(&self, user_id: UserId, handle: &str) -> Result<PendingVerification> {
        let handle = handle.trim();
        if handle.is_empty() {
            return Err(BotError::Internal {
                message: "Handle must not be empty".to_string(),
            });
        }

        if let Some(owner) = self.store.check_handle_conflict(handle, user_id).await? {
            return Err(BotError::HandleConflict {
                handle: handle.to_string(),
                owner: owner.to_string(),
            });
        }

        let pending = PendingVerification {
            user_id,
            handle: handle.to_string(),
            token: format!("{:04}", rand::thread_rng().gen_range(0..10000u32)),
            started_at: current_timestamp(),
        };
        self.pending.insert(user_id, pending.clone());
        debug!("Started verification for {} as '{}'", user_id, handle);
        Ok(pending)
    }

    /// Get pending verification for a user
    pub fn get_pending(&self, user_id: UserId) -> Option<PendingVerification> {
        self.pending.get(&user_id).map(|r| r.clone())
    }

    /// Cancel a pending verification
    pub fn cancel(&self, user_id: UserId) {
        self.pending.remove(&user_id);
        debug!("Cancelled verification for {}", user_id);
    }

    /// Attempt to confirm a pending verification: check the bio token, take
    /// a live snapshot, persist it. The pending entry survives a failed
    /// attempt so the user can fix their bio and try again.
    pub async fn confirm(&self, user_id: UserId) -> ConfirmResult {
        let Some(pending) = self.get_pending(user_id) else {
            return ConfirmResult::failure(
                "No verification in progress. Run `/verify <handle>` first.",
            );
        };

        match self
            .gateway
            .bio_token_matches(&pending.handle, &pending.token)
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                return ConfirmResult::failure(format!(
                    "Could not find the token **{}** in the bio of '{}'. \
                     Add it to your RSI profile bio, wait a moment, and try again.",
                    pending.token, pending.handle
                ));
            }
            Err(BotError::HandleNotFound { handle }) => {
                self.pending.remove(&user_id);
                return ConfirmResult::failure(format!(
                    "The handle '{}' does not exist on the directory site. \
                     Check the spelling and run `/verify` again.",
                    handle
                ));
            }
            Err(e) => {
                warn!("Bio check failed for {}: {}", pending.handle, e);
                return ConfirmResult::failure(format!(
                    "Could not read the profile right now: {}. Please try again shortly.",
                    e
                ));
            }
        }

        // Token confirmed; take a fresh membership snapshot
        let snapshot = match self
            .gateway
            .get_snapshot(user_id, &pending.handle, true)
            .await
        {
            Ok(snapshot) if snapshot.is_clean() => snapshot,
            Ok(snapshot) => {
                let reason = snapshot.error.unwrap_or_else(|| "unknown".to_string());
                return ConfirmResult::failure(format!(
                    "Token confirmed, but the membership lookup failed: {}. Please try again.",
                    reason
                ));
            }
            Err(BotError::HandleNotFound { handle }) => {
                self.pending.remove(&user_id);
                return ConfirmResult::failure(format!(
                    "The handle '{}' disappeared mid-verification. Run `/verify` again.",
                    handle
                ));
            }
            Err(e) => {
                return ConfirmResult::failure(format!(
                    "Token confirmed, but the membership lookup failed: {}. Please try again.",
                    e
                ));
            }
        };

        match self.store.store(&snapshot).await {
            Ok(()) => {}
            Err(BotError::HandleConflict { handle, .. }) => {
                return ConfirmResult::failure(format!(
                    "The handle '{}' was claimed by another account while you were verifying. \
                     Contact an administrator if this is your handle.",
                    handle
                ));
            }
            Err(e) => {
                return ConfirmResult::failure(format!("Failed to save verification: {}", e));
            }
        }

        self.pending.remove(&user_id);
        info!(
            "User {} verified as '{}' ({})",
            user_id, snapshot.handle, snapshot.status
        );
        ConfirmResult {
            success: true,
            snapshot: Some(snapshot),
            error: None,
        }
    }

    /// Clean up old pending verifications (older than 1 hour)
    pub fn cleanup_stale_pending(&self) {
        let one_hour_ago = current_timestamp().saturating_sub(3600);
        self.pending.retain(|_, v| v.started_at > one_hour_ago);
    }
}

/// Shared verify flow type
pub type SharedVerifyFlow = Arc<VerifyFlow>;

pub fn create_shared_verify_flow(
    gateway: SharedRsiGateway,
    store: SharedVerificationStore,
) -> SharedVerifyFlow {
    Arc::new(VerifyFlow::new(gateway, store))
}

fn current_timestamp() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
