pub mod json_store;

pub use json_store::JsonFileStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use poise::serenity_prelude::UserId;
use std::sync::Arc;

use crate::error::Result;
use crate::models::VerificationSnapshot;

/// Durable storage contract for verification snapshots and the scheduler's
/// per-user retry bookkeeping.
///
/// `store` overwrites the snapshot part of a record wholesale; the retry
/// schedule (`fail_count`, `next_retry_at`) belongs to the scheduler and is
/// only mutated through `schedule_recheck`.
#[async_trait]
pub trait VerificationStore: Send + Sync {
    /// Persist a snapshot. Rejects with [`crate::error::BotError::HandleConflict`]
    /// when the handle is already owned by a different user, leaving the
    /// existing record unchanged.
    async fn store(&self, snapshot: &VerificationSnapshot) -> Result<()>;

    /// Load the stored snapshot for a user. The returned status is
    /// re-derived from the stored org lists, never read back directly.
    async fn load(&self, user_id: UserId) -> Result<Option<VerificationSnapshot>>;

    /// Users whose next-retry time has passed (or was never set), oldest
    /// first, at most `limit`.
    async fn get_due_users(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<UserId>>;

    /// Consecutive-failure count for a user; 0 when unknown.
    async fn get_fail_count(&self, user_id: UserId) -> Result<u32>;

    /// Record the retry schedule for a user.
    async fn schedule_recheck(
        &self,
        user_id: UserId,
        fail_count: u32,
        next_retry_at: DateTime<Utc>,
    ) -> Result<()>;

    /// Who currently owns `handle`, if it is a user other than `user_id`.
    async fn check_handle_conflict(&self, handle: &str, user_id: UserId)
        -> Result<Option<UserId>>;
}

/// Shared store type
pub type SharedVerificationStore = Arc<dyn VerificationStore>;
