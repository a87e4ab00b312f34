//! Collaborator contracts the pipeline consumes, plus their Discord-backed
//! default implementations.
//!
//! The pipeline itself (gateway, scheduler, bulk queue) only ever talks to
//! these traits, so tests run against hand-rolled mocks and the Discord
//! coupling stays in this module.

use async_trait::async_trait;
use futures::StreamExt;
use poise::serenity_prelude::{self as serenity, GuildId, Http, RoleId, UserId};
use std::sync::Arc;
use tracing::{debug, error, info};

use crate::bulk::JobSummary;
use crate::config::GuildSyncConfig;
use crate::error::{BotError, Result};
use crate::models::{MembershipStatus, VerificationSnapshot};
use crate::scrape::{self, org_page::ParsedOrgs};

/// Result of applying a snapshot to one guild
#[derive(Debug, Clone)]
pub struct SyncOutcome {
    pub guild_id: GuildId,
    pub changed: bool,
    pub detail: String,
}

/// Applies a verification snapshot to every guild the bot serves.
#[async_trait]
pub trait GuildSync: Send + Sync {
    async fn apply(
        &self,
        snapshot: &VerificationSnapshot,
        batch_size: usize,
        max_concurrency: usize,
    ) -> Result<Vec<SyncOutcome>>;
}

/// Invoked when a handle is reported not-found on the directory site.
#[async_trait]
pub trait Remediation: Send + Sync {
    async fn handle_missing(&self, user_id: UserId, handle: &str) -> Result<()>;
}

/// Delivers bulk-job results and progress back to the invoking admin.
#[async_trait]
pub trait Delivery: Send + Sync {
    /// Returns the name of the channel the summary was posted to.
    async fn post_summary(
        &self,
        guild_id: GuildId,
        invoker_id: UserId,
        scope_label: &str,
        summary: &JobSummary,
        export: Vec<u8>,
        filename: &str,
    ) -> Result<String>;

    async fn post_progress(
        &self,
        guild_id: GuildId,
        invoker_id: UserId,
        processed: usize,
        total: usize,
    ) -> Result<()>;

    async fn post_failure(
        &self,
        guild_id: GuildId,
        invoker_id: UserId,
        message: &str,
    ) -> Result<()>;
}

/// Guild/member lookups for the bulk queue.
#[async_trait]
pub trait MemberDirectory: Send + Sync {
    async fn resolve_guild(&self, guild_id: GuildId) -> Result<String>;

    async fn resolve_member(&self, guild_id: GuildId, user_id: UserId) -> Result<MemberProfile>;
}

/// The platform-side identity of one guild member
#[derive(Debug, Clone)]
pub struct MemberProfile {
    pub user_id: UserId,
    pub display_name: String,
}

/// Classify a stored snapshot against the configured target org.
pub fn snapshot_target_status(snapshot: &VerificationSnapshot, target_org: &str) -> MembershipStatus {
    let parsed = ParsedOrgs {
        main: snapshot.main_orgs.first().cloned(),
        affiliates: snapshot.affiliate_orgs.clone(),
    };
    scrape::resolve_status(&parsed, target_org)
}

/// serenity-backed role and nickname application
pub struct DiscordGuildSync {
    http: Arc<Http>,
    config: GuildSyncConfig,
    target_org: String,
}

impl DiscordGuildSync {
    pub fn new(http: Arc<Http>, config: GuildSyncConfig, target_org: String) -> Self {
        Self {
            http,
            config,
            target_org,
        }
    }

    async fn sync_guild(
        &self,
        guild_id: GuildId,
        snapshot: &VerificationSnapshot,
    ) -> SyncOutcome {
        let member = match guild_id.member(&self.http, snapshot.user_id).await {
            Ok(member) => member,
            Err(_) => {
                return SyncOutcome {
                    guild_id,
                    changed: false,
                    detail: "not a member".to_string(),
                };
            }
        };

        let status = snapshot_target_status(snapshot, &self.target_org);
        let desired_role = match status {
            MembershipStatus::Main => Some(self.config.main_role.as_str()),
            MembershipStatus::Affiliate => Some(self.config.affiliate_role.as_str()),
            MembershipStatus::NonMember => None,
        };

        let roles = match guild_id.roles(&self.http).await {
            Ok(roles) => roles,
            Err(e) => {
                return SyncOutcome {
                    guild_id,
                    changed: false,
                    detail: format!("failed to list roles: {}", e),
                };
            }
        };
        let find_role = |name: &str| -> Option<RoleId> {
            roles
                .iter()
                .find(|(_, role)| role.name == name)
                .map(|(id, _)| *id)
        };

        let mut changed = false;
        let mut details: Vec<String> = Vec::new();

        // Grant the role for the current status, drop the other one
        for (role_name, wanted) in [
            (
                self.config.main_role.as_str(),
                desired_role == Some(self.config.main_role.as_str()),
            ),
            (
                self.config.affiliate_role.as_str(),
                desired_role == Some(self.config.affiliate_role.as_str()),
            ),
        ] {
            let Some(role_id) = find_role(role_name) else {
                debug!("Role '{}' does not exist in guild {}", role_name, guild_id);
                continue;
            };
            let has_role = member.roles.contains(&role_id);
            let result = if wanted && !has_role {
                details.push(format!("+{}", role_name));
                member.add_role(&self.http, role_id).await
            } else if !wanted && has_role {
                details.push(format!("-{}", role_name));
                member.remove_role(&self.http, role_id).await
            } else {
                continue;
            };
            match result {
                Ok(()) => changed = true,
                Err(e) => {
                    error!(
                        "Failed to update role '{}' for {} in guild {}: {}",
                        role_name, snapshot.user_id, guild_id, e
                    );
                    details.push(format!("{}: {}", role_name, e));
                }
            }
        }

        // Nickname tracks the moniker, falling back to the handle
        let nickname = snapshot
            .display_moniker
            .as_deref()
            .unwrap_or(&snapshot.handle);
        if !nickname.is_empty() && member.nick.as_deref() != Some(nickname) {
            match member
                .clone()
                .edit(&self.http, serenity::EditMember::new().nickname(nickname))
                .await
            {
                Ok(_) => {
                    changed = true;
                    details.push(format!("nick={}", nickname));
                }
                Err(e) => {
                    // Commonly fails for the guild owner; not fatal
                    debug!(
                        "Failed to set nickname for {} in guild {}: {}",
                        snapshot.user_id, guild_id, e
                    );
                }
            }
        }

        SyncOutcome {
            guild_id,
            changed,
            detail: if details.is_empty() {
                "no changes".to_string()
            } else {
                details.join(", ")
            },
        }
    }
}

#[async_trait]
impl GuildSync for DiscordGuildSync {
    async fn apply(
        &self,
        snapshot: &VerificationSnapshot,
        batch_size: usize,
        max_concurrency: usize,
    ) -> Result<Vec<SyncOutcome>> {
        let guilds = self.http.get_guilds(None, None).await?;

        let mut outcomes = Vec::with_capacity(guilds.len());
        for batch in guilds.chunks(batch_size.max(1)) {
            let batch_futures: Vec<_> =
                batch.iter().map(|g| self.sync_guild(g.id, snapshot)).collect();
            let batch_outcomes: Vec<SyncOutcome> = futures::stream::iter(batch_futures)
                .buffered(max_concurrency.max(1))
                .collect()
                .await;
            outcomes.extend(batch_outcomes);
        }

        Ok(outcomes)
    }
}

/// DMs a user whose handle disappeared from the directory site.
pub struct DmRemediation {
    http: Arc<Http>,
}

impl DmRemediation {
    pub fn new(http: Arc<Http>) -> Self {
        Self { http }
    }
}

#[async_trait]
impl Remediation for DmRemediation {
    async fn handle_missing(&self, user_id: UserId, handle: &str) -> Result<()> {
        info!("Handle '{}' no longer exists, notifying {}", handle, user_id);
        let channel = user_id.create_dm_channel(&self.http).await?;
        channel
            .send_message(
                &self.http,
                serenity::CreateMessage::new().content(format!(
                    "Your RSI handle **{}** could no longer be found on the directory site. \
                     If you renamed your account, please run `/verify <new-handle>` to re-link it.",
                    handle
                )),
            )
            .await?;
        Ok(())
    }
}

/// DMs bulk-job results to the invoking admin.
pub struct DiscordDelivery {
    http: Arc<Http>,
}

impl DiscordDelivery {
    pub fn new(http: Arc<Http>) -> Self {
        Self { http }
    }
}

#[async_trait]
impl Delivery for DiscordDelivery {
    async fn post_summary(
        &self,
        _guild_id: GuildId,
        invoker_id: UserId,
        scope_label: &str,
        summary: &JobSummary,
        export: Vec<u8>,
        filename: &str,
    ) -> Result<String> {
        let channel = invoker_id.create_dm_channel(&self.http).await?;

        let embed = serenity::CreateEmbed::new()
            .title("Bulk Verification Complete")
            .description(format!("Scope: {}", scope_label))
            .field("Main members", summary.main.to_string(), true)
            .field("Affiliates", summary.affiliate.to_string(), true)
            .field("Non-members", summary.non_member.to_string(), true)
            .field("Unknown", summary.unknown.to_string(), true)
            .field("Errors", summary.errors.to_string(), true)
            .field("Processed", summary.total.to_string(), true)
            .color(0x2ecc71);

        channel
            .id
            .send_files(
                &self.http,
                vec![serenity::CreateAttachment::bytes(export, filename)],
                serenity::CreateMessage::new().embed(embed),
            )
            .await?;

        Ok(channel.name())
    }

    async fn post_progress(
        &self,
        _guild_id: GuildId,
        invoker_id: UserId,
        processed: usize,
        total: usize,
    ) -> Result<()> {
        let channel = invoker_id.create_dm_channel(&self.http).await?;
        channel
            .send_message(
                &self.http,
                serenity::CreateMessage::new()
                    .content(format!("Bulk verification progress: {}/{}", processed, total)),
            )
            .await?;
        Ok(())
    }

    async fn post_failure(
        &self,
        _guild_id: GuildId,
        invoker_id: UserId,
        message: &str,
    ) -> Result<()> {
        let channel = invoker_id.create_dm_channel(&self.http).await?;
        channel
            .send_message(
                &self.http,
                serenity::CreateMessage::new()
                    .content(format!("Bulk verification failed: {}", message)),
            )
            .await?;
        Ok(())
    }
}

/// serenity-backed guild/member lookups
pub struct HttpMemberDirectory {
    http: Arc<Http>,
}

impl HttpMemberDirectory {
    pub fn new(http: Arc<Http>) -> Self {
        Self { http }
    }
}

#[async_trait]
impl MemberDirectory for HttpMemberDirectory {
    async fn resolve_guild(&self, guild_id: GuildId) -> Result<String> {
        let guild = self
            .http
            .get_guild(guild_id)
            .await
            .map_err(|_| BotError::GuildNotFound {
                id: guild_id.to_string(),
            })?;
        Ok(guild.name)
    }

    async fn resolve_member(&self, guild_id: GuildId, user_id: UserId) -> Result<MemberProfile> {
        let member = guild_id.member(&self.http, user_id).await?;
        let display_name = member
            .nick
            .clone()
            .or_else(|| member.user.global_name.clone())
            .unwrap_or_else(|| member.user.name.clone());
        Ok(MemberProfile {
            user_id,
            display_name,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot_with(main: &[&str], affiliates: &[&str]) -> VerificationSnapshot {
        VerificationSnapshot::new(
            UserId::new(1),
            "Foo".to_string(),
            main.iter().map(|s| s.to_string()).collect(),
            affiliates.iter().map(|s| s.to_string()).collect(),
            None,
        )
    }

    #[test]
    fn test_snapshot_target_status() {
        let snapshot = snapshot_with(&["test squadron"], &["other org"]);
        assert_eq!(
            snapshot_target_status(&snapshot, "TEST Squadron"),
            MembershipStatus::Main
        );
        assert_eq!(
            snapshot_target_status(&snapshot, "Other Org"),
            MembershipStatus::Affiliate
        );
        assert_eq!(
            snapshot_target_status(&snapshot, "Third Org"),
            MembershipStatus::NonMember
        );
    }
}
