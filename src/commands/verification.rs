use poise::serenity_prelude as serenity;
use tracing::{error, info};

use crate::error::BotError;
use crate::platform::{snapshot_target_status, GuildSync};
use crate::storage::VerificationStore;
use crate::{Context, Error};

/// Link your RSI handle and verify your organization membership
///
/// Run `/verify <handle>` to receive a 4-digit token, place the token in
/// your RSI profile bio, then run `/verify` again to confirm.
#[poise::command(prefix_command, slash_command)]
pub async fn verify(
    ctx: Context<'_>,
    #[description = "Your RSI handle (leave empty to confirm a pending verification)"]
    handle: Option<String>,
) -> Result<(), Error> {
    let user_id = ctx.author().id;
    let verify_flow = &ctx.data().verify_flow;

    match handle {
        Some(handle) => {
            // Starting over replaces any pending attempt
            match verify_flow.begin(user_id, &handle).await {
                Ok(pending) => {
                    let embed = serenity::CreateEmbed::new()
                        .title("Verification Started")
                        .description(format!(
                            "Linking this Discord account to RSI handle **{}**.",
                            pending.handle
                        ))
                        .field("Your token", format!("`{}`", pending.token), false)
                        .field(
                            "Next steps",
                            "1. Open your RSI profile settings\n\
                             2. Add the token anywhere in your **Short Bio**\n\
                             3. Save, then run `/verify` here again",
                            false,
                        )
                        .color(0x5865F2);
                    ctx.send(poise::CreateReply::default().embed(embed).ephemeral(true))
                        .await?;
                    info!("Issued verification token to {} for '{}'", user_id, pending.handle);
                }
                Err(BotError::HandleConflict { handle, .. }) => {
                    ctx.send(
                        poise::CreateReply::default()
                            .content(format!(
                                "**Verification Failed**\n\nThe handle '{}' is already linked \
                                 to another Discord account. Contact an administrator if this \
                                 is your handle.",
                                handle
                            ))
                            .ephemeral(true),
                    )
                    .await?;
                }
                Err(e) => {
                    ctx.send(
                        poise::CreateReply::default()
                            .content(format!("**Verification Failed**\n\n{}", e))
                            .ephemeral(true),
                    )
                    .await?;
                }
            }
        }
        None => {
            if verify_flow.get_pending(user_id).is_none() {
                ctx.send(
                    poise::CreateReply::default()
                        .content(
                            "No verification in progress. Run `/verify <handle>` with your \
                             RSI handle to start.",
                        )
                        .ephemeral(true),
                )
                .await?;
                return Ok(());
            }

            let result = verify_flow.confirm(user_id).await;
            if let Some(snapshot) = result.snapshot.filter(|_| result.success) {
                ctx.send(
                    poise::CreateReply::default()
                        .content(format!(
                            "**Verification Successful!**\n\nWelcome, **{}**! Your membership \
                             status is **{}**. Your roles will be updated shortly.",
                            snapshot
                                .display_moniker
                                .as_deref()
                                .unwrap_or(&snapshot.handle),
                            snapshot_target_status(&snapshot, &ctx.data().config.rsi.target_org)
                        ))
                        .ephemeral(true),
                )
                .await?;

                // Apply roles and nickname everywhere the bot can see the user
                let sync_config = &ctx.data().config.guild_sync;
                if let Err(e) = ctx
                    .data()
                    .guild_sync
                    .apply(&snapshot, sync_config.batch_size, sync_config.max_concurrency)
                    .await
                {
                    error!("Failed to apply roles for {}: {}", user_id, e);
                }
            } else {
                let message = result.error.unwrap_or_else(|| "Unknown error".to_string());
                ctx.send(
                    poise::CreateReply::default()
                        .content(format!("**Not verified yet**\n\n{}", message))
                        .ephemeral(true),
                )
                .await?;
            }
        }
    }

    Ok(())
}

/// Show the stored verification status for you or another member
#[poise::command(slash_command)]
pub async fn orgstatus(
    ctx: Context<'_>,
    #[description = "Member to look up (defaults to you)"] user: Option<serenity::User>,
) -> Result<(), Error> {
    let target = user.as_ref().unwrap_or_else(|| ctx.author());

    let snapshot = ctx.data().store.load(target.id).await?;
    let Some(snapshot) = snapshot else {
        ctx.send(
            poise::CreateReply::default()
                .content(format!(
                    "No verification on record for **{}**. They can link an RSI handle \
                     with `/verify <handle>`.",
                    target.name
                ))
                .ephemeral(true),
        )
        .await?;
        return Ok(());
    };

    let target_org = &ctx.data().config.rsi.target_org;
    let affiliation = snapshot_target_status(&snapshot, target_org);

    let embed = serenity::CreateEmbed::new()
        .title(format!("Verification Status: {}", target.name))
        .field("RSI handle", &snapshot.handle, true)
        .field("Status", snapshot.status.to_string(), true)
        .field(
            format!("Standing with {}", target_org),
            affiliation.to_string(),
            true,
        )
        .field(
            "Main org",
            snapshot
                .main_orgs
                .first()
                .cloned()
                .unwrap_or_else(|| "none".to_string()),
            false,
        )
        .field(
            "Affiliates",
            if snapshot.affiliate_orgs.is_empty() {
                "none".to_string()
            } else {
                snapshot.affiliate_orgs.join(", ")
            },
            false,
        )
        .field(
            "Last checked",
            snapshot.checked_at.format("%Y-%m-%d %H:%M UTC").to_string(),
            false,
        )
        .color(0x3498db);

    ctx.send(poise::CreateReply::default().embed(embed).ephemeral(true))
        .await?;
    Ok(())
}
