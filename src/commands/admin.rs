use poise::serenity_prelude as serenity;
use tracing::info;

use crate::bulk::BulkJobRequest;
use crate::{Context, Error};

/// Re-verify many members at once
///
/// Targets either an explicit list of mentions/IDs or every guild member.
/// Results are delivered by DM when the job finishes.
#[poise::command(
    slash_command,
    guild_only,
    default_member_permissions = "ADMINISTRATOR"
)]
pub async fn bulkverify(
    ctx: Context<'_>,
    #[description = "Mentions or user IDs, space/comma separated (empty = whole guild)"]
    targets: Option<String>,
    #[description = "Also re-fetch live RSI data instead of only stored status"]
    recheck_rsi: Option<bool>,
) -> Result<(), Error> {
    let Some(guild_id) = ctx.guild_id() else {
        ctx.say("This command only works in a guild.").await?;
        return Ok(());
    };
    let recheck_rsi = recheck_rsi.unwrap_or(false);

    let (target_user_ids, scope_label) = match targets.as_deref().map(str::trim) {
        Some(raw) if !raw.is_empty() => {
            let ids = parse_user_ids(raw);
            if ids.is_empty() {
                ctx.send(
                    poise::CreateReply::default()
                        .content("Could not parse any user mentions or IDs from the input.")
                        .ephemeral(true),
                )
                .await?;
                return Ok(());
            }
            let label = format!("explicit list ({} users)", ids.len());
            (ids, label)
        }
        _ => {
            // One page of members; large guilds should pass explicit lists
            let members = guild_id.members(ctx.http(), Some(1000), None).await?;
            let ids: Vec<serenity::UserId> = members
                .iter()
                .filter(|m| !m.user.bot)
                .map(|m| m.user.id)
                .collect();
            let label = format!("all guild members ({} users)", ids.len());
            (ids, label)
        }
    };

    let was_busy = ctx.data().bulk_queue.is_running();
    let job_id = ctx.data().bulk_queue.enqueue(BulkJobRequest {
        guild_id,
        target_user_ids,
        invoker_id: ctx.author().id,
        scope_label: scope_label.clone(),
        recheck_rsi,
    })?;

    info!(
        "Bulk verification job #{} queued by {} ({})",
        job_id,
        ctx.author().name,
        scope_label
    );

    let mut content = format!(
        "**Bulk verification queued** (job #{})\n\nScope: {}\nLive RSI recheck: {}\n\
         You will receive the results by DM when the job completes.",
        job_id,
        scope_label,
        if recheck_rsi { "yes" } else { "no" }
    );
    if was_busy {
        content.push_str("\n\nAnother job is currently running; yours will start after it.");
    }
    ctx.send(poise::CreateReply::default().content(content).ephemeral(true))
        .await?;

    Ok(())
}

/// Extract user IDs from a string of mentions (`<@123>`, `<@!123>`) and
/// bare snowflakes, in input order.
fn parse_user_ids(raw: &str) -> Vec<serenity::UserId> {
    raw.split(|c: char| c.is_whitespace() || c == ',')
        .filter_map(|token| {
            let token = token
                .trim()
                .trim_start_matches("<@!")
                .trim_start_matches("<@")
                .trim_end_matches('>');
            token.parse::<u64>().ok().filter(|n| *n != 0)
        })
        .map(serenity::UserId::new)
        .collect()
}
