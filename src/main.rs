use anyhow::Result;
use clap::Parser;
use dotenv::dotenv;
use poise::serenity_prelude as serenity;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// Discord bot verifying RSI organization membership
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Force re-sync of slash commands to all guilds (use when commands aren't showing up)
    #[arg(long, short = 's')]
    sync_commands: bool,

    /// Register commands per-guild instead of globally (faster for testing)
    #[arg(long)]
    guild_commands: bool,

    /// Specific guild ID to sync commands to (for testing)
    #[arg(long)]
    guild_id: Option<u64>,
}

mod bulk;
mod commands;
mod config;
mod coordinator;
mod error;
mod logging;
mod models;
mod platform;
mod rsi;
mod scheduler;
mod scrape;
mod storage;
mod verify;

use bulk::{create_bulk_queue, BulkVerificationQueue};
use commands::{bulkverify, help, orgstatus, ping, verify};
use config::BotConfig;
use coordinator::RecheckCoordinator;
use platform::{
    DiscordDelivery, DiscordGuildSync, DmRemediation, GuildSync, HttpMemberDirectory,
};
use rsi::{create_shared_gateway, HttpFetcher};
use scheduler::AutoRecheckScheduler;
use storage::{JsonFileStore, SharedVerificationStore};
use verify::{create_shared_verify_flow, SharedVerifyFlow};

type Error = Box<dyn std::error::Error + Send + Sync>;
type Context<'a> = poise::Context<'a, Data, Error>;

/// Shared application state
pub struct Data {
    pub config: BotConfig,
    pub store: SharedVerificationStore,
    pub verify_flow: SharedVerifyFlow,
    pub guild_sync: Arc<dyn GuildSync>,
    pub bulk_queue: Arc<BulkVerificationQueue>,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    let args = Args::parse();

    logging::init();

    let token = std::env::var("DISCORD_TOKEN")
        .map_err(|_| anyhow::anyhow!("Missing DISCORD_TOKEN environment variable"))?;

    let config_path = std::env::var("CONFIG_PATH").unwrap_or_else(|_| "config.json".to_string());
    let state_path = std::env::var("STATE_PATH").unwrap_or_else(|_| "state".to_string());

    // Ensure state directory exists
    tokio::fs::create_dir_all(&state_path).await.ok();

    info!("Loading configuration from {}...", config_path);
    let config = BotConfig::load(&config_path).await?;

    info!("Loading verification database...");
    let db_path = format!("{}/verifications.json", state_path);
    let store: SharedVerificationStore = Arc::new(JsonFileStore::load(&db_path).await?);

    let fetcher = Arc::new(HttpFetcher::new()?);
    let gateway = create_shared_gateway(fetcher, &config.rsi);
    let verify_flow = create_shared_verify_flow(gateway.clone(), store.clone());
    let coordinator = RecheckCoordinator::new();

    // Extract CLI flags for use in setup
    let sync_commands = args.sync_commands;
    let guild_commands = args.guild_commands;
    let target_guild_id = args.guild_id;

    if sync_commands {
        info!("--sync-commands: Will force re-register slash commands");
    }
    if guild_commands {
        info!("--guild-commands: Will register commands per-guild (faster for testing)");
    } else {
        info!("Registering commands globally by default (takes up to 1 hour to propagate)");
    }
    if let Some(gid) = target_guild_id {
        info!("--guild-id: Targeting specific guild {}", gid);
    }

    // Build framework
    let framework = poise::Framework::builder()
        .options(poise::FrameworkOptions {
            commands: vec![ping(), help(), verify(), orgstatus(), bulkverify()],
            pre_command: |ctx| {
                Box::pin(async move {
                    info!(
                        "Command '{}' invoked by {} (ID: {}) in {}",
                        ctx.command().qualified_name,
                        ctx.author().name,
                        ctx.author().id,
                        ctx.guild_id()
                            .map(|g| g.to_string())
                            .unwrap_or_else(|| "DM".to_string())
                    );
                })
            },
            on_error: |error| {
                Box::pin(async move {
                    match error {
                        poise::FrameworkError::Command { error, ctx, .. } => {
                            error!(
                                "Error in command '{}': {}",
                                ctx.command().qualified_name,
                                error
                            );
                            let _ = ctx.say(format!("An error occurred: {}", error)).await;
                        }
                        poise::FrameworkError::ArgumentParse {
                            error, input, ctx, ..
                        } => {
                            error!(
                                "Argument parse error in '{}': {} (input: {:?})",
                                ctx.command().qualified_name,
                                error,
                                input
                            );
                        }
                        poise::FrameworkError::MissingUserPermissions {
                            missing_permissions,
                            ctx,
                            ..
                        } => {
                            error!(
                                "User {} missing permissions for '{}': {:?}",
                                ctx.author().name,
                                ctx.command().qualified_name,
                                missing_permissions
                            );
                        }
                        poise::FrameworkError::GuildOnly { ctx, .. } => {
                            error!(
                                "Command '{}' is guild-only, used in DM by {}",
                                ctx.command().qualified_name,
                                ctx.author().name
                            );
                        }
                        other => {
                            error!("Other framework error: {}", other);
                        }
                    }
                })
            },
            ..Default::default()
        })
        .setup(move |ctx, ready, framework| {
            let config = config.clone();
            let store = store.clone();
            let gateway = gateway.clone();
            let verify_flow = verify_flow.clone();
            let coordinator = coordinator.clone();

            Box::pin(async move {
                info!("Bot logged in as: {}", ready.user.name);

                // Determine which guilds to register commands for
                let guilds_to_register: Vec<serenity::GuildId> = if let Some(gid) = target_guild_id
                {
                    vec![serenity::GuildId::new(gid)]
                } else {
                    ready.guilds.iter().map(|g| g.id).collect()
                };

                if guild_commands || sync_commands {
                    for guild_id in &guilds_to_register {
                        info!("Registering commands to guild: {}", guild_id);
                        if let Err(e) = poise::builtins::register_in_guild(
                            ctx,
                            &framework.options().commands,
                            *guild_id,
                        )
                        .await
                        {
                            error!("Failed to register commands for guild {}: {}", guild_id, e);
                        }
                    }
                } else {
                    info!("Registering commands globally...");
                    if let Err(e) =
                        poise::builtins::register_globally(ctx, &framework.options().commands).await
                    {
                        error!("Failed to register commands globally: {}", e);
                    }
                }

                // Discord-backed collaborators, now that the HTTP client
                // is available
                let http = ctx.http.clone();
                let guild_sync: Arc<dyn GuildSync> = Arc::new(DiscordGuildSync::new(
                    http.clone(),
                    config.guild_sync.clone(),
                    config.rsi.target_org.clone(),
                ));
                let remediation = Arc::new(DmRemediation::new(http.clone()));
                let delivery = Arc::new(DiscordDelivery::new(http.clone()));
                let directory = Arc::new(HttpMemberDirectory::new(http.clone()));

                let (bulk_queue, _bulk_worker) = create_bulk_queue(
                    gateway.clone(),
                    store.clone(),
                    directory,
                    delivery,
                    coordinator.clone(),
                    config.bulk.clone(),
                );

                if config.auto_recheck.enabled {
                    info!(
                        "Auto-recheck enabled: every {} minutes, up to {} users per run",
                        config.auto_recheck.batch.run_every_minutes,
                        config.auto_recheck.batch.max_users_per_run
                    );
                    let auto_scheduler = Arc::new(AutoRecheckScheduler::new(
                        gateway.clone(),
                        store.clone(),
                        guild_sync.clone(),
                        remediation,
                        coordinator.clone(),
                        config.auto_recheck.clone(),
                        config.guild_sync.clone(),
                    ));
                    auto_scheduler.spawn();
                } else {
                    info!("Auto-recheck disabled by config");
                }

                // Periodically drop abandoned verification attempts
                let cleanup_flow = verify_flow.clone();
                tokio::spawn(async move {
                    let mut interval = tokio::time::interval(Duration::from_secs(900));
                    loop {
                        interval.tick().await;
                        cleanup_flow.cleanup_stale_pending();
                    }
                });

                Ok(Data {
                    config,
                    store,
                    verify_flow,
                    guild_sync,
                    bulk_queue,
                })
            })
        })
        .build();

    let intents = serenity::GatewayIntents::non_privileged() | serenity::GatewayIntents::GUILD_MEMBERS;

    let mut client = serenity::ClientBuilder::new(token, intents)
        .framework(framework)
        .await?;

    info!("Starting bot...");
    if let Err(e) = client.start().await {
        let err_str = e.to_string();
        if err_str.contains("Disallowed") || err_str.contains("intents") {
            error!("Failed to start bot: {}", e);
            error!(
                "The GUILD_MEMBERS privileged intent must be enabled in the Discord Developer \
                 Portal (Your App -> Bot -> Privileged Gateway Intents)"
            );
            return Err(anyhow::anyhow!(
                "Disallowed gateway intents. Enable GUILD_MEMBERS in the Discord Developer Portal"
            ));
        }
        return Err(e.into());
    }
    warn!("Bot ended.");

    Ok(())
}
