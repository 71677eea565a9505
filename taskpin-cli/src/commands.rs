//! CLI subcommand handlers.

use crate::AuthAction;
use crate::Commands;
use crate::ConfigAction;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use taskpin_core::config::{AppConfig, ConfigOverrides, load_config};
use taskpin_core::credentials::{CredentialStore, KeyringCredentialStore, oauth_client_for};
use taskpin_core::oauth::{self, CallbackSlot, TASKS_CREDENTIAL_KEY};
use taskpin_core::{AppContext, SyncOutcome, health};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Handle a CLI subcommand.
pub async fn handle_command(
    command: Commands,
    workspace: &Path,
    explicit: Option<&Path>,
    overrides: &ConfigOverrides,
) -> anyhow::Result<()> {
    match command {
        Commands::Config { action } => handle_config(action, workspace, explicit, overrides),
        Commands::Auth { action } => {
            let config = load(workspace, explicit, overrides)?;
            handle_auth(action, &config).await
        }
        Commands::Run => {
            let ctx = AppContext::from_config(load(workspace, explicit, overrides)?)?;
            run(ctx).await
        }
        Commands::SyncOnce => {
            let ctx = AppContext::from_config(load(workspace, explicit, overrides)?)?;
            let outcome = sync_once(&ctx).await?;
            println!("{}", outcome);
            Ok(())
        }
        Commands::Ask { utterance } => {
            let ctx = AppContext::from_config(load(workspace, explicit, overrides)?)?;
            println!("{}", ask(&ctx, &utterance).await?);
            Ok(())
        }
    }
}

fn load(
    workspace: &Path,
    explicit: Option<&Path>,
    overrides: &ConfigOverrides,
) -> anyhow::Result<AppConfig> {
    load_config(Some(workspace), explicit, overrides)
        .map_err(|e| anyhow::anyhow!("Configuration error: {}", e))
}

fn handle_config(
    action: ConfigAction,
    workspace: &Path,
    explicit: Option<&Path>,
    overrides: &ConfigOverrides,
) -> anyhow::Result<()> {
    match action {
        ConfigAction::Init => {
            let config_path = workspace.join(".taskpin").join("config.toml");
            if config_path.exists() {
                println!(
                    "Configuration file already exists at: {}",
                    config_path.display()
                );
                return Ok(());
            }
            taskpin_core::config::write_default_config(&config_path)?;
            println!(
                "Created default configuration at: {}",
                config_path.display()
            );
            Ok(())
        }
        ConfigAction::Show => {
            let config = load(workspace, explicit, overrides)?;
            println!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

async fn handle_auth(action: AuthAction, config: &AppConfig) -> anyhow::Result<()> {
    let store = KeyringCredentialStore::new();
    let source = &config.tasks.credentials;

    match action {
        AuthAction::Status => {
            println!("Task-list credentials: {}", source.kind());
            if store.has_secret(TASKS_CREDENTIAL_KEY) {
                println!("  Stored refresh token: yes");
            } else {
                println!("  Stored refresh token: no");
            }
            Ok(())
        }
        AuthAction::Login { timeout } => {
            let client = oauth_client_for(source)?.ok_or_else(|| {
                anyhow::anyhow!(
                    "Credential source '{}' does not use a browser login",
                    source.kind()
                )
            })?;

            let slot = Arc::new(CallbackSlot::new());
            let cancel = CancellationToken::new();
            let addr = config.health.addr()?;
            let server = tokio::spawn(health::serve(addr, slot.clone(), cancel.clone()));

            println!("Waiting for the browser login (redirect to {})...", client.redirect_uri);
            let result = oauth::login(&client, &slot, &store, Duration::from_secs(timeout)).await;
            cancel.cancel();
            if let Ok(Err(e)) = server.await {
                warn!(error = %e, "Callback server stopped with an error");
            }

            result.map_err(|e| anyhow::anyhow!("Login failed: {}", e))?;
            println!("Logged in. Refresh token stored in the OS keyring.");
            Ok(())
        }
        AuthAction::Logout => {
            if store.has_secret(TASKS_CREDENTIAL_KEY) {
                store
                    .delete_secret(TASKS_CREDENTIAL_KEY)
                    .map_err(|e| anyhow::anyhow!("Failed to delete refresh token: {}", e))?;
                println!("Refresh token removed.");
            } else {
                println!("No refresh token stored.");
            }
            Ok(())
        }
    }
}

/// One locate-and-sync cycle against the configured channel.
async fn sync_once(ctx: &AppContext) -> anyhow::Result<SyncOutcome> {
    let channel_id = ctx.resolve_channel_id().await?;
    let dashboard = ctx.dashboard(&channel_id);
    if let Some(id) = dashboard.locate().await? {
        info!(message_id = %id, "Found existing dashboard");
    }
    Ok(dashboard.tick().await)
}

/// One dispatch turn; the reply is returned even when the turn failed.
async fn ask(ctx: &AppContext, utterance: &str) -> anyhow::Result<String> {
    let tools = Arc::new(taskpin_tools::task_registry(ctx)?);
    let outcome = ctx.dispatcher(tools).respond(utterance).await;
    if let Some(e) = &outcome.error {
        warn!(class = %e.class(), error = %e, "Turn ended with an error");
    }
    Ok(outcome.reply)
}

/// Run until Ctrl-C: health server, dashboard timer, and inbound handler.
async fn run(ctx: AppContext) -> anyhow::Result<()> {
    let channel_id = ctx.resolve_channel_id().await?;
    let tools = Arc::new(taskpin_tools::task_registry(&ctx)?);
    let dispatcher = Arc::new(ctx.dispatcher(tools));
    let dashboard = Arc::new(ctx.dashboard(&channel_id));
    let bridge = Arc::new(ctx.bridge(&channel_id, dispatcher));
    let interval = Duration::from_secs(ctx.config.sync.interval_secs);
    let addr = ctx.config.health.addr()?;

    let cancel = CancellationToken::new();
    let health = {
        let slot = ctx.callback.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(e) = health::serve(addr, slot, cancel).await {
                error!(%addr, error = %e, "Health server failed");
            }
        })
    };
    let sync = tokio::spawn(dashboard.run(interval, cancel.clone()));
    let inbound = tokio::spawn(bridge.run(cancel.clone()));

    println!("Taskpin running on channel {}. Press Ctrl-C to stop.", channel_id);
    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    cancel.cancel();

    let _ = tokio::join!(health, sync, inbound);
    Ok(())
}
