// ============================================================================
// sgpt - Run the SGPT bot and inspect its user store
// ============================================================================
// Usage:
//   sgpt serve                              Run the Telegram bot
//   sgpt stats                              Show user store statistics
//   sgpt list-users [--blocked]             List stored users
//   sgpt export --format json               Export user records as JSON
// ============================================================================

mod telegram;

use anyhow::{anyhow, Result};
use chrono::{TimeZone, Utc};
use clap::{Parser, Subcommand};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::filter::Directive;
use tracing_subscriber::EnvFilter;

use sgpt_core::{BotConfig, RedbUserStore, SessionDispatcher, UserRecord, UserStore};
use telegram::TelegramBot;

/// SGPT bot and database inspection tool
#[derive(Parser)]
#[command(name = "sgpt", version, about = "Multi-tenant chat assistant with per-user memory")]
struct Cli {
    /// Path to the database file (default: ~/.sgpt/users.redb)
    #[arg(long, global = true)]
    db_path: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the bot with the Telegram transport
    Serve,

    /// Show user store statistics
    Stats,

    /// List stored users
    ListUsers {
        /// Only show blocked users
        #[arg(long)]
        blocked: bool,
    },

    /// Export user records as JSON (API keys are redacted)
    Export {
        /// Output format (currently only json is supported)
        #[arg(long, default_value = "json")]
        format: String,
    },
}

fn format_timestamp(ts: i64) -> String {
    Utc.timestamp_opt(ts, 0)
        .single()
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S UTC").to_string())
        .unwrap_or_else(|| format!("(invalid: {})", ts))
}

fn init_tracing() {
    let filter = EnvFilter::from_default_env();
    let filter = ["sgpt=debug", "sgpt_core=debug"]
        .into_iter()
        .filter_map(|directive| directive.parse::<Directive>().ok())
        .fold(filter, |filter, directive| filter.add_directive(directive));

    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file
    if let Err(e) = dotenvy::dotenv() {
        if !e.not_found() {
            eprintln!("Warning: Could not load .env file: {}", e);
        }
    }

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve => {
            init_tracing();
            cmd_serve(cli.db_path).await
        }
        Commands::Stats => cmd_stats(&RedbUserStore::open(cli.db_path.as_deref())?).await,
        Commands::ListUsers { blocked } => {
            cmd_list_users(&RedbUserStore::open(cli.db_path.as_deref())?, blocked).await
        }
        Commands::Export { format } => {
            cmd_export(&RedbUserStore::open(cli.db_path.as_deref())?, &format).await
        }
    }
}

async fn cmd_serve(db_path: Option<String>) -> Result<()> {
    let mut config = BotConfig::from_env()?;
    if db_path.is_some() {
        config.db_path = db_path;
    }

    let token = config
        .telegram_token
        .clone()
        .ok_or_else(|| anyhow!("TELEGRAM_BOT_TOKEN is not set"))?;
    if config.admin_id.is_none() {
        warn!("SGPT_ADMIN_ID is not set, administrator commands are disabled");
    }

    info!("Starting SGPT bot");
    let dispatcher = Arc::new(SessionDispatcher::from_config(&config)?);
    let bot = Arc::new(TelegramBot::new(&token, dispatcher)?);

    tokio::select! {
        result = bot.run() => result,
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down");
            Ok(())
        }
    }
}

async fn cmd_stats(store: &RedbUserStore) -> Result<()> {
    let stats = store.stats().await?;

    println!("=== SGPT User Store Stats ===");
    println!("Database: {}", store.path().display());
    println!();
    println!("Users:          {} total", stats.total_users);
    println!("  {:14} {}", "blocked", stats.blocked_users);
    println!("  {:14} {}", "administrators", stats.administrators);
    println!("Memorized:      {}", stats.memorized_items);
    println!("Turns stored:   {}", stats.conversation_turns);

    Ok(())
}

async fn cmd_list_users(store: &RedbUserStore, blocked_only: bool) -> Result<()> {
    let users: Vec<UserRecord> = store
        .list_all()
        .await?
        .into_iter()
        .filter(|user| !blocked_only || user.is_blocked)
        .collect();

    if users.is_empty() {
        println!("No users found.");
        return Ok(());
    }

    println!(
        "{:<14}  {:<16}  {:<8}  {:<22}  {}",
        "USER ID", "MODEL", "STATE", "LAST ACTIVE", "NAME"
    );
    println!("{}", "-".repeat(90));

    for user in &users {
        let state = if user.is_administrator {
            "admin"
        } else if user.is_blocked {
            "blocked"
        } else {
            "active"
        };
        let name = user.display_name().chars().take(30).collect::<String>();
        println!(
            "{:<14}  {:<16}  {:<8}  {:<22}  {}",
            user.id,
            user.model.to_string(),
            state,
            format_timestamp(user.last_activity),
            name
        );
    }

    println!("\nTotal: {} users", users.len());
    Ok(())
}

async fn cmd_export(store: &RedbUserStore, format: &str) -> Result<()> {
    if format != "json" {
        anyhow::bail!("Unsupported format '{}'. Only 'json' is supported.", format);
    }

    let stats = store.stats().await?;
    let users: Vec<UserRecord> = store
        .list_all()
        .await?
        .into_iter()
        .map(|mut user| {
            if user.has_credential() {
                user.api_key = "<redacted>".to_string();
            }
            user
        })
        .collect();

    let export = serde_json::json!({
        "exported_at": Utc::now().to_rfc3339(),
        "stats": stats,
        "users": users,
    });

    println!("{}", serde_json::to_string_pretty(&export)?);
    Ok(())
}
