use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;
use wg_meter::metering::report;
use wg_meter::{Config, MeterContext};

/// Per-peer WireGuard traffic metering and monthly quota enforcement.
#[derive(Parser, Debug)]
#[command(name = "wg-meter", version, about)]
struct Cli {
    /// Path to the TOML config file.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the metering and monthly-reset schedule until interrupted.
    Run,
    /// Take one snapshot now and enforce quotas.
    Snapshot,
    /// Show month-to-date usage per user.
    Usage {
        /// Only show this user.
        #[arg(long)]
        user: Option<String>,
        /// Print JSON instead of a table.
        #[arg(long)]
        json: bool,
    },
    /// Show per-day traffic for the last N days.
    History {
        #[arg(long, default_value_t = 7)]
        days: u32,
    },
    /// List users whose peer is currently removed from the interface.
    Blocked,
    /// Remove a user's peer from the live interface.
    Block { user: String },
    /// Re-admit every configured peer (lifts all current blocks).
    UnblockAll,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("wg_meter=info")),
        )
        .init();

    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref()).context("loading configuration")?;
    let ctx = Arc::new(MeterContext::from_config(config).context("opening metering store")?);

    let result = dispatch(&ctx, cli.command).await;
    ctx.shutdown();
    result
}

async fn dispatch(ctx: &Arc<MeterContext>, command: Command) -> Result<()> {
    let today = Utc::now().date_naive();
    match command {
        Command::Run => {
            wg_meter::scheduler::run_scheduler(ctx.clone(), shutdown_signal()).await;
        }
        Command::Snapshot => {
            let outcome = ctx.run_metering_cycle(today).await?;
            for event in &outcome.enforcement.events {
                println!(
                    "{} {}: {} / {} ({}%)",
                    event.action,
                    event.user,
                    report::format_bytes(event.usage),
                    report::format_bytes(event.limit),
                    event.pct
                );
            }
            for (peer, error) in &outcome.enforcement.gate_failures {
                eprintln!("block of {peer} failed: {error}");
            }
        }
        Command::Usage { user, json } => {
            let mut peers = ctx.identities().peers()?;
            if let Some(user) = user {
                peers = vec![ctx.identities().find_user(&user)?];
            }
            let usages = ctx.reader()?.monthly_usage(&peers, today)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&usages)?);
            } else {
                print!(
                    "{}",
                    report::format_usage_report(&usages, ctx.config().quota.limit_bytes)
                );
            }
        }
        Command::History { days } => {
            let peers = ctx.identities().peers()?;
            let history = ctx.reader()?.traffic_history(&peers, today, days)?;
            let text = report::format_history(&history);
            if text.is_empty() {
                println!("No traffic recorded in the last {days} days");
            } else {
                print!("{text}");
            }
        }
        Command::Blocked => {
            let blocked = ctx.blocked_peers().await?;
            if blocked.is_empty() {
                println!("no blocked users");
            }
            for identity in blocked {
                println!("{}\t{}", identity.user, identity.key);
            }
        }
        Command::Block { user } => {
            let identity = ctx.block_user(&user).await?;
            println!("blocked {} ({})", identity.user, identity.key);
        }
        Command::UnblockAll => {
            ctx.unblock_all().await?;
            println!("all configured peers re-admitted");
        }
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("failed to listen for ctrl-c: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("failed to listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
