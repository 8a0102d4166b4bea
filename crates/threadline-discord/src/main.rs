//! Standalone bridge: Discord gateway on one side, JSON Lines on stdio on the other.

mod stdio;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::Parser;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use threadline::inbound::InboundPipeline;
use threadline::{Bridge, Config, ContextStore, Supervisor, SupervisorConfig};
use threadline_discord::DiscordGatewayFactory;

use crate::stdio::{StdoutPublisher, run_outbound_reader, stdin_reader};

/// Threadline Discord bridge.
#[derive(Parser, Debug)]
#[command(name = "threadline-discord", version, about)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Stdout carries bus traffic, logs go to stderr.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let mut config = Config::load(&cli.config)
        .await
        .with_context(|| format!("failed to load config from {}", cli.config.display()))?;
    if let Ok(token) = std::env::var("DISCORD_TOKEN") {
        config.discord.token = token;
    }
    if config.discord.token.trim().is_empty() {
        bail!("no Discord token configured (set discord.token or DISCORD_TOKEN)");
    }

    let shutdown = CancellationToken::new();
    let store = Arc::new(ContextStore::with_capacity(config.chat.context_capacity));
    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();

    let factory = Arc::new(DiscordGatewayFactory::new(&config.discord));
    let supervisor = Supervisor::new(
        SupervisorConfig::from(&config.discord.retry),
        factory,
        inbound_tx,
    );

    let pipeline = InboundPipeline::new(&config, store.clone(), Arc::new(StdoutPublisher::default()));
    let pipeline_task = tokio::spawn(pipeline.run(inbound_rx, shutdown.clone()));

    let bridge = Arc::new(Bridge::new(&config, supervisor.clone(), store));

    info!(config = %cli.config.display(), "Starting threadline-discord");
    tokio::select! {
        result = supervisor.start() => {
            if let Err(e) = result {
                supervisor.shutdown().await;
                return Err(e).context("failed to connect to Discord");
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted before the first connection");
            supervisor.shutdown().await;
            return Ok(());
        }
    }

    let reader_task = tokio::spawn(run_outbound_reader(bridge, stdin_reader(), shutdown.clone()));
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Received Ctrl-C, shutting down"),
        fatal = supervisor.wait_fatal() => {
            if let Some(e) = fatal {
                error!(error = %e, hint = e.kind.hint(), "Connection failed permanently");
            }
        }
    }

    shutdown.cancel();
    supervisor.shutdown().await;
    for (name, task) in [("inbound pipeline", pipeline_task), ("outbound reader", reader_task)] {
        if let Err(e) = task.await {
            warn!(task = name, error = %e, "Task ended abnormally");
        }
    }
    info!("Shutdown complete");
    // A pending stdin read would otherwise hold the runtime open until EOF.
    std::process::exit(0)
}
