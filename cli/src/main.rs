// orgrelay: relay daemon for the org peer-to-peer overlay
//
// Startup is strictly sequential:
// identity → overlay node → announced address → HTTP gateway.
// Any failure before the gateway is up stops the process.

mod bootstrap;
mod config;
mod gateway;

use anyhow::{Context, Result};
use clap::Parser;
use colored::*;
use config::{Cli, RelayConfig};
use gateway::GatewayContext;
use orgrelay_core::{
    observe, resolve_identity, start_node, AddressAnnouncer, AdmissionQueue, LoggingObserver,
    OverlayOptions, ResolvedIdentity,
};
use std::sync::Arc;
use std::time::Instant;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    load_dotenv()?;
    let cli = Cli::parse();
    let _log_guard = init_logging(cli.log_json);

    let config = cli
        .into_config(bootstrap::default_bootstrap_nodes())
        .context("Invalid configuration")?;

    run(config).await
}

/// Pull `.env` from the working directory into the environment so the clap
/// env fallbacks see it. Variables already set are left alone.
fn load_dotenv() -> Result<()> {
    match dotenvy::dotenv() {
        Ok(_) => Ok(()),
        Err(e) if e.not_found() => Ok(()),
        Err(e) => Err(e).context("Failed to read .env"),
    }
}

fn init_logging(json: bool) -> WorkerGuard {
    let (writer, guard) = tracing_appender::non_blocking(std::io::stdout());
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
    guard
}

async fn run(config: RelayConfig) -> Result<()> {
    println!("{}", "org relay: starting...".bold());
    println!();

    let resolved = resolve_identity(&config.identity_path).with_context(|| {
        format!(
            "Failed to load identity from {}",
            config.identity_path.display()
        )
    })?;
    match &resolved {
        ResolvedIdentity::Loaded(_) => println!("  {} Identity loaded", "✓".green()),
        ResolvedIdentity::Created(_) => println!(
            "  {} Identity created at {}",
            "✓".green(),
            config.identity_path.display()
        ),
    }
    let identity = resolved.into_identity();
    println!(
        "  Peer ID: {}",
        identity.peer_id().to_string().bright_cyan()
    );

    let addresses = config.node_addresses()?;
    let (event_tx, event_rx) = tokio::sync::mpsc::channel(256);
    let (node, report) = start_node(
        &identity,
        addresses,
        config.bootstrap_nodes.as_slice(),
        OverlayOptions::default(),
        event_tx,
    )
    .await
    .context("Failed to start overlay node")?;
    println!("  {} Overlay node started", "✓".green());

    if report.attempted == 0 {
        println!("  {} No bootstrap nodes configured", "•".dimmed());
    } else if report.is_degraded() {
        println!(
            "  {} {} of {} bootstrap entries unusable",
            "!".bright_yellow(),
            report.failures.len(),
            report.attempted
        );
    }

    let announcer = AddressAnnouncer::new(config.address_selection);
    let announced = announcer.capture(&node.multiaddrs()).unwrap_or_default();
    println!("  {} Announcing {}", "✓".green(), announced.bright_cyan());

    let _observer = observe(event_rx, Arc::new(LoggingObserver));

    let ctx = Arc::new(GatewayContext {
        node: node.clone(),
        announcer,
        queue: AdmissionQueue::new(config.admission.clone()),
        public_dir: config.public_dir.clone(),
        env_dir: std::env::current_dir().context("Failed to resolve working directory")?,
        started_at: Instant::now(),
    });
    let api = gateway::routes(ctx, &config.cors_origins);

    println!(
        "  {} HTTP gateway on {}",
        "✓".green(),
        format!("http://localhost:{}", config.http_port).bright_green()
    );
    println!();
    tracing::info!(pid = std::process::id(), port = config.http_port, "Relay listening");

    tokio::select! {
        _ = warp::serve(api).run(([0, 0, 0, 0], config.http_port)) => {}
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Interrupted, shutting down");
        }
    }

    if let Err(e) = node.shutdown().await {
        tracing::debug!("Overlay node already stopped: {}", e);
    }
    Ok(())
}
