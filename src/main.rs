//! Bridge agent binary
//!
//! Resolves settings (file or interactive pairing), then runs the relay
//! pipeline until a shutdown signal arrives.

use std::io::Write as _;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::io::AsyncBufReadExt;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use bridge_agent::config::{self, Settings};
use bridge_agent::error::AgentError;
use bridge_agent::pairing::{machine_id, PairingClient};
use bridge_agent::session::SessionLoop;
use bridge_agent::transcoder::{output_dir_for, FfmpegTranscoder};
use bridge_agent::uploader::HttpUploader;

const AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser)]
#[command(name = "bridge-agent")]
#[command(about = "Relays an RTSP camera feed to a backend as HLS segments")]
#[command(version)]
struct Cli {
    /// Settings file path (defaults to agent-config.json next to the executable)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Run the pairing exchange even if a settings file exists
    #[arg(long)]
    pair: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let settings_path = match cli.config {
        Some(path) => path,
        None => config::default_path().context("cannot locate executable")?,
    };

    tracing::info!(version = AGENT_VERSION, "bridge agent starting");

    let settings = if cli.pair {
        pair_and_persist(&settings_path).await?
    } else {
        match Settings::load(&settings_path) {
            Ok(settings) => settings,
            Err(e) => {
                tracing::warn!(
                    path = %settings_path.display(),
                    error = %e,
                    "no usable settings file, starting pairing"
                );
                pair_and_persist(&settings_path).await?
            }
        }
    };

    tracing::info!(
        bridge_id = %settings.bridge_id,
        backend = %settings.backend_url,
        source = %settings.masked_rtsp_url(),
        "settings resolved"
    );

    let token = CancellationToken::new();
    {
        let token = token.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            tracing::info!("shutdown signal received");
            token.cancel();
        });
    }

    let output_dir = output_dir_for(&settings_path);
    let uploader = Arc::new(HttpUploader::new(&settings, token.clone())?);
    let transcoder = Arc::new(FfmpegTranscoder::new(&settings));

    SessionLoop::new(settings, transcoder, uploader, output_dir)
        .run(token)
        .await;

    tracing::info!("bridge agent shut down");
    Ok(())
}

/// Interactive pairing: prompt for codes until the backend accepts one, then
/// persist the returned settings next to the executable.
async fn pair_and_persist(settings_path: &std::path::Path) -> Result<Settings> {
    let backend_url = config::default_backend_url();

    println!("Bridge agent pairing");
    println!("Backend: {backend_url}");
    println!("Enter the pairing code from the web dashboard:");

    let client = PairingClient::new(&backend_url)?;
    let machine = machine_id();
    let mut network_failures = 0u32;

    let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("> ");
        std::io::stdout().flush().ok();

        let Some(line) = lines.next_line().await? else {
            anyhow::bail!("stdin closed during pairing");
        };
        let code = line.trim();
        if code.is_empty() {
            continue;
        }

        match client.pair(code, AGENT_VERSION, &machine).await {
            Ok(settings) => {
                match settings.save(settings_path) {
                    Ok(()) => tracing::info!(
                        path = %settings_path.display(),
                        "settings saved"
                    ),
                    Err(e) => tracing::warn!(error = %e, "could not save settings"),
                }
                tracing::info!(bridge_id = %settings.bridge_id, "paired");
                return Ok(settings);
            }
            Err(AgentError::InvalidPairCode) => {
                println!("Pairing code not recognized. Please try again.");
            }
            Err(e) => {
                network_failures += 1;
                println!("Network error: {e}");
                if network_failures >= 3 {
                    return Err(e).context("pairing failed");
                }
                println!("Retrying in 3 seconds...");
                tokio::time::sleep(Duration::from_secs(3)).await;
            }
        }
    }
}

/// Wait for shutdown (SIGINT, plus SIGTERM on unix).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
