mod capture;
mod config;
mod encoder;
mod error;
mod frame;
mod input;
mod peer;
mod session;
mod signal;
mod telemetry;

use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::Context;
use tracing::{debug, info, warn};

use config::Credential;
use session::SessionManager;

struct Args {
    config_path: Option<PathBuf>,
    server_url: Option<String>,
    credential_file: Option<PathBuf>,
    display: String,
}

fn parse_args() -> anyhow::Result<Args> {
    let mut config_path = None;
    let mut server_url = None;
    let mut credential_file = None;
    let mut display = std::env::var("DISPLAY").unwrap_or_else(|_| ":0".to_string());

    let args: Vec<String> = std::env::args().collect();
    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--config" => {
                i += 1;
                config_path = Some(PathBuf::from(
                    args.get(i).context("Missing --config value")?,
                ));
            }
            "--server-url" => {
                i += 1;
                server_url = Some(args.get(i).context("Missing --server-url value")?.clone());
            }
            "--credential-file" => {
                i += 1;
                credential_file = Some(PathBuf::from(
                    args.get(i).context("Missing --credential-file value")?,
                ));
            }
            "--display" => {
                i += 1;
                display = args.get(i).context("Missing --display value")?.clone();
            }
            other => anyhow::bail!("Unknown argument: {other}"),
        }
        i += 1;
    }

    Ok(Args {
        config_path,
        server_url,
        credential_file,
        display,
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    gstreamer::init().context("Failed to initialize GStreamer")?;

    let args = parse_args()?;
    let mut agent_config = config::load_config(args.config_path.as_deref())?;
    if let Some(url) = args.server_url {
        agent_config.server.url = url;
    }

    let credential_path = args
        .credential_file
        .unwrap_or_else(|| PathBuf::from(&agent_config.server.credential_file));
    let credential = Credential::load(&credential_path)?;

    info!(
        server = %agent_config.server.url,
        agent = %credential.agent_id,
        display = %args.display,
        version = env!("CARGO_PKG_VERSION"),
        "Starting tether-agent"
    );

    let manager = SessionManager::new(
        &agent_config.server.url,
        &args.display,
        agent_config.video.clone(),
        Duration::from_secs(agent_config.poll.signal_secs),
        agent_config.ice.to_ice_servers(),
    );
    info!(capabilities = ?manager.snapshot_capabilities(), "Session manager initialized");

    let http = reqwest::Client::new();
    let started = Instant::now();
    let capabilities = manager.snapshot_capabilities();

    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    let mut pending_tick =
        tokio::time::interval(Duration::from_secs(agent_config.poll.pending_secs));
    let mut telemetry_tick =
        tokio::time::interval(Duration::from_secs(agent_config.poll.telemetry_secs));

    // Both periodic duties share this one tick driver; each session runs
    // its own signalling loop.
    loop {
        tokio::select! {
            _ = pending_tick.tick() => {
                manager.poll_pending(&credential.credential_key).await;
            }
            _ = telemetry_tick.tick() => {
                match telemetry::post_snapshot(
                    &http,
                    &agent_config.server.url,
                    &credential,
                    &capabilities,
                    started,
                ).await {
                    Ok(()) => debug!("Telemetry sent"),
                    Err(e) => warn!("Telemetry send failed: {e}"),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT, shutting down");
                break;
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down");
                break;
            }
        }
    }

    manager.stop_all().await;
    info!("Agent shutdown complete");
    Ok(())
}
