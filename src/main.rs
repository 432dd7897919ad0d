#![forbid(unsafe_code)]

//! `vm-relay-agent`: execution agent running inside the VM.
//!
//! Loads configuration, binds the RPC listener and serves process execution
//! and file operations until Ctrl-C or SIGTERM.

use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

use vm_relay::agent::server::spawn_agent_server;
use vm_relay::agent::Agent;
use vm_relay::config::AgentConfig;
use vm_relay::{AppError, Result};

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "vm-relay-agent", about = "In-VM execution agent", version, long_about = None)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override the listen address.
    #[arg(long)]
    bind: Option<IpAddr>,

    /// Override the listen port.
    #[arg(long)]
    port: Option<u16>,

    /// Log output format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
}

fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(args.log_format)?;
    info!("vm-relay-agent bootstrap");

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| AppError::Config(format!("failed to build tokio runtime: {err}")))?
        .block_on(run(args))
}

async fn run(args: Cli) -> Result<()> {
    // ── Load configuration ──────────────────────────────
    let mut config = match args.config {
        Some(ref path) => AgentConfig::load_from_path(path)?,
        None => AgentConfig::default(),
    };
    if let Some(bind) = args.bind {
        config.bind_address = bind;
    }
    if let Some(port) = args.port {
        config.port = port;
    }
    info!(
        bind = %config.bind_address,
        port = config.port,
        max_line_bytes = config.max_line_bytes,
        "configuration loaded"
    );

    // ── Start listener ──────────────────────────────────
    let agent = Arc::new(Agent::from_config(&config)?);
    let ct = CancellationToken::new();
    let server = spawn_agent_server(agent, &config, ct.clone()).await?;
    info!(local_addr = %server.local_addr, "agent ready");

    // ── Wait for shutdown signal ────────────────────────
    shutdown_signal().await;
    info!("shutdown signal received");
    ct.cancel();

    if let Err(err) = server.join.await {
        error!(%err, "agent server task failed");
    }
    info!("vm-relay-agent shut down");

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    received = await_ctrl_c(ctrl_c) => {
                        if !received {
                            sigterm.recv().await;
                        }
                    }
                    _ = sigterm.recv() => {}
                }
            }
            Err(err) => {
                tracing::warn!(%err, "failed to register SIGTERM handler, using ctrl-c only");
                if !await_ctrl_c(ctrl_c).await {
                    std::future::pending::<()>().await;
                }
            }
        }
    }

    #[cfg(not(unix))]
    {
        if !await_ctrl_c(ctrl_c).await {
            std::future::pending::<()>().await;
        }
    }
}

/// Wait for Ctrl-C, logging a failed handler. Returns whether the signal
/// actually arrived; a failed handler must not shut the agent down.
async fn await_ctrl_c(signal: impl std::future::Future<Output = std::io::Result<()>>) -> bool {
    match signal.await {
        Ok(()) => true,
        Err(err) => {
            error!(%err, "ctrl-c signal handler failed");
            false
        }
    }
}

fn init_tracing(log_format: LogFormat) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = fmt().with_env_filter(env_filter);

    match log_format {
        LogFormat::Text => subscriber
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
        LogFormat::Json => subscriber
            .json()
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
    }

    Ok(())
}
