//! Broker Daemon - Hosts the provider manager as a long-running process
//!
//! Loads the broker configuration, brings every configured provider up,
//! starts health monitoring and keeps the pools maintained until it is told
//! to stop. Broker events can be mirrored to stdout as JSON lines for
//! external consumers.
//!
//! # Usage
//!
//! ```bash
//! # Start with the default config (~/.config/llm-broker/broker.toml)
//! broker-daemon
//!
//! # Custom config file
//! broker-daemon --config /etc/llm-broker/broker.toml
//!
//! # Watch the Ollama server process and print events
//! broker-daemon --monitor-pid $(pgrep ollama) --emit-events
//!
//! # One-shot completion through the pool, then exit
//! broker-daemon --prompt "Why is the sky blue?"
//!
//! # Verbose logging
//! RUST_LOG=debug broker-daemon
//! ```
//!
//! # Signals
//!
//! - `SIGTERM` / `SIGINT`: Graceful shutdown
//! - `SIGHUP`: Reload configuration (providers are added or removed to match)

mod daemon;

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use daemon::{BrokerDaemon, DaemonOptions};

/// Broker Daemon - Connection pooling and scheduling for LLM backends
#[derive(Parser, Debug)]
#[command(name = "broker-daemon")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Configuration file path
    #[arg(short = 'c', long, env = "BROKER_CONFIG", value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long, env = "BROKER_LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// PID of a backend process whose CPU and memory use should be watched
    #[arg(long, value_name = "PID")]
    monitor_pid: Option<u32>,

    /// Print every broker event to stdout as a JSON line
    #[arg(long)]
    emit_events: bool,

    /// Run a single completion against the first provider and exit
    #[arg(short = 'p', long, value_name = "TEXT")]
    prompt: Option<String>,

    /// Interval between pool statistics reports, in seconds (0 = never)
    #[arg(long, default_value_t = 60)]
    report_interval: u64,
}

/// Initialize logging with the specified level
fn init_logging(level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(format!("broker_daemon={level},broker_core={level}"))
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .with_writer(std::io::stderr)
        .init();
}

/// Cancel `shutdown` on SIGTERM/SIGINT and flip `reload` on SIGHUP
fn install_signal_handlers(
    shutdown: CancellationToken,
    reload: tokio::sync::mpsc::UnboundedSender<()>,
) -> Result<()> {
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sighup = signal(SignalKind::hangup())?;

    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = sigterm.recv() => {
                    info!("Received SIGTERM, initiating shutdown");
                    shutdown.cancel();
                    break;
                }
                _ = sigint.recv() => {
                    info!("Received SIGINT, initiating shutdown");
                    shutdown.cancel();
                    break;
                }
                _ = sighup.recv() => {
                    info!("Received SIGHUP, scheduling config reload");
                    if reload.send(()).is_err() {
                        break;
                    }
                }
            }
        }
    });
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args.log_level);

    info!("Broker daemon starting");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!("PID: {}", std::process::id());

    let shutdown = CancellationToken::new();
    let (reload_tx, reload_rx) = tokio::sync::mpsc::unbounded_channel();
    install_signal_handlers(shutdown.clone(), reload_tx)?;

    let options = DaemonOptions {
        config_path: args.config,
        monitor_pid: args.monitor_pid,
        emit_events: args.emit_events,
        report_interval: std::time::Duration::from_secs(args.report_interval),
    };
    let daemon = BrokerDaemon::start(options, shutdown.clone()).await?;

    let result = match args.prompt {
        Some(prompt) => daemon.run_prompt(&prompt).await,
        None => daemon.run(reload_rx).await,
    };

    info!("Shutting down...");
    let summary = daemon.shutdown().await;
    println!("{}", serde_json::to_string_pretty(&summary)?);

    match result {
        Ok(()) => {
            info!("Broker daemon stopped cleanly");
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "Daemon stopped with error");
            Err(e)
        }
    }
}
