//! Train signal server: entry point.
//!
//! Listens for the signal's TCP connection and forwards operator commands to
//! it, one acknowledged command at a time.
//!
//! # Usage
//!
//! ```text
//! signal-server [OPTIONS]
//!
//! Options:
//!   --config <PATH>   TOML configuration file
//!   --port   <PORT>   Listening port [default from config: 19100]
//!   --bind   <ADDR>   Listening interface [default from config: 0.0.0.0]
//! ```
//!
//! | Variable        | Description                 |
//! |-----------------|-----------------------------|
//! | `SIGNAL_CONFIG` | Path of the TOML config     |
//! | `SIGNAL_PORT`   | Listening port              |
//! | `SIGNAL_BIND`   | Listening interface         |
//! | `RUST_LOG`      | Log filter (overrides `log_level`) |
//!
//! # Operator commands
//!
//! Each line read on stdin is one command for the signal; the server appends
//! the NUL terminator.  Two lines are handled locally instead:
//!
//! - `reset` closes the sockets and waits for the signal to reconnect.
//! - `quit` shuts the server down (as do Ctrl+C and end of input).

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use signal_core::frame_payload;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use signal_server::infrastructure::storage::config::{load_config, ServerConfig};
use signal_server::{ConnectionHandler, TcpTransport, TokioScheduler};

// ── CLI argument definitions ──────────────────────────────────────────────────

/// Single-client TCP server that forwards queued commands to a train signal.
#[derive(Debug, Parser)]
#[command(name = "signal-server", version)]
struct Cli {
    /// TOML configuration file.  A missing file means built-in defaults.
    #[arg(long, env = "SIGNAL_CONFIG")]
    config: Option<PathBuf>,

    /// TCP port the signal connects to.  Overrides `server.port`.
    #[arg(long, env = "SIGNAL_PORT")]
    port: Option<u16>,

    /// IP address to listen on.  Overrides `server.bind_address`.
    #[arg(long, env = "SIGNAL_BIND")]
    bind: Option<String>,
}

impl Cli {
    /// Loads the config file (if any) and applies the command-line overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed, or if the
    /// resulting bind address is not an IP address.
    fn into_server_config(self) -> anyhow::Result<ServerConfig> {
        let mut config = match &self.config {
            Some(path) => load_config(path)
                .with_context(|| format!("failed to load config from {}", path.display()))?,
            None => ServerConfig::default(),
        };

        if let Some(port) = self.port {
            config.server.port = port;
        }
        if let Some(bind) = self.bind {
            config.server.bind_address = bind;
        }

        config.listen_addr().context("invalid listening address")?;
        Ok(config)
    }
}

/// What the operator asked for on one stdin line.
#[derive(Debug, PartialEq, Eq)]
enum OperatorCommand {
    Send(Vec<u8>),
    Reset,
    Quit,
    Blank,
}

impl OperatorCommand {
    fn parse(line: &str) -> Self {
        match line.trim_end_matches(['\r', '\n']) {
            "" => Self::Blank,
            "reset" => Self::Reset,
            "quit" => Self::Quit,
            payload => Self::Send(frame_payload(payload.as_bytes())),
        }
    }
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = cli.into_server_config()?;

    // ── Logging setup ─────────────────────────────────────────────────────────
    //
    // `RUST_LOG` wins; otherwise the config's `log_level` applies.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.server.log_level)),
        )
        .init();

    let scheduler = Arc::new(TokioScheduler::new());
    let handler = ConnectionHandler::start(&config, TcpTransport, scheduler)?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line,
            signal = tokio::signal::ctrl_c() => {
                match signal {
                    Ok(()) => info!("received Ctrl+C, shutting down"),
                    Err(e) => error!("failed to listen for Ctrl+C: {e}"),
                }
                break;
            }
        };

        let line = match line {
            Ok(Some(line)) => line,
            Ok(None) => {
                info!("end of input, shutting down");
                break;
            }
            Err(e) => {
                error!("failed to read operator input: {e}");
                break;
            }
        };

        match OperatorCommand::parse(&line) {
            OperatorCommand::Send(payload) => {
                if !handler.add_message(payload) {
                    warn!("signal queue full; command '{line}' dropped");
                }
            }
            OperatorCommand::Reset => {
                if let Err(e) = handler.reset_server().await {
                    error!("reset failed: {e}");
                }
            }
            OperatorCommand::Quit => break,
            OperatorCommand::Blank => {}
        }
    }

    handler.stop().await?;
    info!("signal server stopped");
    Ok(())
}

// ── Tests ─────────────────────────────────────────────────────────────────────
