//! # parley
//!
//! Private messaging delivery server binary: wires settings, telemetry,
//! store, broker and the HTTP/WebSocket server together.

#![deny(unsafe_code)]

use std::path::PathBuf;
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use parley_core::UserId;
use parley_server::metrics::install_recorder;
use parley_server::shutdown::wait_for_signal;
use parley_server::{ParleyServer, ServerConfig, TokenService};
use parley_settings::ParleySettings;
use parley_store::Database;
use parley_telemetry::{init_telemetry, TelemetryConfig};
use tracing::{info, warn};

/// Parley delivery server.
#[derive(Parser, Debug)]
#[command(name = "parley", about = "Real-time private message delivery")]
struct Cli {
    /// Settings file (defaults to `$PARLEY_HOME/settings.json`).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the server (default).
    Serve {
        /// Port to bind, overriding settings.
        #[arg(long)]
        port: Option<u16>,
    },
    /// Print a signed token for a user.
    IssueToken {
        /// User the token authenticates.
        user: String,
    },
}

fn load(cli: &Cli) -> Result<ParleySettings> {
    let settings = match &cli.config {
        Some(path) => parley_settings::load_settings_from_path(path)
            .with_context(|| format!("Failed to load settings from {}", path.display()))?,
        None => parley_settings::load_settings().context("Failed to load settings")?,
    };
    settings.validate().context("Invalid settings")?;
    Ok(settings)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut settings = load(&cli)?;

    match cli.command.unwrap_or(Command::Serve { port: None }) {
        Command::IssueToken { user } => {
            let tokens = TokenService::new(&settings.auth.jwt_secret, settings.auth.token_ttl_secs);
            println!("{}", tokens.issue(&UserId::from_raw(user))?);
            Ok(())
        }
        Command::Serve { port } => {
            if let Some(port) = port {
                settings.server.port = port;
            }
            serve(settings).await
        }
    }
}

async fn serve(settings: ParleySettings) -> Result<()> {
    let telemetry = TelemetryConfig::from_settings(&settings.logging)?;
    init_telemetry(&telemetry)?;

    let metrics = match install_recorder() {
        Ok(handle) => Some(handle),
        Err(e) => {
            warn!(error = %e, "metrics recorder not installed");
            None
        }
    };

    let db_path = parley_settings::resolve_path(&settings.store.db_path);
    let db = Database::open(&db_path)
        .with_context(|| format!("Failed to open database at {}", db_path.display()))?;

    let config = ServerConfig::from_settings(&settings).context("Invalid heartbeat settings")?;
    let broker = parley_broker::connect(settings.broker.url.as_deref(), config.broker_buffer)
        .await
        .context("Failed to connect to broker")?;
    let tokens = TokenService::new(&settings.auth.jwt_secret, settings.auth.token_ttl_secs);

    let server = ParleyServer::new(config, db, broker, tokens, metrics).await?;
    let running = server.listen().await?;
    info!(addr = %running.local_addr(), "parley ready");

    wait_for_signal().await;
    running.shutdown().await;
    Ok(())
}
