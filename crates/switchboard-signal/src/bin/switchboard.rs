//! Switchboard Signal Server
//!
//! WebSocket signaling relay for WebRTC-style session negotiation.
//!
//! # Usage
//!
//! ```bash
//! # Defaults: 0.0.0.0:8765, config from the platform config dir if present
//! switchboard
//!
//! # Explicit settings
//! switchboard --host 127.0.0.1 --port 9000 --log-level debug
//!
//! # Print a sample config file
//! switchboard --print-config > ~/.config/switchboard/config.toml
//! ```

use std::net::IpAddr;
use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use switchboard_core::Config;
use switchboard_signal::SignalServer;

#[derive(Parser, Debug)]
#[command(name = "switchboard")]
#[command(about = "Switchboard WebRTC signaling relay")]
#[command(version)]
struct Args {
    /// Bind address
    #[arg(short = 'H', long, env = "SWITCHBOARD_HOST")]
    host: Option<IpAddr>,

    /// Port to listen on
    #[arg(short, long, env = "SWITCHBOARD_PORT")]
    port: Option<u16>,

    /// Log filter (debug, info, warn, error, or a tracing directive)
    #[arg(long, env = "SWITCHBOARD_LOG_LEVEL")]
    log_level: Option<String>,

    /// Emit logs as JSON lines
    #[arg(long)]
    log_json: bool,

    /// Config file path (defaults to the platform config directory)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Print a sample configuration and exit
    #[arg(long)]
    print_config: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    if args.print_config {
        print!("{}", Config::sample()?);
        return Ok(());
    }

    // An explicit config path must load; the implicit one falls back to defaults
    let (mut config, config_warning) = match &args.config {
        Some(path) => (
            Config::load_from(path).with_context(|| format!("loading {:?}", path))?,
            None,
        ),
        None => match Config::load_default() {
            Ok(config) => (config, None),
            Err(e) => (Config::default(), Some(e)),
        },
    };

    if let Some(host) = args.host {
        config.server.bind = host;
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }
    if args.log_level.is_some() {
        config.logging.level = args.log_level.clone();
    }
    config.logging.json |= args.log_json;
    config.validate()?;

    init_logging(config.logging.level.as_deref(), config.logging.json)?;

    if let Some(e) = config_warning {
        warn!("Failed to load default config: {}, using defaults", e);
    }

    let addr = config.server.socket_addr();
    info!("Starting Switchboard signal server");
    info!(
        "Ping every {}s, evict after {}s idle",
        config.liveness.ping_interval_secs, config.liveness.ping_timeout_secs
    );

    let server = SignalServer::new(&config);

    // Handle Ctrl+C
    tokio::select! {
        result = server.serve(addr) => {
            if let Err(e) = result {
                error!("Signal server error: {:?}", e);
                return Err(e.into());
            }
        }
        _ = signal::ctrl_c() => {
            info!("Shutting down ({} peers connected)", server.peer_count());
        }
    }

    Ok(())
}

fn init_logging(level: Option<&str>, json: bool) -> anyhow::Result<()> {
    let directive = match level.map(str::to_ascii_lowercase).as_deref() {
        None | Some("") => "info".to_string(),
        Some("warning") => "warn".to_string(),
        Some("critical") | Some("fatal") => "error".to_string(),
        Some(other) => other.to_string(),
    };
    let filter = EnvFilter::try_new(&directive)
        .with_context(|| format!("invalid log level {:?}", directive))?;

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer()).init();
    }
    Ok(())
}
