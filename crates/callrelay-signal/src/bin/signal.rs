//! Callrelay Signal Server
//!
//! WebSocket relay for call negotiation and chat between registered
//! identifiers.
//!
//! # Usage
//!
//! ```bash
//! # Relay only (default)
//! callrelay-signal --port 8080
//!
//! # With the SQLite-backed user/message API
//! callrelay-signal --port 8080 --db /var/lib/callrelay/signal.db
//! ```

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;

use clap::Parser;
use tracing::{info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use callrelay_core::Config;
use callrelay_signal::{SignalServer, Storage};

#[derive(Parser, Debug)]
#[command(name = "callrelay-signal")]
#[command(about = "Callrelay signaling relay for calls and chat")]
#[command(version)]
struct Args {
    /// Port to listen on [default: 8080]
    #[arg(short, long, env = "CALLRELAY_PORT")]
    port: Option<u16>,

    /// Bind address [default: 0.0.0.0]
    #[arg(short, long, env = "CALLRELAY_BIND")]
    bind: Option<IpAddr>,

    /// SQLite database path for the user/message API (API disabled if not specified)
    #[arg(short, long, env = "CALLRELAY_DB")]
    db: Option<PathBuf>,

    /// Config file (defaults to the platform config directory)
    #[arg(short, long, env = "CALLRELAY_CONFIG")]
    config: Option<PathBuf>,

    /// Largest accepted frame or HTTP body in bytes
    #[arg(long, env = "CALLRELAY_MAX_MESSAGE_BYTES")]
    max_message_bytes: Option<usize>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(
            EnvFilter::builder()
                .with_default_directive(Level::INFO.into())
                .from_env_lossy(),
        )
        .init();

    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load(),
    };
    let signal = &mut config.signal;
    if let Some(port) = args.port {
        signal.port = port;
    }
    if let Some(bind) = args.bind {
        signal.bind = bind;
    }
    if let Some(db) = args.db {
        signal.db_path = Some(db);
    }
    if let Some(max) = args.max_message_bytes {
        signal.max_message_bytes = max;
    }

    config.validate()?;
    let signal = &config.signal;
    let addr = SocketAddr::new(signal.bind, signal.port);

    info!("Starting Callrelay Signal Server");
    info!("Listening on {}", addr);

    let storage = if let Some(db_path) = &signal.db_path {
        // Create parent directory if it doesn't exist
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        info!("Using SQLite storage: {:?}", db_path);
        let store = Storage::open(db_path)?;
        info!(
            "Loaded {} users and {} messages from database",
            store.user_count().unwrap_or(0),
            store.message_count().unwrap_or(0)
        );
        Some(store)
    } else {
        info!("No database configured, user/message API disabled");
        None
    };

    let server = SignalServer::with_config(storage, signal.max_message_bytes);

    tokio::select! {
        result = server.serve(addr) => result?,
        _ = tokio::signal::ctrl_c() => {
            info!(
                "Shutting down ({} identifiers, {} connections)",
                server.identity_count(),
                server.connection_count()
            );
        }
    }

    Ok(())
}
