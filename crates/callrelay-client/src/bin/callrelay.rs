//! Callrelay CLI - chat over the signal server and use the user/message API
//!
//! Usage:
//!   callrelay chat <me> <contact>         Interactive chat
//!   callrelay send <me> <to> <message>    Send one message
//!   callrelay register <email> <name>     Register a user with the API
//!   callrelay lookup <email>              Look up a user
//!   callrelay history <a> <b>             Stored messages between two users
//!   callrelay config                      Print the effective configuration

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal;
use tracing::{debug, error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use callrelay_client::{ApiClient, ChatHistory, ChatMessage, SignalClient};
use callrelay_core::{Config, UserId};
use callrelay_signal::RelayMessage;

#[derive(Parser)]
#[command(name = "callrelay")]
#[command(about = "Chat and call signaling client", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Signal server WebSocket URL
    #[arg(short, long, global = true, env = "CALLRELAY_SIGNAL_URL")]
    signal: Option<String>,

    /// User/message API base URL
    #[arg(short, long, global = true, env = "CALLRELAY_API_URL")]
    api: Option<String>,

    /// Config file (defaults to the platform config directory)
    #[arg(short, long, global = true, env = "CALLRELAY_CONFIG")]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Chat with a contact
    Chat {
        /// Identifier to register as
        me: String,

        /// Identifier to chat with
        contact: String,

        /// Store sent messages through the API
        #[arg(long)]
        persist: bool,

        /// Load stored history from the API first
        #[arg(long)]
        history: bool,
    },

    /// Send a single chat message
    Send {
        /// Identifier to register as
        me: String,

        /// Recipient identifier
        to: String,

        /// Message text
        message: String,
    },

    /// Register a user with the API
    Register {
        email: String,
        name: String,
    },

    /// Look up a user by email
    Lookup { email: String },

    /// Stored messages between two users
    History { a: String, b: String },

    /// Print the effective configuration
    Config {
        /// Write it to the config file
        #[arg(long)]
        init: bool,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Set up logging
    let level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false))
        .with(
            EnvFilter::builder()
                .with_default_directive(level.into())
                .from_env_lossy(),
        )
        .init();

    let mut config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load(),
    };
    if let Some(url) = cli.signal {
        config.client.signal_url = url;
    }
    if let Some(url) = cli.api {
        config.client.api_url = url;
    }
    config.validate()?;

    match cli.command {
        Commands::Chat {
            me,
            contact,
            persist,
            history,
        } => {
            run_chat(
                &config,
                me.parse::<UserId>()?,
                contact.parse::<UserId>()?,
                persist,
                history,
            )
            .await?;
        }
        Commands::Send { me, to, message } => {
            let mut client = SignalClient::connect(&config.client.signal_url).await?;
            client.register(me.parse::<UserId>()?).await?;
            client.send_chat(&to.parse::<UserId>()?, &message)?;
            client.close().await;
            info!("Sent to {}", to);
        }
        Commands::Register { email, name } => {
            let user = api_client(&config)?.register_user(&email, &name).await?;
            println!("{}", serde_json::to_string_pretty(&user)?);
        }
        Commands::Lookup { email } => match api_client(&config)?.get_user(&email).await? {
            Some(user) => println!("{}", serde_json::to_string_pretty(&user)?),
            None => {
                error!("No user {}", email);
                return Err("user not found".into());
            }
        },
        Commands::History { a, b } => {
            for msg in api_client(&config)?.messages_between(&a, &b).await? {
                println!("[{}] {} -> {}: {}", msg.timestamp, msg.from, msg.to, msg.message);
            }
        }
        Commands::Config { init } => {
            if init {
                let path = cli
                    .config
                    .or_else(Config::default_path)
                    .ok_or("no config directory on this platform")?;
                config.save_to(&path)?;
            } else {
                print!("{}", toml::to_string_pretty(&config)?);
            }
        }
    }

    Ok(())
}

fn api_client(config: &Config) -> Result<ApiClient, Box<dyn std::error::Error>> {
    Ok(ApiClient::new(
        &config.client.api_url,
        Duration::from_secs(config.client.request_timeout_secs),
    )?)
}

async fn run_chat(
    config: &Config,
    me: UserId,
    contact: UserId,
    persist: bool,
    load_history: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let api = if persist || load_history {
        Some(api_client(config)?)
    } else {
        None
    };

    let mut history = ChatHistory::new(me.clone());
    if let (true, Some(api)) = (load_history, &api) {
        match api.messages_between(me.as_str(), contact.as_str()).await {
            Ok(stored) => {
                history.backfill(&contact, &stored);
                for msg in history.conversation(&contact) {
                    println!("{}", format_line(msg));
                }
            }
            Err(e) => warn!("Could not load history: {}", e),
        }
    }

    let mut client = SignalClient::connect(&config.client.signal_url).await?;
    client.register(me.clone()).await?;
    info!("Chatting with {} (Ctrl+C to quit)", contact);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                let text = line.trim();
                if text.is_empty() {
                    continue;
                }
                client.send_chat(&contact, text)?;
                debug!("{}", format_line(history.record_outgoing(&contact, text)));
                if let (true, Some(api)) = (persist, &api) {
                    if let Err(e) = api.save_message(me.as_str(), contact.as_str(), text).await {
                        warn!("Could not store message: {}", e);
                    }
                }
            }
            msg = client.recv() => match msg {
                Some(RelayMessage::ReceiveMessage { from, message }) => {
                    let text = match message {
                        Value::String(text) => text,
                        other => other.to_string(),
                    };
                    println!("{}", format_line(history.record_incoming(&from, &text)));
                    if from == contact {
                        history.mark_read(&from);
                    }
                }
                Some(RelayMessage::Error { code, message }) => {
                    warn!("Server error {:?}: {}", code, message);
                }
                Some(other) => debug!("Ignoring {}", other.event_name()),
                None => {
                    error!("Connection to signal server lost");
                    break;
                }
            },
            _ = signal::ctrl_c() => {
                info!("Shutting down...");
                break;
            }
        }
    }

    client.close().await;

    info!(
        "{} message(s) in the conversation with {}",
        history.conversation(&contact).len(),
        contact
    );
    for (other, unread) in history.unread_by_contact() {
        info!("{} unread message(s) from {}", unread, other);
    }
    Ok(())
}

fn format_line(msg: &ChatMessage) -> String {
    format!("[{}] {}: {}", msg.timestamp.format("%H:%M:%S"), msg.from, msg.text)
}
