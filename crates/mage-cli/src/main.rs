//! MAGE CLI - command-line client for MAGE backends.
//!
//! Sends single commands through the batching command center, or listens on
//! the message stream and prints every delivery as a JSON line.

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use mage_client::{ClientConfig, MageClient, StreamEvent};
use serde_json::{json, Value};
use std::path::PathBuf;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser, Debug)]
#[command(name = "mage-cli")]
#[command(about = "Command-line client for MAGE backends")]
struct Args {
    /// Client configuration file (JSON, as served by the MAGE server)
    #[arg(short, long)]
    config: PathBuf,

    /// Enable debug logging (ignored when RUST_LOG is set)
    #[arg(short, long)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Send one command and print its result
    Call {
        /// Command name as `module.command`
        name: String,

        /// Parameters as a JSON array
        #[arg(default_value = "[]")]
        params: String,

        /// Send even if the command is missing from the command table
        #[arg(long)]
        raw: bool,
    },

    /// Poll the message stream and print deliveries until Ctrl-C
    Listen {
        /// Session key to poll with
        #[arg(long)]
        session: Option<String>,
    },
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Set up logging; stdout is reserved for results. RUST_LOG wins over --debug.
    let default_filter = if args.debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter));
    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();

    let text = std::fs::read_to_string(&args.config)
        .with_context(|| format!("failed to read {}", args.config.display()))?;
    let config = ClientConfig::from_json(&text)?;
    let client = MageClient::new(config)?;

    match args.command {
        Command::Call { name, params, raw } => call(&client, &name, &params, raw).await,
        Command::Listen { session } => listen(&client, session).await,
    }
}

async fn call(client: &MageClient, name: &str, params: &str, raw: bool) -> Result<()> {
    let (module, command) = name
        .split_once('.')
        .ok_or_else(|| anyhow!("command must be module.command, got {}", name))?;
    let params: Value = serde_json::from_str(params).context("params must be valid JSON")?;
    if !params.is_array() {
        return Err(anyhow!("params must be a JSON array"));
    }

    let result = if raw {
        client.commands().send(name, params).await?
    } else {
        client.call(module, command, params).await?
    };

    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}

async fn listen(client: &MageClient, session: Option<String>) -> Result<()> {
    let stream = client.stream();
    let mut events = stream.subscribe();
    if session.is_some() {
        stream.set_session_key(session);
    }
    stream.start(false);
    info!("Listening on {} stream, press Ctrl-C to stop", stream.style());

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received, exiting");
                break;
            }
            event = events.recv() => match event {
                Ok(StreamEvent::Delivery(batches)) => {
                    for batch in batches {
                        let messages: Vec<Value> = batch
                            .messages
                            .iter()
                            .map(|m| json!([m.event_name, m.event_data]))
                            .collect();
                        println!("{}", json!({ "id": batch.id, "messages": messages }));
                    }
                }
                Ok(StreamEvent::Error { error, .. }) => warn!("Stream error: {}", error),
                Ok(StreamEvent::Desync(error)) => warn!("Cache desync: {}", error),
                Err(RecvError::Lagged(skipped)) => warn!("Dropped {} stream events", skipped),
                Err(RecvError::Closed) => break,
            }
        }
    }

    client.close();
    Ok(())
}
