//! Bayeux CLI
//!
//! Command-line client for Bayeux (CometD) servers.
//! Subscribes to channels and prints what arrives, and optionally
//! publishes every line typed on stdin.

use bayeux_core::events::StdoutEventSink;
use bayeux_core::{ClientConfig, SessionClient};
use clap::Parser;
use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

mod listen;

/// Bayeux - a command-line Comet client
///
/// Connect to a Bayeux server, subscribe to channels and publish messages.
#[derive(Parser, Debug)]
#[command(name = "bayeux")]
#[command(version, about, long_about = None)]
struct Args {
    /// Bayeux server URL
    #[arg(env = "BAYEUX_URL")]
    url: Option<String>,

    /// Channel to subscribe to (repeatable, wildcards allowed)
    #[arg(short, long = "subscribe")]
    subscribe: Vec<String>,

    /// Publish each stdin line to this channel
    #[arg(short, long)]
    publish: Option<String>,

    /// Output format: text or json
    #[arg(short, long, default_value = "text")]
    format: OutputFormat,

    /// JSON file with client configuration
    #[arg(short, long)]
    config: Option<String>,

    /// Only use this transport (long-polling or rest-polling)
    #[arg(short, long)]
    transport: Option<String>,

    /// Print session lifecycle events
    #[arg(long)]
    events: bool,
}

#[derive(Debug, Clone, clap::ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

/// Build the client configuration from an optional file and the URL argument
fn load_config(path: Option<&Path>, url: Option<String>) -> Result<ClientConfig, String> {
    let mut config = match path {
        Some(path) => {
            let content = std::fs::read_to_string(path)
                .map_err(|e| format!("Failed to read {}: {e}", path.display()))?;
            serde_json::from_str::<ClientConfig>(&content)
                .map_err(|e| format!("Invalid config {}: {e}", path.display()))?
        }
        None => ClientConfig::default(),
    };
    if let Some(url) = url {
        config.url = url;
    }
    config.validate().map_err(|e| e.to_string())?;
    Ok(config)
}

#[tokio::main]
async fn main() -> ExitCode {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    if args.subscribe.is_empty() && args.publish.is_none() {
        eprintln!("Error: nothing to do");
        eprintln!("Usage: bayeux <URL> --subscribe <CHANNEL> [--publish <CHANNEL>]");
        return ExitCode::FAILURE;
    }

    let config = match load_config(args.config.as_deref().map(Path::new), args.url) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {e}");
            return ExitCode::FAILURE;
        }
    };

    tracing::info!("Connecting to {}", config.url);

    let client = match SessionClient::new(config) {
        Ok(client) => client,
        Err(e) => {
            eprintln!("Error: {e}");
            return ExitCode::FAILURE;
        }
    };

    if let Some(only) = args.transport {
        client.configure_transports(|registry| {
            for name in registry.transport_types() {
                if name != only {
                    registry.remove(&name);
                }
            }
        });
    }

    let json_output = matches!(args.format, OutputFormat::Json);
    if args.events {
        client.set_event_sink(Arc::new(StdoutEventSink::new(json_output)));
    }

    match listen::run_session(client, &args.subscribe, args.publish.as_deref(), json_output).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}
