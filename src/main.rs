#![forbid(unsafe_code)]

//! `agent-link`: command-line companion for the agent client library.
//!
//! Connects to an agent (spawned over stdio, or at `--url` over TCP), runs the
//! protocol handshake, issues one command and shuts the connection down.

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use serde_json::Value;
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use agent_link::{AgentClient, AppError, ClientConfig, Result};

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "agent-link", about = "JSON-RPC client for an agent process", version, long_about = None)]
struct Cli {
    /// Path to the TOML configuration file. Defaults apply when omitted.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Address of a running agent (`host:port`, `port`, or `http://host:port`).
    ///
    /// Overrides `cli_url` from the configuration file.
    #[arg(long)]
    url: Option<String>,

    /// Log output format (text or json). Logs go to stderr.
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Check connectivity and print the agent's ping reply.
    Ping {
        /// Message echoed back by the agent.
        message: Option<String>,
    },

    /// Send a request and print its result.
    Call {
        /// Method name.
        method: String,
        /// Request params as a JSON document.
        #[arg(long)]
        params: Option<String>,
    },

    /// Send a notification.
    Notify {
        /// Method name.
        method: String,
        /// Notification params as a JSON document.
        #[arg(long)]
        params: Option<String>,
    },
}

fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(args.log_format)?;

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| AppError::Config(format!("failed to build tokio runtime: {err}")))?
        .block_on(run(args))
}

async fn run(args: Cli) -> Result<()> {
    let mut config = match &args.config {
        Some(path) => ClientConfig::load_from_path(path)?,
        None => ClientConfig::default(),
    };
    if let Some(url) = args.url {
        config.cli_url = Some(url);
    }

    let client = AgentClient::new(config)?;
    client.connect().await?;
    info!(state = %client.state(), "agent-link connected");

    let outcome = execute(&client, args.command).await;

    for err in client.stop().await {
        warn!(%err, "error during shutdown");
    }

    let output = outcome?;
    if let Some(value) = output {
        let rendered = serde_json::to_string_pretty(&value)
            .map_err(|err| AppError::InvalidResponse(format!("cannot render result: {err}")))?;
        println!("{rendered}");
    }
    Ok(())
}

async fn execute(client: &AgentClient, command: Command) -> Result<Option<Value>> {
    match command {
        Command::Ping { message } => {
            let pong = client.ping(message.as_deref()).await?;
            Ok(Some(serde_json::json!({
                "message": pong.message,
                "timestamp": pong.timestamp,
                "protocolVersion": pong.protocol_version,
            })))
        }
        Command::Call { method, params } => {
            let params = parse_params(params.as_deref())?;
            client.request(&method, params).await.map(Some)
        }
        Command::Notify { method, params } => {
            let params = parse_params(params.as_deref())?;
            client.notify(&method, params).await?;
            Ok(None)
        }
    }
}

fn parse_params(raw: Option<&str>) -> Result<Option<Value>> {
    raw.map(|text| {
        serde_json::from_str(text)
            .map_err(|err| AppError::Config(format!("--params is not valid JSON: {err}")))
    })
    .transpose()
}

fn init_tracing(log_format: LogFormat) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr);

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
