//! Probe - send one request to a core backend and print the reply.
//!
//! This example demonstrates:
//! - Loading configuration and schema sources
//! - Starting a gateway with the builder pattern
//! - Issuing an authenticated or system call and reading the reply
//!
//! # Running
//!
//! ```text
//! cargo run --example probe -- -c gateway.toml VersionRequest
//! cargo run --example probe -- -c gateway.toml -u u/jdoe UserViewRequest '{"uid": "u/jdoe"}'
//! ```

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use core_gateway::{Gateway, GatewayConfig, SchemaRegistry};
use serde_json::Value;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Send one request through the gateway
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Configuration file path
    #[arg(short = 'c', long = "config")]
    config: Option<PathBuf>,

    /// Backend endpoint, overrides the configuration
    #[arg(short = 's', long = "server")]
    server: Option<String>,

    /// Caller identity; without it the request is sent as a system call
    #[arg(short = 'u', long = "user")]
    user: Option<String>,

    /// Message name
    message: String,

    /// Payload as JSON
    #[arg(default_value = "{}")]
    payload: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => GatewayConfig::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => GatewayConfig::from_env()?,
    };
    if let Some(server) = cli.server {
        config.core.server_address = server;
    }

    let registry = SchemaRegistry::from_config(&config.schema)?;
    info!(message_types = registry.len(), "Schema loaded");

    let payload: Value = serde_json::from_str(&cli.payload).context("payload is not JSON")?;

    let gateway = Gateway::builder(registry)
        .with_config(&config)
        .connect(&config.core.server_address)
        .await?;

    let result = match cli.user.as_deref() {
        Some(user) => gateway.call(&cli.message, &payload, Some(user)).await,
        None => gateway.call_direct(&cli.message, "", &payload).await,
    };

    match result {
        Ok(reply) => {
            let data = reply.into_data().unwrap_or(Value::Null);
            println!("{}", serde_json::to_string_pretty(&data)?);
        }
        Err(e) => eprintln!("{} ({})", e, e.status_code()),
    }

    gateway.shutdown().await?;
    Ok(())
}
