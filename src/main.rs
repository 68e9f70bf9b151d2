// Bridgeway - Dialect-translating LLM gateway
// Copyright (c) 2025 a00 SAS
// License: Elastic License v2.0
// See LICENSE for details

use anyhow::Context;
use bridgeway::cli::ProxyConfig;
use bridgeway::providers::backend::BackendSet;
use bridgeway::providers::classify::{extract_resource_name, EndpointClassifier};
use bridgeway::security::UrlGuard;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "bridgeway")]
#[command(about = "Anthropic Messages gateway for Azure OpenAI and compatible backends", long_about = None)]
#[command(version)]
struct Cli {
    /// TOML file whose [env] table supplies defaults for unset variables
    #[arg(short, long, global = true, env = "BRIDGEWAY_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the gateway in the foreground
    Run {
        /// Port to listen on
        #[arg(short, long)]
        port: Option<u16>,
        /// Host to bind to
        #[arg(long)]
        host: Option<String>,
        /// Log level (trace, debug, info, warn, error)
        #[arg(long)]
        log_level: Option<String>,
        /// Use JSON-formatted logs
        #[arg(long, env = "BRIDGEWAY_JSON_LOGS")]
        json_logs: bool,
    },
    /// Print the resolved configuration (credentials masked)
    Status,
    /// Validate a backend URL and show how it would be classified
    CheckUrl {
        url: String,
        /// Permit plain HTTP and private addresses
        #[arg(long)]
        allow_private: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = ProxyConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;

    let (use_json_logs, log_level_override) = match &cli.command {
        Commands::Run {
            json_logs,
            log_level,
            ..
        } => (*json_logs, log_level.clone()),
        _ => (false, None),
    };

    // RUST_LOG first, then the CLI flag, then configuration
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = log_level_override
            .as_deref()
            .unwrap_or(&config.server.log_level);
        EnvFilter::new(level)
    });
    if use_json_logs {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    match cli.command {
        Commands::Run { port, host, .. } => {
            if let Some(port) = port {
                config.server.port = port;
            }
            if let Some(host) = host {
                config.server.host = host;
            }
            tracing::info!(
                "Starting Bridgeway v{} on {}:{}",
                env!("CARGO_PKG_VERSION"),
                config.server.host,
                config.server.port
            );
            bridgeway::server::start_server(config).await?;
        }
        Commands::Status => {
            let classifier = EndpointClassifier::new();
            let mut summary = config.summary();
            let backends = match BackendSet::from_config(&config, &classifier) {
                Ok(set) => serde_json::json!({
                    "primary": {"id": set.primary.id, "kind": set.primary.kind.as_str()},
                    "fallback": set.fallback.map(|b| serde_json::json!({"id": b.id, "kind": b.kind.as_str()})),
                }),
                Err(e) => serde_json::json!({"error": e.to_string()}),
            };
            if let Some(obj) = summary.as_object_mut() {
                obj.insert("backend".to_string(), backends);
            }
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Commands::CheckUrl { url, allow_private } => {
            let guard = UrlGuard::new(config.security.allowlist.iter());
            let allow_private = allow_private || config.security.allow_private;
            let kind = EndpointClassifier::new().classify(Some(&url), &config);
            println!("Classification: {}", kind);
            if let Some(resource) = extract_resource_name(&url) {
                println!("Azure resource: {}", resource);
            }
            match guard.validate(&url, allow_private).await {
                Ok(()) => println!("✅ {} passes URL validation", url),
                Err(e) => {
                    println!("❌ {}", e);
                    std::process::exit(1);
                }
            }
        }
    }

    Ok(())
}
