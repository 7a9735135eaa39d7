//! Girder Worker Agent

mod agent;
mod client;
mod executor;

use std::collections::HashMap;
use std::time::Duration;

use clap::Parser;
use girder_core::ResourceId;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use agent::{Agent, AgentConfig};
use client::ApiClient;

#[derive(Parser)]
#[command(name = "girder-agent")]
#[command(about = "Girder CI/CD worker agent", long_about = None)]
struct Cli {
    /// API server address
    #[arg(
        long = "api-server",
        env = "GIRDER_API_SERVER",
        default_value = "http://localhost:8080"
    )]
    api_server: String,

    /// Worker name (defaults to hostname plus a random suffix)
    #[arg(long)]
    name: Option<String>,

    /// Maximum concurrent builds
    #[arg(long = "max-concurrent", default_value_t = 2)]
    max_concurrent: usize,

    /// Build isolation type (docker, process)
    #[arg(long, default_value = "docker")]
    isolation: String,

    /// Worker labels (key=value, repeatable)
    #[arg(long = "label")]
    labels: Vec<String>,

    /// Log level (debug, info, warn, error)
    #[arg(long = "log-level", default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(cli.log_level.clone())),
        )
        .init();

    info!("starting girder worker agent");

    let hostname = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string());

    let worker_name = cli
        .name
        .clone()
        .unwrap_or_else(|| format!("{hostname}-{}", ResourceId::new().short()));

    let mut labels = HashMap::new();
    for raw in &cli.labels {
        match raw.split_once('=') {
            Some((key, value)) if !key.is_empty() => {
                labels.insert(key.to_string(), value.to_string());
            }
            _ => warn!(label = %raw, "ignoring malformed label, expected key=value"),
        }
    }

    let config = AgentConfig {
        api_server: cli.api_server.clone(),
        worker_name,
        max_concurrent: cli.max_concurrent.max(1),
        isolation: cli.isolation.clone(),
        labels,
        hostname,
        ip_address: outbound_ip(),
        cpu_cores: std::thread::available_parallelism()
            .map(|n| n.get() as i32)
            .unwrap_or(1),
        // Rough default until real memory detection lands; only used for
        // capacity reporting, never enforcement.
        memory_mb: 8192,
    };

    let executor = executor::create_executor(&cli.isolation)?;
    let client = ApiClient::new(&config.api_server)?;
    let agent = Agent::new(config, client, executor);

    let shutdown = CancellationToken::new();
    let mut run = tokio::spawn(agent.run(shutdown.clone()));

    tokio::select! {
        // The run loop only returns on its own for fatal errors
        // (registration failure); propagate those.
        result = &mut run => {
            result??;
            return Ok(());
        }
        _ = tokio::signal::ctrl_c() => {
            info!("shutting down worker agent");
            shutdown.cancel();
        }
    }

    match tokio::time::timeout(Duration::from_secs(40), run).await {
        Ok(result) => result??,
        Err(_) => warn!("shutdown grace period elapsed, exiting"),
    }

    info!("worker agent exited");
    Ok(())
}

/// The preferred outbound IP of this machine, discovered by opening a UDP
/// socket that never sends anything.
fn outbound_ip() -> String {
    std::net::UdpSocket::bind("0.0.0.0:0")
        .and_then(|socket| {
            socket.connect("8.8.8.8:80")?;
            socket.local_addr()
        })
        .map(|addr| addr.ip().to_string())
        .unwrap_or_else(|_| "127.0.0.1".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn label_parsing_splits_on_first_equals() {
        let mut labels = HashMap::new();
        for raw in ["arch=amd64", "zone=eu=west", "bad"] {
            if let Some((key, value)) = raw.split_once('=') {
                if !key.is_empty() {
                    labels.insert(key.to_string(), value.to_string());
                }
            }
        }
        assert_eq!(labels.get("arch").map(String::as_str), Some("amd64"));
        assert_eq!(labels.get("zone").map(String::as_str), Some("eu=west"));
        assert_eq!(labels.len(), 2);
    }
}
