// Telemetry Agent - poll-and-publish metrics agent
//
// Polls a set of monitored targets on a fixed interval and exports the
// resulting gauges to an OpenTelemetry collector. Targets are managed at
// runtime through a small HTTP Control API.
//
// # Features
// - Live and forecast carbon intensity per location
// - ICMP latency to peer nodes
// - Simulated battery and rack sensors
// - OTLP/HTTP JSON export with log fallback
// - Out-of-band flush on every registry change
//
// # Usage
// telemetry-agent [--mode carbon|latency|battery|rack] [--listen <addr:port>]
//
// Example:
// AGENT_MODE=latency SOURCE_IP=10.208.99.108 CLUSTER=IBM \
//     COLLECTOR_ENDPOINT=http://10.208.99.108:30001 telemetry-agent

use anyhow::{Context, Result};
use std::env;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

// Module declarations
mod config;
mod metrics;
mod registry;
mod scheduler;
mod server;
mod sink;
mod target;

use config::{AgentConfig, AgentMode};
use metrics::create_collectors;
use registry::TargetRegistry;
use scheduler::{flush_channel, PublisherLoop};
use server::{create_router, AppState};
use sink::{LogSink, MetricSink, OtlpHttpSink, Resource};
use target::{PeerTarget, Target};

/// Application entry point
///
/// This function:
/// 1. Loads `.env` and initializes logging
/// 2. Reads the agent configuration
/// 3. Seeds the registry for the selected mode
/// 4. Starts the publisher loop
/// 5. Serves the Control API until Ctrl+C
#[tokio::main]
async fn main() -> Result<()> {
    // A missing .env file is fine
    dotenvy::dotenv().ok();

    init_logging();

    info!("=== Telemetry Agent Starting ===");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let args = parse_arguments();
    let config = AgentConfig::from_lookup(|name| match name {
        "AGENT_MODE" => args.mode.clone().or_else(|| env::var(name).ok()),
        "LISTEN_ADDR" => args.listen.clone().or_else(|| env::var(name).ok()),
        _ => env::var(name).ok(),
    })
    .context("Invalid agent configuration")?;

    config.log_summary();

    let registry = TargetRegistry::new();
    seed_registry(&config, &registry).await;

    let collectors = create_collectors(&config).context("Failed to create metric collectors")?;
    info!("Created {} metric collector(s)", collectors.len());

    let sink: Arc<dyn MetricSink> = match &config.collector_endpoint {
        Some(endpoint) => {
            let resource = Resource {
                service_name: config.service_name.clone(),
                service_namespace: config.service_namespace.clone(),
                service_version: env!("CARGO_PKG_VERSION").to_string(),
            };
            let sink = OtlpHttpSink::new(endpoint, resource, config.request_timeout)
                .context("Failed to create OTLP exporter")?;
            info!("Exporting to {}", config::mask_credentials(sink.url()));
            Arc::new(sink)
        }
        None => Arc::new(LogSink),
    };

    let (flush, flush_rx) = flush_channel();
    let publisher = PublisherLoop::new(registry.clone(), collectors, sink, config.interval);
    let publisher_task = tokio::spawn(publisher.run(flush_rx));

    let router = create_router(AppState {
        registry,
        flush,
        kind: config.mode.target_kind(),
    });

    let listener = TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("Failed to bind Control API on {}", config.listen_addr))?;

    info!("=== Telemetry Agent Started Successfully ===");
    info!("Control API listening on {}", config.listen_addr);
    info!("Press Ctrl+C to stop");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Control API server failed")?;

    publisher_task.abort();
    info!("=== Telemetry Agent Stopped ===");
    Ok(())
}

/// Registers the start-up targets for the selected mode
///
/// - carbon: LATITUDE/LONGITUDE when both are set
/// - latency: SEED_TARGETS, empty by default
/// - battery: SEED_TARGETS, or this instance's resolved address
/// - rack: SEED_TARGETS, or rackA and rackB
async fn seed_registry(config: &AgentConfig, registry: &TargetRegistry) {
    let mut seeds: Vec<Target> = Vec::new();

    match config.mode {
        AgentMode::Carbon => {
            if let Some(location) = &config.static_location {
                seeds.push(Target::Geo(location.clone()));
            }
        }
        AgentMode::Latency | AgentMode::Battery | AgentMode::Rack => {
            let mut addresses = config.seed_targets.clone();
            if addresses.is_empty() {
                match config.mode {
                    AgentMode::Battery => {
                        addresses.push(config::resolve_instance_address(&config.source_ip).await)
                    }
                    AgentMode::Rack => {
                        addresses.extend(["rackA".to_string(), "rackB".to_string()])
                    }
                    _ => {}
                }
            }

            seeds.extend(addresses.into_iter().map(|node_ip| {
                Target::Peer(PeerTarget {
                    node_ip,
                    cluster: Some(config.cluster.clone()),
                    domain: None,
                })
            }));
        }
    }

    for target in seeds {
        if let Err(e) = registry.add(target) {
            warn!("Skipping start-up target: {}", e);
        }
    }

    info!("Registry seeded with {} target(s)", registry.len());
}

/// Command-line overrides for the environment
struct CliArgs {
    /// Overrides AGENT_MODE
    mode: Option<String>,

    /// Overrides LISTEN_ADDR
    listen: Option<String>,
}

/// Parses command-line arguments
///
/// # Arguments
/// 1. --mode <mode> - carbon, latency, battery or rack (optional)
/// 2. --listen <addr:port> - Control API address (optional)
///
/// # Examples
/// ```bash
/// telemetry-agent --mode latency
/// telemetry-agent --mode carbon --listen 127.0.0.1:9001
/// ```
fn parse_arguments() -> CliArgs {
    let args: Vec<String> = env::args().collect();

    // Helper function to find argument value
    let find_arg = |flag: &str| -> Option<String> {
        args.iter()
            .position(|arg| arg == flag)
            .and_then(|pos| args.get(pos + 1))
            .map(|s| s.to_string())
    };

    CliArgs {
        mode: find_arg("--mode"),
        listen: find_arg("--listen"),
    }
}

/// Completes on Ctrl+C
async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
        // Without a signal handler, keep serving
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

/// Initializes the logging subsystem
///
/// Sets up structured logging with:
/// - Timestamp for each log entry
/// - Log level (INFO, WARN, ERROR, etc.)
/// - Target module name
/// - Colored output when running in terminal
/// - JSON output when running as systemd service
///
/// # Log Levels
/// Default: INFO
/// Can be overridden with RUST_LOG environment variable
///
/// # Examples
/// ```bash
/// RUST_LOG=debug telemetry-agent ...                  # Enable debug logging
/// RUST_LOG=telemetry_agent=debug,tower_http=debug ... # Include request traces
/// ```
fn init_logging() {
    // Systemd sets INVOCATION_ID environment variable
    let is_systemd = env::var("INVOCATION_ID").is_ok();

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    if is_systemd {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_level(true)
                    .with_ansi(true),
            )
            .init();
    }
}
