//! `intelligent-lb` binary entry point.
//!
//! Loads a TOML configuration, starts the load balancer's background tasks
//! and runs until Ctrl-C.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use intelligent_lb::config::{AppConfig, BasicValidator, ConfigLoader, LogFormat};
use intelligent_lb::load_balancer::{LoadBalancer, TracingEventSink};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "intelligent-lb")]
#[command(version)]
#[command(about = "Load balancer core with health checks and circuit breakers")]
struct Cli {
    /// Path to config file
    #[arg(short, long, global = true, default_value = "intelligent-lb.toml")]
    config: PathBuf,

    /// Override the log filter (e.g. "debug" or "intelligent_lb=trace")
    #[arg(long, global = true, value_name = "FILTER")]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the load balancer until interrupted
    Run,

    /// Validate the configuration file and exit
    CheckConfig,
}

fn init_logging(config: &AppConfig, override_filter: Option<&str>) {
    let filter = match override_filter {
        Some(directives) => EnvFilter::new(directives),
        None => EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(config.logging.directives())),
    };
    let registry = tracing_subscriber::registry().with(filter);

    match config.logging.format {
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
        LogFormat::Compact => registry
            .with(tracing_subscriber::fmt::layer().compact())
            .init(),
        LogFormat::Pretty => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .pretty()
                    .with_file(true)
                    .with_line_number(true)
                    .with_target(false),
            )
            .init(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let loader = ConfigLoader::new().with_validator(BasicValidator::new());
    let config = loader
        .load(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;

    init_logging(&config, cli.log_level.as_deref());

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run(config).await,
        Commands::CheckConfig => {
            println!(
                "{}: ok ({} nodes, strategy {})",
                cli.config.display(),
                config.load_balancer.nodes.len(),
                config.load_balancer.strategy.algorithm
            );
            Ok(())
        },
    }
}

async fn run(config: AppConfig) -> Result<()> {
    let balancer = LoadBalancer::builder(config.load_balancer)
        .event_sink(Arc::new(TracingEventSink))
        .build()
        .context("building load balancer")?;

    info!(version = env!("CARGO_PKG_VERSION"), "Starting intelligent-lb");
    balancer.start()?;

    tokio::signal::ctrl_c()
        .await
        .context("waiting for Ctrl-C")?;
    info!("Interrupt received");

    balancer.shutdown().await?;

    let metrics = balancer.get_metrics();
    info!(
        total_requests = metrics.total_requests,
        failed_requests = metrics.failed_requests,
        circuit_breaker_trips = metrics.circuit_breaker_trips,
        "Final metrics"
    );
    Ok(())
}
