//! Resilience Daemon - Dependency Health Watchdog
//!
//! Probes every dependency listed in the resilience configuration on an
//! interval, feeds failures through the error monitoring service (alerts,
//! recovery), and optionally writes a JSON status report for dashboards.
//!
//! # Usage
//!
//! ```bash
//! # Watch with defaults (config from ~/.config/resilience/resilience.toml)
//! resilience-daemon
//!
//! # One pass, status to a file
//! resilience-daemon --once --status-file /run/resilience/status.json
//!
//! # Custom config, faster interval
//! resilience-daemon --config /etc/knowledge/resilience.toml --interval-secs 10
//!
//! # Verbose logging
//! RUST_LOG=debug resilience-daemon
//! ```
//!
//! # Signals
//!
//! - `SIGTERM` / `SIGINT`: Graceful shutdown

mod probes;
mod status;
mod watcher;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info, warn};

use resilience_core::{
    default_config_path, load_config_from_path, ConfigOverrides, DependencyClass, ResilienceConfig,
    ResilienceContext,
};

use watcher::Watcher;

/// Resilience Daemon - dependency health watchdog for the knowledge backend
#[derive(Parser, Debug)]
#[command(name = "resilience-daemon")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Configuration file path
    #[arg(short = 'c', long, env = "RESILIENCE_CONFIG", value_name = "FILE")]
    config: Option<PathBuf>,

    /// Seconds between health passes
    #[arg(short = 'i', long, default_value_t = 30, value_parser = clap::value_parser!(u64).range(1..))]
    interval_secs: u64,

    /// Run a single pass and exit
    #[arg(long)]
    once: bool,

    /// Write a JSON status report here after every pass
    #[arg(short = 's', long, env = "RESILIENCE_STATUS_FILE", value_name = "PATH")]
    status_file: Option<PathBuf>,

    /// Override the health cache TTL
    #[arg(long, value_name = "SECS")]
    health_ttl_secs: Option<u64>,

    /// Override the breaker failure threshold
    #[arg(long, value_name = "N")]
    breaker_threshold: Option<u32>,

    /// Omit diagnostics from rendered errors
    #[arg(long)]
    production: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long, env = "RESILIENCE_LOG_LEVEL", default_value = "info")]
    log_level: String,
}

impl Args {
    fn overrides(&self) -> ConfigOverrides {
        let mut overrides = ConfigOverrides::new();
        if let Some(secs) = self.health_ttl_secs {
            overrides = overrides.with_health_ttl_secs(secs);
        }
        if let Some(n) = self.breaker_threshold {
            overrides = overrides.with_breaker_threshold(n);
        }
        if self.production {
            overrides = overrides.with_production(true);
        }
        overrides
    }
}

/// Initialize logging with the specified level
fn init_logging(level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(format!("resilience_daemon={level},resilience_core={level}"))
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .init();
}

/// Load file and environment layers, then CLI overrides
fn resolve_config(args: &Args) -> Result<ResilienceConfig> {
    let path = args.config.clone().or_else(default_config_path);
    let mut config = load_config_from_path(path).context("Failed to load configuration")?;
    args.overrides()
        .apply(&mut config)
        .context("Invalid command-line override")?;
    Ok(config)
}

/// Register a probe per configured dependency
fn register_dependencies(ctx: &ResilienceContext) -> Result<()> {
    let timeout = ctx.config().health.probe_timeout;
    for dep in &ctx.config().dependencies {
        let probe = probes::build_probe(dep, timeout)
            .with_context(|| format!("Failed to build probe for {}", dep.name))?;
        ctx.register_probe(dep.name.clone(), probe);

        let class = dep.class.as_ref().map_or("-", DependencyClass::as_str);
        info!(service = %dep.name, class, probe = ?dep.probe, target = %dep.target, "Watching dependency");
    }
    if ctx.config().dependencies.is_empty() {
        warn!("No dependencies configured; passes will report nothing");
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging first
    init_logging(&args.log_level);

    info!("Resilience daemon starting");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let config = resolve_config(&args)?;
    info!(
        source = %config.source(),
        config_file = ?config.config_file_path,
        dependencies = config.dependencies.len(),
        "Configuration loaded"
    );

    let ctx = Arc::new(ResilienceContext::new(config));
    register_dependencies(&ctx)?;

    // Setup signal handlers
    let mut sigterm = signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("Failed to install SIGINT handler")?;
    let signal_ctx = Arc::clone(&ctx);
    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM, initiating shutdown"),
            _ = sigint.recv() => info!("Received SIGINT, initiating shutdown"),
        }
        signal_ctx.shutdown();
    });

    let mut watcher = Watcher::new(
        Arc::clone(&ctx),
        Duration::from_secs(args.interval_secs),
        args.status_file.clone(),
    );
    let result = watcher.run(args.once).await;

    info!("Shutting down...");
    ctx.shutdown();

    match result {
        Ok(()) => {
            info!("Resilience daemon stopped cleanly");
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "Daemon stopped with error");
            Err(e)
        }
    }
}
