//! xrdmon - XRootD site monitoring agent
//!
//! Reads the summary reports of the local daemons and feeds them through
//! the configured backends:
//! - key filtering, renaming and blocking
//! - file and line protocol outputs
//! - remote collector with host self-monitoring

mod backends;
mod config;

use anyhow::{Context, Result};
use backends::{build_pipeline, BuildContext};
use clap::Parser;
use config::Config;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use xrdmon_core::{Core, LivenessProbe, ProcProbe, ReportSource, SharePool, TargetRegistry};

#[derive(Parser, Debug)]
#[command(name = "xrdmon", version, about = "XRootD site monitoring agent")]
struct Cli {
    /// YAML configuration file
    #[arg(long, short = 'c', env = "XRDMON_CONFIG", default_value = "xrdmon.yaml")]
    config: PathBuf,

    /// Override the port of the summary reports
    #[arg(long, short = 'p')]
    port: Option<u16>,

    /// Log level used when RUST_LOG is not set
    #[arg(long, env = "XRDMON_LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Log as JSON lines
    #[arg(long)]
    log_json: bool,

    /// Validate the configuration and exit
    #[arg(long)]
    check_config: bool,
}

fn init_logging(level: &str, json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("xrdmon={level},xrdmon_core={level}")));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn run(config: Config) -> Result<()> {
    let pool = SharePool::new(config.share_timeout());
    let probe: Arc<dyn LivenessProbe> = Arc::new(ProcProbe::default());
    let ctx = BuildContext {
        pool: pool.clone(),
        probe: probe.clone(),
    };
    let pipeline = build_pipeline(&config.backends, &ctx).context("Failed to build backends")?;

    let source = ReportSource::new(config.port)
        .with_program(config.source.program.clone(), config.source.args.clone())
        .with_policy(config.malformed)
        .with_grace(Duration::from_millis(config.source.grace_ms));
    let mut core = Core::new(source, TargetRegistry::new(probe), pipeline)
        .with_update_interval(config.update_interval())
        .with_space_query(config.space_query.to_query());

    let mut terminate = signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
    let outcome = tokio::select! {
        result = core.run() => result.context("Monitoring loop failed"),
        _ = tokio::signal::ctrl_c() => {
            info!("interrupted, shutting down");
            Ok(())
        }
        _ = terminate.recv() => {
            info!("terminated, shutting down");
            Ok(())
        }
    };

    if let Err(e) = core.shutdown().await {
        error!("failed to stop report producer: {}", e);
    }
    // markers must be gone before the process exits
    pool.shutdown().await;
    outcome
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_logging(&cli.log_level, cli.log_json);

    let mut config = Config::load(&cli.config)
        .with_context(|| format!("Failed to load configuration {}", cli.config.display()))?;
    if let Some(port) = cli.port {
        config.port = port;
    }

    if cli.check_config {
        println!(
            "configuration {} is valid ({} backends)",
            cli.config.display(),
            config.backends.len()
        );
        return Ok(());
    }

    info!("xrdmon {} starting on port {}", env!("CARGO_PKG_VERSION"), config.port);
    run(config).await
}
