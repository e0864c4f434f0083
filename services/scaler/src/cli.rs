//! Command line interface.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::{Config, DEFAULT_BUILDKITE_ENDPOINT, DEFAULT_COMPUTE_ENDPOINT};
use crate::worker::{ScalerError, ScalerWorker};

/// Autoscales a Compute Engine instance group to run Buildkite jobs.
#[derive(Debug, Parser)]
#[command(name = "gce-scaler")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Run the autoscaler, once or on an interval.
    Run(RunArgs),
}

/// Flags for the `run` command.
#[derive(Debug, Clone, Args)]
pub struct RunArgs {
    /// Buildkite agent API token.
    #[arg(long, env = "BUILDKITE_AGENT_TOKEN", hide_env_values = true)]
    pub buildkite_token: Option<String>,

    /// Buildkite queue name.
    #[arg(long, env = "BUILDKITE_QUEUE", default_value = "default")]
    pub buildkite_queue: String,

    /// Buildkite organization slug.
    #[arg(long, env = "BUILDKITE_ORG")]
    pub org: Option<String>,

    /// Google Cloud project.
    #[arg(long, env = "GCP_PROJECT")]
    pub gcp_project: Option<String>,

    /// Google Cloud zone.
    #[arg(long, env = "GCP_ZONE")]
    pub gcp_zone: Option<String>,

    /// Google Cloud instance group.
    #[arg(long, env = "GCP_INSTANCE_GROUP")]
    pub instance_group: Option<String>,

    /// Google Cloud instance template.
    #[arg(long, env = "GCP_INSTANCE_TEMPLATE")]
    pub instance_template: Option<String>,

    /// How many instances to create concurrently.
    #[arg(
        long,
        env = "SCALER_CONCURRENCY",
        default_value_t = gce_scaler_reconcile::DEFAULT_CONCURRENCY
    )]
    pub concurrency: usize,

    /// How frequently the scaler should run (e.g. 30s, 1m). Empty runs once.
    #[arg(long, env = "SCALER_INTERVAL")]
    pub interval: Option<String>,

    /// Maximum time in seconds an instance can run.
    #[arg(
        long,
        alias = "maxRunDuration",
        env = "SCALER_MAX_RUN_DURATION",
        default_value_t = gce_scaler_reconcile::DEFAULT_MAX_RUN_DURATION_SECS
    )]
    pub max_run_duration: i64,

    /// statsd/DogStatsD host:port for gauges.
    #[arg(long, env = "DATADOG_HOST")]
    pub datadog: Option<String>,

    /// Give up waiting on a single provider operation after this long.
    #[arg(long, env = "SCALER_OPERATION_TIMEOUT")]
    pub operation_timeout: Option<String>,

    /// OAuth access token for the Compute API. Uses the metadata server if unset.
    #[arg(long, env = "GOOGLE_OAUTH_ACCESS_TOKEN", hide_env_values = true)]
    pub google_access_token: Option<String>,

    /// Buildkite agent API endpoint.
    #[arg(long, env = "BUILDKITE_AGENT_ENDPOINT", default_value = DEFAULT_BUILDKITE_ENDPOINT)]
    pub buildkite_endpoint: String,

    /// Compute Engine API endpoint.
    #[arg(long, env = "GCP_COMPUTE_ENDPOINT", default_value = DEFAULT_COMPUTE_ENDPOINT)]
    pub compute_endpoint: String,

    /// Enable debug logging.
    #[arg(short, long, env = "SCALER_DEBUG")]
    pub debug: bool,
}

impl Cli {
    /// Run the selected command.
    pub async fn run(self) -> Result<()> {
        match self.command {
            Commands::Run(args) => run(args).await,
        }
    }
}

async fn run(args: RunArgs) -> Result<()> {
    let config = Config::from_args(&args).context("invalid configuration")?;

    // Prefer RUST_LOG, fall back to --debug
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!(
        queue = %config.buildkite_queue,
        project = %config.project,
        zone = %config.zone,
        instance_group = %config.instance_group,
        concurrency = config.concurrency,
        interval_secs = config.poll_interval.map(|d| d.as_secs_f64()),
        "Configuration loaded"
    );

    let worker = ScalerWorker::from_config(config)
        .await
        .context("could not initialize autoscaler")?;

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            shutdown_signal().await;
            info!("Received shutdown signal");
            cancel.cancel();
        }
    });

    match worker.run(cancel).await {
        Ok(()) => Ok(()),
        Err(ScalerError::Cancelled) => {
            info!("Scaler stopped");
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "Autoscaling failed");
            Err(e.into())
        }
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = sigterm.recv() => {}
                }
                return;
            }
            Err(e) => warn!(error = %e, "Failed to install SIGTERM handler"),
        }
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
}
