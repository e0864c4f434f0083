//! Scaler worker.
//!
//! Drives the reconciler: one pass immediately, then one pass per poll
//! interval, or exactly one pass when no interval is configured. Passes never
//! overlap. Cancellation wins over a pending pass.

use std::sync::Arc;

use anyhow::Context;
use gce_scaler_reconcile::BackoffPolicy;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument};

use crate::buildkite::BuildkiteClient;
use crate::config::Config;
use crate::fleet::{ComputeClient, TokenSource};
use crate::reconciler::{Reconciler, TickError};
use crate::stats::{NoopStats, StatsSink, StatsdSink};

/// Result of the worker loop.
#[derive(Debug, thiserror::Error)]
pub enum ScalerError {
    /// The single pass failed (single-pass mode only).
    #[error(transparent)]
    Tick(TickError),

    #[error("scaler cancelled")]
    Cancelled,
}

impl From<TickError> for ScalerError {
    fn from(err: TickError) -> Self {
        match err {
            TickError::Cancelled => Self::Cancelled,
            other => Self::Tick(other),
        }
    }
}

/// Scaler worker that runs the reconciliation loop.
pub struct ScalerWorker {
    config: Arc<Config>,
    reconciler: Reconciler,
}

impl ScalerWorker {
    /// Create a worker from a config and a prepared reconciler.
    pub fn new(config: Config, reconciler: Reconciler) -> Self {
        Self {
            config: Arc::new(config),
            reconciler,
        }
    }

    /// Build the production clients described by `config`.
    pub async fn from_config(config: Config) -> anyhow::Result<Self> {
        let metrics = BuildkiteClient::new(&config.buildkite_endpoint, &config.buildkite_token)
            .context("failed to create Buildkite client")?;

        let tokens = TokenSource::from_config(config.google_access_token.as_deref())
            .context("failed to create token source")?;
        let backoff = BackoffPolicy::default().with_max_elapsed(config.operation_timeout);
        let fleet = ComputeClient::new(&config.compute_endpoint, tokens, backoff)
            .context("failed to create Compute client")?;

        let stats: Arc<dyn StatsSink> = match &config.statsd_addr {
            Some(addr) => Arc::new(
                StatsdSink::connect(addr)
                    .await
                    .with_context(|| format!("failed to connect statsd sink at {}", addr))?,
            ),
            None => Arc::new(NoopStats),
        };

        let reconciler = Reconciler::new(&config, Arc::new(metrics), Arc::new(fleet), stats);
        Ok(Self::new(config, reconciler))
    }

    /// Run until cancelled, or for one pass in single-pass mode.
    #[instrument(skip(self, cancel), fields(queue = %self.config.buildkite_queue))]
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), ScalerError> {
        info!(
            interval_secs = self.config.poll_interval.map(|d| d.as_secs_f64()),
            concurrency = self.config.concurrency,
            "Starting scaler worker"
        );

        let mut next_tick = Instant::now();

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!("Scaler worker shutting down");
                    return Err(ScalerError::Cancelled);
                }
                _ = tokio::time::sleep_until(next_tick) => {}
            }

            let result = self
                .reconciler
                .run_once(&cancel, self.config.concurrency)
                .await;

            let Some(interval) = self.config.poll_interval else {
                return result.map(|_| ()).map_err(ScalerError::from);
            };

            match result {
                Ok(_) => {}
                Err(TickError::Cancelled) => {
                    info!("Scaler worker shutting down");
                    return Err(ScalerError::Cancelled);
                }
                Err(e) => error!(error = %e, "Autoscaling failed"),
            }

            next_tick = Instant::now() + interval;
        }
    }
}
