//! Scaler reconciler.
//!
//! A single pass:
//! - Reads queue demand (scheduled + running jobs)
//! - Counts live instances in the group
//! - Launches the shortfall, at most `concurrency_limit` at a time
//!
//! Passes share no mutable state, so the reconciler can be driven from any
//! loop. Launch failures never abort sibling launches; the pass waits for
//! every launch before reporting.

use std::sync::Arc;

use gce_scaler_reconcile::LaunchPlan;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument};

use crate::buildkite::{MetricsError, QueueMetricsSource};
use crate::config::Config;
use crate::fleet::{FleetClient, FleetError, LaunchRequest};
use crate::stats::{self, StatsSink};

/// Errors that end a reconciliation pass.
#[derive(Debug, thiserror::Error)]
pub enum TickError {
    #[error("fetching metrics for queue {queue}: {source}")]
    Metrics {
        queue: String,
        #[source]
        source: MetricsError,
    },

    #[error("counting live instances in group {group}: {source}")]
    Fleet {
        group: String,
        #[source]
        source: FleetError,
    },

    /// At least one launch failed. Carries the first failure observed.
    #[error("{failed} of {attempted} launches into group {group} failed: {first}")]
    Launch {
        group: String,
        attempted: i64,
        failed: i64,
        #[source]
        first: FleetError,
    },

    #[error("reconciliation cancelled")]
    Cancelled,
}

/// Summary of a successful pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TickReport {
    pub scheduled_jobs: i64,
    pub running_jobs: i64,
    pub live_instances: i64,
    pub required_launches: i64,
    pub launched: i64,
}

/// Which queue drives which group.
#[derive(Debug, Clone)]
struct Target {
    org_slug: String,
    queue: String,
    launch: Arc<LaunchRequest>,
}

/// The scaler reconciler.
pub struct Reconciler {
    target: Target,
    metrics: Arc<dyn QueueMetricsSource>,
    fleet: Arc<dyn FleetClient>,
    stats: Arc<dyn StatsSink>,
}

impl Reconciler {
    /// Create a reconciler for the queue and group named in `config`.
    pub fn new(
        config: &Config,
        metrics: Arc<dyn QueueMetricsSource>,
        fleet: Arc<dyn FleetClient>,
        stats: Arc<dyn StatsSink>,
    ) -> Self {
        let launch = LaunchRequest {
            project: config.project.clone(),
            zone: config.zone.clone(),
            group: config.instance_group.clone(),
            template: config.instance_template.clone(),
            max_run_duration_secs: config.max_run_duration_secs,
        };

        Self {
            target: Target {
                org_slug: config.org_slug.clone(),
                queue: config.buildkite_queue.clone(),
                launch: Arc::new(launch),
            },
            metrics,
            fleet,
            stats,
        }
    }

    /// Run a single reconciliation pass.
    #[instrument(
        skip(self, cancel),
        fields(queue = %self.target.queue, group = %self.target.launch.group)
    )]
    pub async fn run_once(
        &self,
        cancel: &CancellationToken,
        concurrency_limit: usize,
    ) -> Result<TickReport, TickError> {
        let target = &self.target;

        let fetch = self.metrics.get_metrics(&target.org_slug, &target.queue);
        let metrics = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(TickError::Cancelled),
            result = fetch => {
                result.map_err(|source| TickError::Metrics {
                    queue: target.queue.clone(),
                    source,
                })?
            }
        };

        let launch = &target.launch;
        let count = self
            .fleet
            .live_instance_count(&launch.project, &launch.zone, &launch.group);
        let live = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(TickError::Cancelled),
            result = count => {
                result.map_err(|source| TickError::Fleet {
                    group: launch.group.clone(),
                    source,
                })?
            }
        };

        self.stats.gauge(stats::SCHEDULED_JOBS, metrics.scheduled_jobs).await;
        self.stats.gauge(stats::RUNNING_JOBS, metrics.running_jobs).await;
        self.stats.gauge(stats::LIVE_INSTANCES, live).await;

        let plan = LaunchPlan::compute(metrics.scheduled_jobs, metrics.running_jobs, live);
        let mut report = TickReport {
            scheduled_jobs: metrics.scheduled_jobs,
            running_jobs: metrics.running_jobs,
            live_instances: plan.live,
            required_launches: plan.required_launches,
            launched: 0,
        };

        if plan.is_noop() {
            debug!(
                demand = plan.demand,
                live = plan.live,
                "Fleet covers demand, nothing to launch"
            );
            return Ok(report);
        }

        let (launched, failed, first_error) =
            self.launch_all(plan.required_launches, concurrency_limit, cancel).await;
        report.launched = launched;

        info!(
            scheduled = report.scheduled_jobs,
            running = report.running_jobs,
            live = report.live_instances,
            required = report.required_launches,
            launched,
            failed,
            "Reconciliation pass complete"
        );

        match first_error {
            None => Ok(report),
            Some(_) if cancel.is_cancelled() => Err(TickError::Cancelled),
            Some(first) => Err(TickError::Launch {
                group: launch.group.clone(),
                attempted: plan.required_launches,
                failed,
                first,
            }),
        }
    }

    /// Launch `count` instances through a `concurrency_limit`-slot gate and
    /// wait for all of them. Returns (launched, failed, first failure).
    async fn launch_all(
        &self,
        count: i64,
        concurrency_limit: usize,
        cancel: &CancellationToken,
    ) -> (i64, i64, Option<FleetError>) {
        let permits = concurrency_limit.clamp(1, Semaphore::MAX_PERMITS);
        let gate = Arc::new(Semaphore::new(permits));
        let mut launches = JoinSet::new();

        for _ in 0..count {
            let gate = Arc::clone(&gate);
            let fleet = Arc::clone(&self.fleet);
            let request = Arc::clone(&self.target.launch);
            let cancel = cancel.clone();

            launches.spawn(async move {
                // Held until this launch finishes, whatever the outcome.
                let _permit = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(FleetError::Cancelled),
                    permit = gate.acquire_owned() => {
                        permit.map_err(|e| FleetError::Aborted(e.to_string()))?
                    }
                };
                fleet.launch_instance(&cancel, &request).await
            });
        }

        let mut launched = 0i64;
        let mut failed = 0i64;
        let mut first_error = None;

        while let Some(joined) = launches.join_next().await {
            let outcome = joined.unwrap_or_else(|e| Err(FleetError::Aborted(e.to_string())));

            match outcome {
                Ok(()) => launched += 1,
                Err(e) => {
                    failed += 1;
                    if e.is_cancelled() {
                        debug!(group = %self.target.launch.group, "Launch abandoned");
                    } else {
                        error!(
                            group = %self.target.launch.group,
                            template = %self.target.launch.template,
                            error = %e,
                            "Failed to launch instance"
                        );
                    }
                    first_error.get_or_insert(e);
                }
            }
        }

        (launched, failed, first_error)
    }
}
