//! Fleet inspection and instance launching.
//!
//! - `compute`: Compute Engine REST client
//! - `operation`: zone operation wait loop
//! - `auth`: OAuth access token sources

pub mod auth;
pub mod compute;
pub mod operation;

use std::time::Duration;

use async_trait::async_trait;
use gce_scaler_reconcile::{summarize_issues, OperationIssue};
use rand::Rng;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

pub use auth::TokenSource;
pub use compute::ComputeClient;
pub use operation::{wait_for_operation, OperationPoller};

/// Provider statuses that count as live capacity.
pub const LIVE_STATUSES: [&str; 2] = ["PROVISIONING", "RUNNING"];

/// Fleet client errors.
#[derive(Debug, Error)]
pub enum FleetError {
    #[error("{action} {target}: {source}")]
    Request {
        action: &'static str,
        target: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("{action} {target}: API returned {status}: {body}")]
    Api {
        action: &'static str,
        target: String,
        status: u16,
        body: String,
    },

    #[error("operation {operation} failed: {}", summarize_issues(.issues))]
    Operation {
        operation: String,
        issues: Vec<OperationIssue>,
    },

    #[error("operation {operation} still in progress after {elapsed:?}")]
    OperationTimedOut {
        operation: String,
        elapsed: Duration,
    },

    #[error("access token: {0}")]
    Auth(String),

    #[error("launch task failed: {0}")]
    Aborted(String),

    #[error("cancelled")]
    Cancelled,
}

impl FleetError {
    /// Returns true if the error is a cancellation rather than a failure.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

/// Everything needed to launch one instance into a group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchRequest {
    pub project: String,
    pub zone: String,
    pub group: String,
    pub template: String,
    pub max_run_duration_secs: i64,
}

/// Inspects and grows an instance group.
#[async_trait]
pub trait FleetClient: Send + Sync {
    /// Count instances in the group whose status is provisioning or running.
    async fn live_instance_count(
        &self,
        project: &str,
        zone: &str,
        group: &str,
    ) -> Result<i64, FleetError>;

    /// Create one instance from the template, add it to the group, and wait
    /// for the provider operations to finish.
    async fn launch_instance(
        &self,
        cancel: &CancellationToken,
        request: &LaunchRequest,
    ) -> Result<(), FleetError>;
}

/// Returns true if a provider instance status counts as live.
pub fn is_live_status(status: &str) -> bool {
    LIVE_STATUSES.contains(&status)
}

/// Generate a unique instance name: `{template}-{6 hex chars}`.
pub fn instance_name(template: &str) -> String {
    let suffix: [u8; 3] = rand::rng().random();
    format!("{}-{}", template, hex::encode(suffix))
}
