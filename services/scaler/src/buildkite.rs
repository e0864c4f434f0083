//! Buildkite agent metrics client.
//!
//! Reads scheduled and running job counts for a queue from the agent
//! metrics endpoint (`GET /metrics`, authenticated with an agent token).

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

/// Metrics client errors.
#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("metrics request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("metrics request returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("invalid agent token: {0}")]
    InvalidToken(String),
}

/// Job counts for a single queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueMetrics {
    pub org_slug: String,
    pub queue: String,
    pub scheduled_jobs: i64,
    pub running_jobs: i64,
}

/// Source of queue demand.
#[async_trait]
pub trait QueueMetricsSource: Send + Sync {
    /// Fetch current job counts for `queue` in `org_slug`.
    async fn get_metrics(&self, org_slug: &str, queue: &str) -> Result<QueueMetrics, MetricsError>;
}

/// HTTP client for the Buildkite agent API.
#[derive(Debug, Clone)]
pub struct BuildkiteClient {
    client: reqwest::Client,
    endpoint: String,
}

impl BuildkiteClient {
    /// Create a client against `endpoint` (e.g. `https://agent.buildkite.com/v3`).
    pub fn new(endpoint: &str, agent_token: &str) -> Result<Self, MetricsError> {
        let mut headers = HeaderMap::new();
        let auth = HeaderValue::from_str(&format!("Token {}", agent_token))
            .map_err(|e| MetricsError::InvalidToken(e.to_string()))?;
        headers.insert(AUTHORIZATION, auth);

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .user_agent(concat!("gce-scaler/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(30))
            .build()?;

        Ok(Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
        })
    }

    async fn fetch(&self) -> Result<MetricsResponse, MetricsError> {
        let url = format!("{}/metrics", self.endpoint);
        let response = self.client.get(&url).send().await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(MetricsError::Status { status, body });
        }

        Ok(response.json().await?)
    }
}

#[async_trait]
impl QueueMetricsSource for BuildkiteClient {
    async fn get_metrics(&self, org_slug: &str, queue: &str) -> Result<QueueMetrics, MetricsError> {
        debug!(queue, "Collecting agent metrics");

        let started = Instant::now();
        let response = self.fetch().await?;
        let metrics = response.queue_metrics(org_slug, queue);

        debug!(
            queue,
            scheduled = metrics.scheduled_jobs,
            running = metrics.running_jobs,
            duration_ms = started.elapsed().as_millis() as u64,
            "Retrieved agent metrics"
        );

        Ok(metrics)
    }
}

#[derive(Debug, Default, Deserialize)]
struct MetricsResponse {
    #[serde(default)]
    organization: Organization,
    #[serde(default)]
    jobs: Jobs,
}

#[derive(Debug, Default, Deserialize)]
struct Organization {
    #[serde(default)]
    slug: String,
}

#[derive(Debug, Default, Deserialize)]
struct Jobs {
    #[serde(default)]
    queues: HashMap<String, QueueCounts>,
}

#[derive(Debug, Default, Deserialize)]
struct QueueCounts {
    #[serde(default)]
    scheduled: i64,
    #[serde(default)]
    running: i64,
}

impl MetricsResponse {
    /// Counts for `queue`; zero when the queue has no jobs reported.
    fn queue_metrics(&self, org_slug: &str, queue: &str) -> QueueMetrics {
        let counts = self.jobs.queues.get(queue);
        let org_slug = if self.organization.slug.is_empty() {
            org_slug.to_string()
        } else {
            self.organization.slug.clone()
        };

        QueueMetrics {
            org_slug,
            queue: queue.to_string(),
            scheduled_jobs: counts.map_or(0, |c| c.scheduled),
            running_jobs: counts.map_or(0, |c| c.running),
        }
    }
}
