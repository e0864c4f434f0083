//! Gauge emission.
//!
//! Gauges go out as plain statsd datagrams (`name:value|g`) over UDP, which
//! DogStatsD agents accept as well. With no address configured the scaler
//! uses [`NoopStats`].

use async_trait::async_trait;
use tokio::net::UdpSocket;
use tracing::debug;

/// Gauge for jobs waiting on the queue.
pub const SCHEDULED_JOBS: &str = "buildkite-gcp-autoscaler.scheduled_jobs";

/// Gauge for jobs currently running on the queue.
pub const RUNNING_JOBS: &str = "buildkite-gcp-autoscaler.running_jobs";

/// Gauge for live instances in the group.
pub const LIVE_INSTANCES: &str = "buildkite-gcp-autoscaler.live_instance";

/// Destination for per-tick gauges. Emission never fails the tick.
#[async_trait]
pub trait StatsSink: Send + Sync {
    async fn gauge(&self, name: &str, value: i64);
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopStats;

#[async_trait]
impl StatsSink for NoopStats {
    async fn gauge(&self, _name: &str, _value: i64) {}
}

/// statsd sink over UDP.
#[derive(Debug)]
pub struct StatsdSink {
    socket: UdpSocket,
}

impl StatsdSink {
    /// Bind an ephemeral local socket and connect it to `addr` (`host:port`).
    pub async fn connect(addr: &str) -> std::io::Result<Self> {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        socket.connect(addr).await?;
        Ok(Self { socket })
    }
}

#[async_trait]
impl StatsSink for StatsdSink {
    async fn gauge(&self, name: &str, value: i64) {
        let datagram = format!("{}:{}|g", name, value);
        if let Err(e) = self.socket.send(datagram.as_bytes()).await {
            debug!(metric = name, error = %e, "Failed to send gauge");
        }
    }
}
