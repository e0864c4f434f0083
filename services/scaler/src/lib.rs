//! gce-scaler
//!
//! Keeps a Compute Engine instance group sized to the pending work on a
//! Buildkite queue. Each pass compares scheduled + running jobs against live
//! instances and launches the shortfall, bounded by a concurrency cap.
//!
//! ## Architecture
//!
//! - **Worker**: ticks the reconciler once or on an interval
//! - **Reconciler**: demand/supply diff and bounded concurrent launches
//! - **Buildkite client**: queue job counts
//! - **Fleet client**: live instance count, instance launch, operation waits
//! - **Stats**: optional statsd gauges

pub mod buildkite;
pub mod cli;
pub mod config;
pub mod fleet;
pub mod reconciler;
pub mod stats;
pub mod worker;

// Re-export commonly used types
pub use buildkite::{BuildkiteClient, QueueMetrics, QueueMetricsSource};
pub use config::Config;
pub use fleet::{ComputeClient, FleetClient, FleetError, LaunchRequest};
pub use reconciler::{Reconciler, TickError, TickReport};
pub use worker::{ScalerError, ScalerWorker};
