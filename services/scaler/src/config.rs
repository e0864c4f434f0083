//! Configuration for the scaler.
//!
//! Built once at startup from CLI flags (with environment fallbacks) and
//! never mutated afterwards.

use std::time::Duration;

use thiserror::Error;
use tokio::sync::Semaphore;

use crate::cli::RunArgs;

/// Default Buildkite agent API endpoint.
pub const DEFAULT_BUILDKITE_ENDPOINT: &str = "https://agent.buildkite.com/v3";

/// Default Compute Engine API endpoint.
pub const DEFAULT_COMPUTE_ENDPOINT: &str = "https://compute.googleapis.com/compute/v1";

/// Configuration errors. All are fatal at startup.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing required setting: {0}")]
    Missing(&'static str),

    #[error("invalid --{flag} {value:?}: {reason}")]
    InvalidDuration {
        flag: &'static str,
        value: String,
        reason: String,
    },

    #[error("concurrency must be greater than zero")]
    ZeroConcurrency,

    #[error("concurrency {value} exceeds the maximum of {max}")]
    ConcurrencyTooHigh { value: usize, max: usize },

    #[error("max run duration must be greater than zero, got {0}")]
    InvalidMaxRunDuration(i64),
}

/// Scaler configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Buildkite organization slug.
    pub org_slug: String,

    /// Buildkite agent token used for the metrics API.
    pub buildkite_token: String,

    /// Queue whose demand drives scaling.
    pub buildkite_queue: String,

    /// Buildkite agent API base URL.
    pub buildkite_endpoint: String,

    /// GCP project ID.
    pub project: String,

    /// GCP zone.
    pub zone: String,

    /// Unmanaged instance group that launched instances join.
    pub instance_group: String,

    /// Instance template used for new instances.
    pub instance_template: String,

    /// Compute Engine API base URL.
    pub compute_endpoint: String,

    /// Static OAuth access token. Falls back to the metadata server when unset.
    pub google_access_token: Option<String>,

    /// Maximum launches in flight at once.
    pub concurrency: usize,

    /// Time between ticks. `None` runs a single pass.
    pub poll_interval: Option<Duration>,

    /// Seconds an instance may run before the provider deletes it.
    pub max_run_duration_secs: i64,

    /// statsd `host:port` for gauges.
    pub statsd_addr: Option<String>,

    /// Give up waiting on a provider operation after this long.
    pub operation_timeout: Option<Duration>,

    /// Enable debug logging.
    pub debug: bool,
}

impl Config {
    /// Validate CLI arguments into a configuration.
    pub fn from_args(args: &RunArgs) -> Result<Self, ConfigError> {
        let poll_interval = match args.interval.as_deref().map(str::trim) {
            None | Some("") => None,
            Some(value) => Some(parse_duration("interval", value)?),
        };

        let operation_timeout = match args.operation_timeout.as_deref().map(str::trim) {
            None | Some("") => None,
            Some(value) => Some(parse_duration("operation-timeout", value)?),
        };

        if args.concurrency == 0 {
            return Err(ConfigError::ZeroConcurrency);
        }
        if args.concurrency > Semaphore::MAX_PERMITS {
            return Err(ConfigError::ConcurrencyTooHigh {
                value: args.concurrency,
                max: Semaphore::MAX_PERMITS,
            });
        }

        if args.max_run_duration <= 0 {
            return Err(ConfigError::InvalidMaxRunDuration(args.max_run_duration));
        }

        Ok(Self {
            org_slug: args.org.clone().unwrap_or_default(),
            buildkite_token: required(&args.buildkite_token, "buildkite-token")?,
            buildkite_queue: args.buildkite_queue.clone(),
            buildkite_endpoint: args
                .buildkite_endpoint
                .trim_end_matches('/')
                .to_string(),
            project: required(&args.gcp_project, "gcp-project")?,
            zone: required(&args.gcp_zone, "gcp-zone")?,
            instance_group: required(&args.instance_group, "instance-group")?,
            instance_template: required(&args.instance_template, "instance-template")?,
            compute_endpoint: args.compute_endpoint.trim_end_matches('/').to_string(),
            google_access_token: args
                .google_access_token
                .clone()
                .filter(|token| !token.is_empty()),
            concurrency: args.concurrency,
            poll_interval,
            max_run_duration_secs: args.max_run_duration,
            statsd_addr: args.datadog.clone().filter(|addr| !addr.is_empty()),
            operation_timeout,
            debug: args.debug,
        })
    }

    /// Default log directive for this configuration.
    pub fn log_level(&self) -> &'static str {
        if self.debug {
            "debug"
        } else {
            "info"
        }
    }
}

fn required(value: &Option<String>, name: &'static str) -> Result<String, ConfigError> {
    match value.as_deref().map(str::trim) {
        Some(v) if !v.is_empty() => Ok(v.to_string()),
        _ => Err(ConfigError::Missing(name)),
    }
}

/// Parse a Go-style duration such as `30s`, `1m30s`, `1.5h` or `250ms`.
///
/// A unit is required on every component. Zero is rejected since a zero
/// interval would spin. `flag` names the setting in errors.
pub fn parse_duration(flag: &'static str, value: &str) -> Result<Duration, ConfigError> {
    let invalid = |reason: &str| ConfigError::InvalidDuration {
        flag,
        value: value.to_string(),
        reason: reason.to_string(),
    };

    if value.is_empty() {
        return Err(invalid("empty duration"));
    }

    let mut total = Duration::ZERO;
    let mut rest = value;

    while !rest.is_empty() {
        let number_len = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .ok_or_else(|| invalid("missing unit"))?;
        if number_len == 0 {
            return Err(invalid("expected a number"));
        }

        let number: f64 = rest[..number_len]
            .parse()
            .map_err(|_| invalid("malformed number"))?;
        rest = &rest[number_len..];

        let unit_len = rest
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(rest.len());
        let nanos_per_unit = match &rest[..unit_len] {
            "ns" => 1.0,
            "us" | "µs" => 1e3,
            "ms" => 1e6,
            "s" => 1e9,
            "m" => 60e9,
            "h" => 3600e9,
            _ => return Err(invalid("unknown unit")),
        };
        rest = &rest[unit_len..];

        let nanos = (number * nanos_per_unit).round();
        if nanos >= u64::MAX as f64 {
            return Err(invalid("out of range"));
        }
        total = total
            .checked_add(Duration::from_nanos(nanos as u64))
            .ok_or_else(|| invalid("out of range"))?;
    }

    if total.is_zero() {
        return Err(invalid("must be greater than zero"));
    }

    Ok(total)
}
