//! Reconciliation primitives for the instance group scaler.
//!
//! This library holds the pure parts of a scaling pass, with no I/O:
//!
//! - **Launch plan**: how many instances to start given queue demand and
//!   live supply.
//! - **Backoff policy**: delays between operation status polls.
//! - **Poll decision**: what to do after observing a provider operation.
//!
//! # Invariants
//!
//! - `required_launches` is never negative
//! - Decisions are deterministic given the same inputs (jitter aside)
//! - Only an in-progress operation is ever retried

use std::time::Duration;

use rand::Rng;

/// Launch plan for a single reconciliation pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaunchPlan {
    /// Jobs scheduled or running against the queue.
    pub demand: i64,

    /// Instances currently provisioning or running.
    pub live: i64,

    /// Instances to launch this pass.
    pub required_launches: i64,
}

impl LaunchPlan {
    /// Compute the plan from raw counts.
    ///
    /// Negative counts are treated as zero and the demand sum saturates.
    pub fn compute(scheduled_jobs: i64, running_jobs: i64, live_instances: i64) -> Self {
        let demand = scheduled_jobs.max(0).saturating_add(running_jobs.max(0));
        let live = live_instances.max(0);
        let required_launches = demand.saturating_sub(live).max(0);

        Self {
            demand,
            live,
            required_launches,
        }
    }

    /// Returns true if the fleet already covers demand.
    pub fn is_noop(&self) -> bool {
        self.required_launches == 0
    }
}

// =============================================================================
// Backoff Policy
// =============================================================================

/// Exponential backoff between operation polls.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    /// Delay before the first re-poll.
    pub initial: Duration,

    /// Growth factor per attempt.
    pub multiplier: f64,

    /// Upper bound for a single delay.
    pub max_interval: Duration,

    /// Randomization factor (0.0 to 1.0).
    pub jitter: f64,

    /// Give up once this much time has elapsed. `None` polls until cancelled.
    pub max_elapsed: Option<Duration>,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(500),
            multiplier: 1.5,
            max_interval: Duration::from_secs(60),
            jitter: 0.5,
            max_elapsed: None,
        }
    }
}

impl BackoffPolicy {
    /// Policy without randomization. Delays are exact.
    pub fn deterministic(initial: Duration, multiplier: f64, max_interval: Duration) -> Self {
        Self {
            initial,
            multiplier,
            max_interval,
            jitter: 0.0,
            max_elapsed: None,
        }
    }

    /// Set the elapsed-time ceiling.
    pub fn with_max_elapsed(mut self, max_elapsed: Option<Duration>) -> Self {
        self.max_elapsed = max_elapsed;
        self
    }

    /// Calculate delay for the given attempt number (0-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(i32::MAX as u32) as i32;
        let base = self.initial.as_secs_f64() * self.multiplier.powi(exponent);
        let base = base.min(self.max_interval.as_secs_f64());

        let jitter = self.jitter.clamp(0.0, 1.0);
        let delay = if jitter > 0.0 {
            let spread = base * jitter;
            rand::rng().random_range((base - spread)..=(base + spread))
        } else {
            base
        };

        Duration::from_secs_f64(delay.max(0.0))
    }
}

// =============================================================================
// Operation Polling
// =============================================================================

/// Status of a provider operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationStatus {
    Pending,
    Running,
    Done,
    /// Status string we do not recognise. Treated as in progress.
    Other(String),
}

impl OperationStatus {
    /// Parse a provider status string.
    pub fn parse(status: &str) -> Self {
        match status {
            "PENDING" => Self::Pending,
            "RUNNING" => Self::Running,
            "DONE" => Self::Done,
            other => Self::Other(other.to_string()),
        }
    }
}

impl std::fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OperationStatus::Pending => write!(f, "PENDING"),
            OperationStatus::Running => write!(f, "RUNNING"),
            OperationStatus::Done => write!(f, "DONE"),
            OperationStatus::Other(s) => write!(f, "{}", s),
        }
    }
}

/// One error reported on an operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationIssue {
    pub code: String,
    pub message: String,
}

impl std::fmt::Display for OperationIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

/// A single observation of an operation's state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationObservation {
    pub status: OperationStatus,
    pub issues: Vec<OperationIssue>,
}

/// What the poller should do next.
#[derive(Debug, Clone, PartialEq)]
pub enum PollAction {
    /// Still in progress; poll again after the delay.
    RetryAfter(Duration),

    /// Operation finished cleanly.
    Succeeded,

    /// Operation reported errors. Never retried.
    Failed(Vec<OperationIssue>),

    /// Elapsed ceiling reached while still in progress.
    TimedOut { elapsed: Duration },
}

/// Decide the next step after observing an operation.
///
/// `attempt` counts polls already made (0 for the first). Reported errors win
/// over status: an operation can be `DONE` and still carry errors.
pub fn next_poll_action(
    observation: &OperationObservation,
    attempt: u32,
    elapsed: Duration,
    policy: &BackoffPolicy,
) -> PollAction {
    if !observation.issues.is_empty() {
        return PollAction::Failed(observation.issues.clone());
    }

    if observation.status == OperationStatus::Done {
        return PollAction::Succeeded;
    }

    let delay = policy.delay(attempt);
    if let Some(max_elapsed) = policy.max_elapsed {
        if elapsed + delay > max_elapsed {
            return PollAction::TimedOut { elapsed };
        }
    }

    PollAction::RetryAfter(delay)
}

/// Summarise operation issues into one line.
pub fn summarize_issues(issues: &[OperationIssue]) -> String {
    issues
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Default number of concurrent launches.
pub const DEFAULT_CONCURRENCY: usize = 10;

/// Default maximum instance run duration.
pub const DEFAULT_MAX_RUN_DURATION_SECS: i64 = 3600;
