// Keep-alive restart decisions.
//
// The tracker never sleeps; it hands the engine a delay and the engine's
// heartbeat dispatches the restart once the delay has passed.

use crate::config::RestartPolicyConfig;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Exponential backoff bounds for automatic restarts.
#[derive(Debug, Clone, PartialEq)]
pub struct RestartPolicy {
    pub min_interval: Duration,
    pub backoff_rate: f64,
    pub max_interval: Duration,
    pub reset_after: Duration,
    pub max_consecutive_failures: u32,
    pub check_interval: Duration,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self::from(&RestartPolicyConfig::default())
    }
}

impl From<&RestartPolicyConfig> for RestartPolicy {
    fn from(config: &RestartPolicyConfig) -> Self {
        Self {
            min_interval: config.min_interval,
            backoff_rate: config.backoff_rate,
            max_interval: config.max_interval,
            reset_after: config.reset_after,
            max_consecutive_failures: config.max_consecutive_failures,
            check_interval: config.check_interval,
        }
    }
}

impl RestartPolicy {
    /// Delay before the restart following the `failures`-th consecutive
    /// failure: `min_interval * backoff_rate^(failures - 1)`, capped at
    /// `max_interval`.
    pub fn delay_for(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(i32::MAX as u32) as i32;
        let secs = self.min_interval.as_secs_f64() * self.backoff_rate.powi(exponent);
        let max = self.max_interval.as_secs_f64();

        if !secs.is_finite() || secs >= max {
            self.max_interval
        } else {
            Duration::from_secs_f64(secs)
        }
    }
}

/// What to do after an unexpected exit of a keep-alive process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartDecision {
    RestartAfter(Duration),
    GiveUp { failures: u32 },
}

/// Per-record consecutive failure accounting.
#[derive(Debug, Clone, Default)]
pub struct RestartTracker {
    consecutive_failures: u32,
    last_launch: Option<Instant>,
}

impl RestartTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn record_launch(&mut self, at: Instant) {
        self.last_launch = Some(at);
    }

    /// User-requested start or restart: forget past failures.
    pub fn reset(&mut self) {
        if self.consecutive_failures > 0 {
            debug!(
                "Clearing {} consecutive failure(s)",
                self.consecutive_failures
            );
        }
        self.consecutive_failures = 0;
    }

    /// The live process of a keep-alive record ended on its own.
    ///
    /// A run that lasted at least `reset_after` counts as healthy and starts
    /// a fresh failure sequence.
    pub fn on_unexpected_exit(&mut self, policy: &RestartPolicy, now: Instant) -> RestartDecision {
        if let Some(launched) = self.last_launch.take() {
            if now.saturating_duration_since(launched) >= policy.reset_after {
                self.consecutive_failures = 0;
            }
        }
        self.record_failure(policy)
    }

    /// An automatic relaunch could not create the process.
    pub fn on_launch_failure(&mut self, policy: &RestartPolicy) -> RestartDecision {
        self.record_failure(policy)
    }

    fn record_failure(&mut self, policy: &RestartPolicy) -> RestartDecision {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);

        if self.consecutive_failures >= policy.max_consecutive_failures {
            warn!(
                "Giving up after {} consecutive failure(s)",
                self.consecutive_failures
            );
            return RestartDecision::GiveUp {
                failures: self.consecutive_failures,
            };
        }

        RestartDecision::RestartAfter(policy.delay_for(self.consecutive_failures))
    }
}
