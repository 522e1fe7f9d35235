//! Rate limit configuration and counter state.

use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised while constructing rate limit configuration.
///
/// These are programmer errors and surface at startup, never from a check.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvalidConfig {
    #[error("window duration must be greater than zero")]
    ZeroWindow,
    #[error("max_requests must be greater than zero")]
    ZeroMaxRequests,
    #[error("window duration {0:?} is out of range")]
    WindowOutOfRange(Duration),
    #[error("rule must set either window_secs and max_requests or requests_per_unit and unit")]
    Incomplete,
    #[error("operation '{0}' is defined more than once")]
    DuplicateOperation(String),
    #[error("rule '{operation}': {source}")]
    Rule {
        operation: String,
        #[source]
        source: Box<InvalidConfig>,
    },
}

/// What to do with a request when the counter store cannot be reached.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureMode {
    /// Let the request through and emit a warning.
    #[default]
    Open,
    /// Treat the request as denied.
    Closed,
}

/// Quota configuration for one operation.
///
/// Immutable once built; `new` rejects zero windows and zero limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitConfig {
    window: Duration,
    window_delta: TimeDelta,
    max_requests: u64,
    failure_mode: FailureMode,
}

impl RateLimitConfig {
    /// Create a fail-open configuration.
    pub fn new(window: Duration, max_requests: u64) -> Result<Self, InvalidConfig> {
        if window.is_zero() {
            return Err(InvalidConfig::ZeroWindow);
        }
        if max_requests == 0 {
            return Err(InvalidConfig::ZeroMaxRequests);
        }
        let window_delta =
            TimeDelta::from_std(window).map_err(|_| InvalidConfig::WindowOutOfRange(window))?;

        Ok(Self {
            window,
            window_delta,
            max_requests,
            failure_mode: FailureMode::Open,
        })
    }

    /// Create a fail-closed configuration for sensitive operations.
    pub fn sensitive(window: Duration, max_requests: u64) -> Result<Self, InvalidConfig> {
        Ok(Self::new(window, max_requests)?.with_failure_mode(FailureMode::Closed))
    }

    pub fn with_failure_mode(mut self, failure_mode: FailureMode) -> Self {
        self.failure_mode = failure_mode;
        self
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// The window as a signed delta for timestamp arithmetic.
    pub fn window_delta(&self) -> TimeDelta {
        self.window_delta
    }

    /// Window length in whole seconds, rounded up.
    pub fn window_secs(&self) -> u64 {
        self.window.as_secs() + u64::from(self.window.subsec_nanos() > 0)
    }

    pub fn max_requests(&self) -> u64 {
        self.max_requests
    }

    pub fn failure_mode(&self) -> FailureMode {
        self.failure_mode
    }

    pub fn is_fail_closed(&self) -> bool {
        self.failure_mode == FailureMode::Closed
    }
}

/// Counter state for one key inside its current window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterEntry {
    /// Requests seen in this window, including denied ones
    pub count: u64,
    /// The instant the window closes
    pub reset_time: DateTime<Utc>,
}

impl CounterEntry {
    /// Open a new window at `now` with a single request counted.
    pub fn open(now: DateTime<Utc>, window: TimeDelta) -> Self {
        Self {
            count: 1,
            reset_time: now + window,
        }
    }

    /// A window is closed from its reset instant onward.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.reset_time
    }
}

/// Remaining quota reported for an admitted request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Quota {
    pub limit: u64,
    pub remaining: u64,
    pub reset_time: DateTime<Utc>,
}
