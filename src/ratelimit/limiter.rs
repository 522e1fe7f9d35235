//! Core rate limiter implementation.
//!
//! Fixed-window counting: each key holds one counter per window and the
//! window is opened by the first request that finds no live entry. Memory and
//! work per check are O(1).
//!
//! A fixed window admits up to `2 * max_requests` requests inside any rolling
//! interval that straddles a boundary (a full quota at the tail of one window
//! plus a full quota at the head of the next). That overcount is bounded and
//! accepted.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{debug, trace, warn};

use super::backend::{Store, StoreError};
use super::counter::{Quota, RateLimitConfig};
use super::key::RateLimitKey;
use super::rules::ConfigRegistry;

/// Why a check did not admit the request.
#[derive(Debug, Clone, Error)]
pub enum RateLimitError {
    /// The quota for this window is used up.
    #[error("rate limit exceeded, resets at {reset_time}")]
    Exceeded {
        reset_time: DateTime<Utc>,
        limit: u64,
    },
    /// The counter store could not answer.
    #[error("rate limit store unavailable: {0}")]
    StoreUnavailable(#[from] StoreError),
    /// A named check referenced an operation the registry does not know.
    #[error("no rate limit configured for operation '{0}'")]
    UnknownOperation(String),
}

/// Applies quota configurations against a counter store.
///
/// This struct is thread-safe and can be shared across multiple tasks. It
/// never retries a failed store call.
pub struct RateLimiter {
    store: Arc<dyn Store>,
    registry: Arc<ConfigRegistry>,
}

impl RateLimiter {
    /// Create a new rate limiter over `store` with an empty registry.
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self::with_registry(store, Arc::new(ConfigRegistry::empty()))
    }

    pub fn with_registry(store: Arc<dyn Store>, registry: Arc<ConfigRegistry>) -> Self {
        Self { store, registry }
    }

    /// Count one request for `identifier` against `operation`.
    ///
    /// Denied requests are still counted, so hammering a closed quota never
    /// shortens the window.
    pub async fn check(
        &self,
        identifier: &str,
        operation: &str,
        config: &RateLimitConfig,
    ) -> Result<Quota, RateLimitError> {
        let key = RateLimitKey::new(identifier, operation);

        trace!(key = %key, limit = config.max_requests(), "Checking rate limit");

        let entry = self
            .store
            .increment(&key, config.window())
            .await
            .map_err(|e| {
                warn!(
                    key = %key,
                    store = self.store.name(),
                    error = %e,
                    "Rate limit store unavailable"
                );
                RateLimitError::StoreUnavailable(e)
            })?;

        let limit = config.max_requests();
        if entry.count <= limit {
            Ok(Quota {
                limit,
                remaining: limit - entry.count,
                reset_time: entry.reset_time,
            })
        } else {
            debug!(
                key = %key,
                count = entry.count,
                limit = limit,
                reset_time = %entry.reset_time,
                "Rate limit exceeded"
            );
            Err(RateLimitError::Exceeded {
                reset_time: entry.reset_time,
                limit,
            })
        }
    }

    /// Check against the configuration registered for `operation`.
    pub async fn check_named(
        &self,
        identifier: &str,
        operation: &str,
    ) -> Result<Quota, RateLimitError> {
        let config = self
            .registry
            .get(operation)
            .copied()
            .ok_or_else(|| RateLimitError::UnknownOperation(operation.to_string()))?;
        self.check(identifier, operation, &config).await
    }

    /// Run a sweep on the underlying store.
    pub async fn sweep(&self) -> Result<usize, StoreError> {
        self.store.sweep().await
    }

    pub fn registry(&self) -> &Arc<ConfigRegistry> {
        &self.registry
    }

    pub fn store_name(&self) -> &'static str {
        self.store.name()
    }
}
