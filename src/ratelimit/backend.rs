//! Counter store trait for abstracting local and distributed implementations.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use super::counter::CounterEntry;
use super::distributed::RedisStore;
use super::key::RateLimitKey;
use super::local::LocalStore;

/// Failures of the underlying counter medium.
///
/// Every variant means "the store could not answer"; none of them is ever
/// interpreted as "no entry".
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("store round trip exceeded {0:?}")]
    Timeout(Duration),
    #[error("store backend failure: {0}")]
    Backend(String),
    #[error("store returned malformed data: {0}")]
    Malformed(String),
}

impl From<redis::RedisError> for StoreError {
    fn from(err: redis::RedisError) -> Self {
        StoreError::Backend(err.to_string())
    }
}

/// Trait for counter store implementations.
///
/// This trait abstracts over both the in-process `LocalStore` and the
/// Redis-backed `RedisStore` so the limiter works with either.
#[async_trait]
pub trait Store: Send + Sync {
    /// Count one request against `key`.
    ///
    /// Opens a new window of length `window` when no live entry exists,
    /// otherwise increments the live one. Concurrent callers never observe
    /// the same post-increment count for the same window.
    async fn increment(
        &self,
        key: &RateLimitKey,
        window: Duration,
    ) -> Result<CounterEntry, StoreError>;

    /// Remove entries whose window has closed. Returns how many were removed.
    async fn sweep(&self) -> Result<usize, StoreError>;

    /// Short backend name for logs and health output.
    fn name(&self) -> &'static str;
}

/// The configured store, selected at startup.
#[derive(Clone)]
pub enum StoreBackend {
    Local(Arc<LocalStore>),
    Redis(Arc<RedisStore>),
}

impl StoreBackend {
    pub fn as_store(&self) -> Arc<dyn Store> {
        match self {
            StoreBackend::Local(store) => store.clone(),
            StoreBackend::Redis(store) => store.clone(),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            StoreBackend::Local(store) => store.name(),
            StoreBackend::Redis(store) => store.name(),
        }
    }
}

impl std::fmt::Debug for StoreBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("StoreBackend").field(&self.name()).finish()
    }
}
