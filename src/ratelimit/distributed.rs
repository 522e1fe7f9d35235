//! Distributed counter store backed by Redis.
//!
//! Each key lives in Redis as a plain integer with a TTL equal to the window.
//! The TTL is armed by the request that opens the window, so expiry is left
//! entirely to Redis and no local sweep is needed.
//!
//! Increments are linearizable because Redis runs the whole script
//! atomically. A replica-read or eventually consistent deployment loses that
//! property and only the bounded overcount of the fixed window remains.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::TimeDelta;
use redis::aio::ConnectionManager;
use tracing::{debug, info, trace, warn};

use super::backend::{Store, StoreError};
use super::clock::{Clock, SystemClock};
use super::counter::CounterEntry;
use super::key::RateLimitKey;

/// Default prefix for counter keys.
pub const DEFAULT_KEY_PREFIX: &str = "ratewarden";
/// Default bound on a single store round trip.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(250);

const INCREMENT_SCRIPT: &str = r#"
local count = redis.call("INCR", KEYS[1])
local ttl = redis.call("PTTL", KEYS[1])

if count == 1 or ttl < 0 then
    redis.call("PEXPIRE", KEYS[1], ARGV[1])
    ttl = tonumber(ARGV[1])
end

return {count, ttl}
"#;

/// Options for a [`RedisStore`].
#[derive(Debug, Clone)]
pub struct RedisStoreOptions {
    /// Prepended to every counter key
    pub prefix: String,
    /// Bound on each round trip, including the initial connect
    pub timeout: Duration,
}

impl Default for RedisStoreOptions {
    fn default() -> Self {
        Self {
            prefix: DEFAULT_KEY_PREFIX.to_string(),
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

/// Counter store shared by every instance that talks to the same Redis.
pub struct RedisStore {
    connection_manager: ConnectionManager,
    script: redis::Script,
    prefix: String,
    timeout: Duration,
    clock: Arc<dyn Clock>,
}

impl RedisStore {
    /// Connect to Redis at `url`.
    pub async fn connect(url: &str, options: RedisStoreOptions) -> Result<Self, StoreError> {
        info!(prefix = %options.prefix, timeout = ?options.timeout, "Connecting to Redis counter store");

        let client = redis::Client::open(url)?;
        let connection_manager = tokio::time::timeout(options.timeout, client.get_connection_manager())
            .await
            .map_err(|_| StoreError::Timeout(options.timeout))??;

        Ok(Self::from_connection_manager(connection_manager, options))
    }

    /// Build a store on an existing connection.
    pub fn from_connection_manager(
        connection_manager: ConnectionManager,
        options: RedisStoreOptions,
    ) -> Self {
        Self {
            connection_manager,
            script: redis::Script::new(INCREMENT_SCRIPT),
            prefix: options.prefix,
            timeout: options.timeout,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// The Redis key holding the counter for `key`.
    pub fn redis_key(&self, key: &RateLimitKey) -> String {
        redis_key(&self.prefix, key)
    }
}

fn redis_key(prefix: &str, key: &RateLimitKey) -> String {
    format!("{}:{}", prefix, key)
}

fn window_millis(window: Duration) -> u64 {
    u64::try_from(window.as_millis()).unwrap_or(u64::MAX).max(1)
}

#[async_trait]
impl Store for RedisStore {
    async fn increment(
        &self,
        key: &RateLimitKey,
        window: Duration,
    ) -> Result<CounterEntry, StoreError> {
        let redis_key = self.redis_key(key);
        let mut connection_manager = self.connection_manager.clone();

        trace!(key = %redis_key, "Incrementing distributed counter");

        let mut invocation = self.script.key(&redis_key);
        invocation.arg(window_millis(window));
        let reply: Result<redis::RedisResult<(i64, i64)>, _> = tokio::time::timeout(
            self.timeout,
            invocation.invoke_async(&mut connection_manager),
        )
        .await;

        let (count, ttl_ms) = match reply {
            Ok(Ok(reply)) => reply,
            Ok(Err(e)) => {
                warn!(key = %redis_key, error = %e, "Redis increment failed");
                return Err(e.into());
            }
            Err(_) => {
                warn!(key = %redis_key, timeout = ?self.timeout, "Redis increment timed out");
                return Err(StoreError::Timeout(self.timeout));
            }
        };

        let count = u64::try_from(count)
            .ok()
            .filter(|count| *count > 0)
            .ok_or_else(|| StoreError::Malformed(format!("counter value {}", count)))?;
        if ttl_ms < 0 {
            return Err(StoreError::Malformed(format!("ttl {}", ttl_ms)));
        }

        if count == 1 {
            debug!(key = %redis_key, ttl_ms = ttl_ms, "Opened distributed window");
        }

        Ok(CounterEntry {
            count,
            reset_time: self.clock.now() + TimeDelta::milliseconds(ttl_ms),
        })
    }

    async fn sweep(&self) -> Result<usize, StoreError> {
        // Redis expires keys on its own.
        Ok(0)
    }

    fn name(&self) -> &'static str {
        "redis"
    }
}
