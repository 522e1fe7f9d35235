//! Rate limiting logic and counter storage.

mod backend;
mod clock;
mod counter;
mod distributed;
mod key;
mod limiter;
mod local;
mod rules;

pub use backend::{Store, StoreBackend, StoreError};
pub use clock::{Clock, ManualClock, SystemClock};
pub use counter::{CounterEntry, FailureMode, InvalidConfig, Quota, RateLimitConfig};
pub use distributed::{RedisStore, RedisStoreOptions, DEFAULT_KEY_PREFIX, DEFAULT_TIMEOUT};
pub use key::RateLimitKey;
pub use limiter::{RateLimitError, RateLimiter};
pub use local::{LocalStore, Sweeper};
pub use rules::{ConfigRegistry, ConfigRegistryBuilder, LimitSpec, RuleSpec, RulesFile, TimeUnit};
