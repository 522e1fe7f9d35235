//! Request guard: the boundary between HTTP handlers and the rate limiter.
//!
//! The guard resolves who is calling, runs the check, and either forwards to
//! the wrapped handler or answers with a 429 itself. Both paths carry the
//! same hardening headers. A denied request never reaches the handler.

use std::future::Future;
use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::header::{HeaderMap, HeaderName, HeaderValue, RETRY_AFTER};
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, Utc};
use serde_json::json;
use tracing::{debug, error, warn};

use super::headers::{apply_security_headers, HeaderOptions};
use crate::error::{Result, WardenError};
use crate::ratelimit::{
    Clock, FailureMode, Quota, RateLimitConfig, RateLimitError, RateLimiter, SystemClock,
};

/// Identifier used when nothing else identifies the caller.
pub const ANONYMOUS: &str = "anonymous";

pub const X_RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
pub const X_RATELIMIT_WINDOW: HeaderName = HeaderName::from_static("x-ratelimit-window");
pub const X_RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");

const X_FORWARDED_FOR: &str = "x-forwarded-for";
const X_REAL_IP: &str = "x-real-ip";

/// Principal id placed in request extensions by the authentication layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticatedPrincipal(pub String);

/// The identifier a request is counted under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallerIdentity(String);

impl CallerIdentity {
    /// Resolve the caller: authenticated principal, then the first forwarded
    /// address, then [`ANONYMOUS`]. Values are used verbatim.
    pub fn resolve(principal: Option<&AuthenticatedPrincipal>, headers: &HeaderMap) -> Self {
        if let Some(AuthenticatedPrincipal(id)) = principal.filter(|p| !p.0.is_empty()) {
            return Self(id.clone());
        }

        let forwarded = headers
            .get(X_FORWARDED_FOR)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .map(str::trim)
            .filter(|v| !v.is_empty());
        let real_ip = || {
            headers
                .get(X_REAL_IP)
                .and_then(|v| v.to_str().ok())
                .map(str::trim)
                .filter(|v| !v.is_empty())
        };

        match forwarded.or_else(real_ip) {
            Some(address) => Self(address.to_string()),
            None => Self::anonymous(),
        }
    }

    pub fn anonymous() -> Self {
        Self(ANONYMOUS.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for CallerIdentity {
    fn from(identifier: &str) -> Self {
        Self(identifier.to_string())
    }
}

impl std::fmt::Display for CallerIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Outcome of a guarded check.
#[derive(Debug)]
pub enum Verdict {
    /// Run the handler. `None` when the store was down and the operation is
    /// fail-open.
    Proceed(Option<Quota>),
    /// Answer with this response instead.
    Reject(Response),
}

/// Wraps handlers with rate limiting.
#[derive(Clone)]
pub struct RequestGuard {
    limiter: Arc<RateLimiter>,
    header_options: HeaderOptions,
    clock: Arc<dyn Clock>,
}

impl RequestGuard {
    pub fn new(limiter: Arc<RateLimiter>, header_options: HeaderOptions) -> Self {
        Self {
            limiter,
            header_options,
            clock: Arc::new(SystemClock),
        }
    }

    /// Use `clock` for retry hints. Should match the store's clock.
    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    pub fn header_options(&self) -> HeaderOptions {
        self.header_options
    }

    /// Run the check and decide what happens to the request.
    pub async fn evaluate(
        &self,
        identity: &CallerIdentity,
        operation: &str,
        config: &RateLimitConfig,
    ) -> Verdict {
        match self.limiter.check(identity.as_str(), operation, config).await {
            Ok(quota) => Verdict::Proceed(Some(quota)),
            Err(RateLimitError::Exceeded { reset_time, .. }) => {
                debug!(identifier = %identity, operation = operation, "Request throttled");
                Verdict::Reject(self.deny(config, reset_time))
            }
            Err(RateLimitError::StoreUnavailable(e)) => match config.failure_mode() {
                FailureMode::Open => {
                    warn!(
                        identifier = %identity,
                        operation = operation,
                        error = %e,
                        "Rate limit store unavailable, failing open"
                    );
                    Verdict::Proceed(None)
                }
                FailureMode::Closed => {
                    warn!(
                        identifier = %identity,
                        operation = operation,
                        error = %e,
                        "Rate limit store unavailable, failing closed"
                    );
                    let reset_time = self.clock.now() + config.window_delta();
                    Verdict::Reject(self.deny(config, reset_time))
                }
            },
            Err(e @ RateLimitError::UnknownOperation(_)) => {
                error!(operation = operation, error = %e, "Guarded operation has no quota");
                Verdict::Reject(self.internal_error())
            }
        }
    }

    /// Run `handler` if the caller is within quota for `operation`.
    ///
    /// Whatever the handler returns, error responses included, is passed
    /// through with the hardening headers added.
    pub async fn protect<F, Fut, R>(
        &self,
        identity: &CallerIdentity,
        operation: &str,
        config: &RateLimitConfig,
        handler: F,
    ) -> Response
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = R>,
        R: IntoResponse,
    {
        match self.evaluate(identity, operation, config).await {
            Verdict::Proceed(_) => {
                let mut response = handler().await.into_response();
                apply_security_headers(response.headers_mut(), self.header_options);
                response
            }
            Verdict::Reject(response) => response,
        }
    }

    /// Like [`protect`](Self::protect) with the registered quota for
    /// `operation`.
    pub async fn protect_named<F, Fut, R>(
        &self,
        identity: &CallerIdentity,
        operation: &str,
        handler: F,
    ) -> Response
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = R>,
        R: IntoResponse,
    {
        match self.limiter.registry().get(operation).copied() {
            Some(config) => self.protect(identity, operation, &config, handler).await,
            None => {
                error!(operation = operation, "Guarded operation has no quota");
                self.internal_error()
            }
        }
    }

    /// Bind this guard to a registered operation for use as middleware.
    pub fn bind(&self, operation: &str) -> Result<GuardedOperation> {
        let config = self
            .limiter
            .registry()
            .get(operation)
            .copied()
            .ok_or_else(|| {
                WardenError::Config(format!("no rate limit configured for '{}'", operation))
            })?;
        Ok(self.bind_with(operation, config))
    }

    /// Bind this guard to an operation with its own quota.
    pub fn bind_with(&self, operation: &str, config: RateLimitConfig) -> GuardedOperation {
        GuardedOperation {
            guard: self.clone(),
            operation: Arc::from(operation),
            config,
        }
    }

    /// The 429 response for a request denied until `reset_time`.
    pub fn deny(&self, config: &RateLimitConfig, reset_time: DateTime<Utc>) -> Response {
        // A denial always asks the caller to wait.
        let retry_after = retry_after_secs(reset_time, self.clock.now()).max(1);
        let body = Json(json!({
            "error": "rate_limited",
            "retry_after": retry_after,
        }));

        let mut response = (StatusCode::TOO_MANY_REQUESTS, body).into_response();
        let headers = response.headers_mut();
        headers.insert(RETRY_AFTER, HeaderValue::from(retry_after));
        headers.insert(X_RATELIMIT_LIMIT, HeaderValue::from(config.max_requests()));
        headers.insert(X_RATELIMIT_WINDOW, HeaderValue::from(config.window_secs()));
        apply_security_headers(headers, self.header_options);
        response
    }

    fn internal_error(&self) -> Response {
        let mut response = (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": "internal" })),
        )
            .into_response();
        apply_security_headers(response.headers_mut(), self.header_options);
        response
    }
}

/// Seconds until `reset_time`, rounded up.
pub fn retry_after_secs(reset_time: DateTime<Utc>, now: DateTime<Utc>) -> u64 {
    let remaining = reset_time - now;
    match remaining.num_nanoseconds() {
        Some(nanos) if nanos <= 0 => 0,
        Some(nanos) => (nanos as u64).div_ceil(1_000_000_000),
        // Beyond the i64 nanosecond range; whole seconds are precise enough.
        None => u64::try_from(remaining.num_seconds()).unwrap_or(0),
    }
}

/// A guard bound to one operation and quota.
#[derive(Clone)]
pub struct GuardedOperation {
    guard: RequestGuard,
    operation: Arc<str>,
    config: RateLimitConfig,
}

impl GuardedOperation {
    pub fn operation(&self) -> &str {
        &self.operation
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }
}

/// Middleware enforcing a [`GuardedOperation`].
///
/// ```ignore
/// let payments = guard.bind("payment")?;
/// let app = Router::new()
///     .route("/checkout", post(checkout))
///     .layer(axum::middleware::from_fn_with_state(payments, guard_layer));
/// ```
pub async fn guard_layer(
    State(bound): State<GuardedOperation>,
    request: Request,
    next: Next,
) -> Response {
    let principal = request.extensions().get::<AuthenticatedPrincipal>().cloned();
    let identity = CallerIdentity::resolve(principal.as_ref(), request.headers());

    bound
        .guard
        .protect(&identity, &bound.operation, &bound.config, || next.run(request))
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::headers::baseline_header_names;
    use crate::ratelimit::{
        ConfigRegistry, CounterEntry, LocalStore, ManualClock, RateLimitKey, Store, StoreError,
    };
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct UnavailableStore;

    #[async_trait]
    impl Store for UnavailableStore {
        async fn increment(
            &self,
            _key: &RateLimitKey,
            _window: Duration,
        ) -> std::result::Result<CounterEntry, StoreError> {
            Err(StoreError::Backend("connection refused".to_string()))
        }

        async fn sweep(&self) -> std::result::Result<usize, StoreError> {
            Ok(0)
        }

        fn name(&self) -> &'static str {
            "unavailable"
        }
    }

    fn local_guard() -> (RequestGuard, ManualClock) {
        let clock = ManualClock::default();
        let store = Arc::new(LocalStore::with_clock(clock.clone()));
        let registry = ConfigRegistry::builder()
            .operation("login", config(60, 3))
            .build()
            .unwrap();
        let limiter = Arc::new(RateLimiter::with_registry(store, Arc::new(registry)));
        let guard = RequestGuard::new(limiter, HeaderOptions::default()).with_clock(clock.clone());
        (guard, clock)
    }

    fn unavailable_guard() -> RequestGuard {
        let limiter = Arc::new(RateLimiter::new(Arc::new(UnavailableStore)));
        RequestGuard::new(limiter, HeaderOptions::default()).with_clock(ManualClock::default())
    }

    fn config(window_secs: u64, max_requests: u64) -> RateLimitConfig {
        RateLimitConfig::new(Duration::from_secs(window_secs), max_requests).unwrap()
    }

    fn assert_baseline_headers(response: &Response) {
        for name in baseline_header_names() {
            assert!(
                response.headers().contains_key(&name),
                "missing baseline header {}",
                name
            );
        }
    }

    fn header<'a>(response: &'a Response, name: &str) -> &'a str {
        response.headers().get(name).unwrap().to_str().unwrap()
    }

    #[test]
    fn test_identity_prefers_principal() {
        let mut headers = HeaderMap::new();
        headers.insert(X_FORWARDED_FOR, HeaderValue::from_static("203.0.113.7"));
        let principal = AuthenticatedPrincipal("user_42".to_string());

        let identity = CallerIdentity::resolve(Some(&principal), &headers);
        assert_eq!(identity.as_str(), "user_42");
    }

    #[test]
    fn test_identity_uses_first_forwarded_address() {
        let mut headers = HeaderMap::new();
        headers.insert(
            X_FORWARDED_FOR,
            HeaderValue::from_static(" 203.0.113.7 , 10.0.0.1"),
        );
        headers.insert(X_REAL_IP, HeaderValue::from_static("10.0.0.2"));

        let identity = CallerIdentity::resolve(None, &headers);
        assert_eq!(identity.as_str(), "203.0.113.7");
    }

    #[test]
    fn test_identity_falls_back_to_real_ip_then_anonymous() {
        let mut headers = HeaderMap::new();
        headers.insert(X_REAL_IP, HeaderValue::from_static("10.0.0.2"));
        assert_eq!(CallerIdentity::resolve(None, &headers).as_str(), "10.0.0.2");

        let empty_principal = AuthenticatedPrincipal(String::new());
        assert_eq!(
            CallerIdentity::resolve(Some(&empty_principal), &HeaderMap::new()).as_str(),
            ANONYMOUS
        );
    }

    #[test]
    fn test_retry_after_rounds_up() {
        let now = DateTime::<Utc>::UNIX_EPOCH;
        let reset = now + chrono::TimeDelta::milliseconds(49_500);

        assert_eq!(retry_after_secs(reset, now), 50);
        assert_eq!(retry_after_secs(now, now), 0);
        assert_eq!(retry_after_secs(now, reset), 0);
        assert_eq!(
            retry_after_secs(now + chrono::TimeDelta::microseconds(300), now),
            1
        );
        assert_eq!(
            retry_after_secs(now + chrono::TimeDelta::nanoseconds(1_000_000_001), now),
            2
        );
    }

    #[test]
    fn test_denial_never_sends_zero_retry_after() {
        let (guard, clock) = local_guard();
        let now = clock.now();

        let almost_due = guard.deny(&config(60, 3), now + chrono::TimeDelta::microseconds(400));
        assert_eq!(header(&almost_due, "retry-after"), "1");

        let already_due = guard.deny(&config(60, 3), now);
        assert_eq!(header(&already_due, "retry-after"), "1");
    }

    #[tokio::test]
    async fn test_allowed_request_runs_handler_with_headers() {
        let (guard, _clock) = local_guard();
        let identity = CallerIdentity::from("user");

        let response = guard
            .protect(&identity, "login", &config(60, 3), || async {
                (StatusCode::CREATED, "made")
            })
            .await;

        assert_eq!(response.status(), StatusCode::CREATED);
        assert_baseline_headers(&response);
        assert!(response.headers().get(RETRY_AFTER).is_none());
    }

    #[tokio::test]
    async fn test_handler_errors_pass_through() {
        let (guard, _clock) = local_guard();
        let identity = CallerIdentity::from("user");

        let response = guard
            .protect(&identity, "login", &config(60, 3), || async {
                (StatusCode::UNPROCESSABLE_ENTITY, "bad input")
            })
            .await;

        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
        assert_baseline_headers(&response);
    }

    #[tokio::test]
    async fn test_denied_request_skips_handler() {
        let (guard, clock) = local_guard();
        let identity = CallerIdentity::from("user");
        let config = config(60, 3);
        let counter = AtomicUsize::new(0);
        let calls = &counter;

        for _ in 0..4 {
            guard
                .protect(&identity, "login", &config, || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    StatusCode::OK
                })
                .await;
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        clock.advance(Duration::from_millis(10_500));
        let response = guard
            .protect(&identity, "login", &config, || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                StatusCode::OK
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(header(&response, "retry-after"), "50");
        assert_eq!(header(&response, "x-ratelimit-limit"), "3");
        assert_eq!(header(&response, "x-ratelimit-window"), "60");
        assert_baseline_headers(&response);
    }

    #[tokio::test]
    async fn test_success_and_denial_share_header_set() {
        let (guard, _clock) = local_guard();
        let identity = CallerIdentity::from("user");
        let config = config(60, 1);

        let allowed = guard
            .protect(&identity, "login", &config, || async { StatusCode::OK })
            .await;
        let denied = guard
            .protect(&identity, "login", &config, || async { StatusCode::OK })
            .await;

        for (name, value) in crate::http::headers::security_headers(guard.header_options()) {
            assert_eq!(allowed.headers().get(&name), Some(&value));
            assert_eq!(denied.headers().get(&name), Some(&value));
        }
    }

    #[tokio::test]
    async fn test_store_outage_fails_open() {
        let guard = unavailable_guard();
        let counter = AtomicUsize::new(0);
        let calls = &counter;

        let response = guard
            .protect(&CallerIdentity::anonymous(), "search", &config(60, 3), || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                StatusCode::OK
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(response.status(), StatusCode::OK);
        assert_baseline_headers(&response);
    }

    #[tokio::test]
    async fn test_store_outage_fails_closed_for_sensitive() {
        let guard = unavailable_guard();
        let counter = AtomicUsize::new(0);
        let calls = &counter;
        let config = RateLimitConfig::sensitive(Duration::from_secs(3600), 10).unwrap();

        let response = guard
            .protect(&CallerIdentity::anonymous(), "payment", &config, || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                StatusCode::OK
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(header(&response, "retry-after"), "3600");
        assert_eq!(header(&response, "x-ratelimit-limit"), "10");
        assert_eq!(header(&response, "x-ratelimit-window"), "3600");
        assert_baseline_headers(&response);
    }

    #[tokio::test]
    async fn test_protect_named_uses_registry() {
        let (guard, _clock) = local_guard();
        let identity = CallerIdentity::from("user");

        for _ in 0..3 {
            let response = guard
                .protect_named(&identity, "login", || async { StatusCode::OK })
                .await;
            assert_eq!(response.status(), StatusCode::OK);
        }
        let response = guard
            .protect_named(&identity, "login", || async { StatusCode::OK })
            .await;
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);

        let response = guard
            .protect_named(&identity, "unregistered", || async { StatusCode::OK })
            .await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_baseline_headers(&response);
    }

    #[test]
    fn test_bind_requires_registered_operation() {
        let (guard, _clock) = local_guard();

        let bound = guard.bind("login").unwrap();
        assert_eq!(bound.operation(), "login");
        assert_eq!(bound.config().max_requests(), 3);

        assert!(guard.bind("unregistered").is_err());
    }
}
