//! Decision endpoint handlers.

use axum::extract::State;
use axum::http::header::{HeaderMap, HeaderValue};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, instrument, warn};

use super::guard::{
    AuthenticatedPrincipal, CallerIdentity, RequestGuard, Verdict, X_RATELIMIT_LIMIT,
    X_RATELIMIT_REMAINING,
};
use super::headers::apply_security_headers;
use crate::ratelimit::{FailureMode, LimitSpec};

/// Shared state for the decision service.
#[derive(Clone)]
pub struct AppState {
    pub guard: RequestGuard,
}

impl AppState {
    pub fn new(guard: RequestGuard) -> Self {
        Self { guard }
    }
}

/// Body of `POST /v1/check`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckRequest {
    /// Caller identifier. Resolved from the request when absent.
    #[serde(default)]
    pub identifier: Option<String>,
    pub operation: String,
    /// One-off quota for operations outside the registry
    #[serde(default)]
    pub config: Option<LimitSpec>,
}

/// Body of an admitted check.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckResponse {
    pub allowed: bool,
    pub limit: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remaining: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reset_time: Option<DateTime<Utc>>,
    /// Set when the store was unreachable and the operation failed open
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub degraded: bool,
}

/// One registry entry as listed by `GET /v1/operations`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationView {
    pub name: String,
    pub window_secs: u64,
    pub max_requests: u64,
    pub failure_mode: FailureMode,
}

/// Build the decision service router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(health))
        .route("/v1/operations", get(operations))
        .route("/v1/check", post(check))
        .with_state(state)
}

async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "store": state.guard.limiter().store_name(),
    }))
}

async fn operations(State(state): State<AppState>) -> Json<Vec<OperationView>> {
    let views = state
        .guard
        .limiter()
        .registry()
        .operations()
        .map(|(name, config)| OperationView {
            name: name.to_string(),
            window_secs: config.window_secs(),
            max_requests: config.max_requests(),
            failure_mode: config.failure_mode(),
        })
        .collect();
    Json(views)
}

/// Count one request and report the decision.
#[instrument(skip_all)]
async fn check(
    State(state): State<AppState>,
    principal: Option<Extension<AuthenticatedPrincipal>>,
    headers: HeaderMap,
    Json(request): Json<CheckRequest>,
) -> Response {
    let guard = &state.guard;
    let registry = guard.limiter().registry();

    if request.config.is_some() && registry.contains(&request.operation) {
        warn!(operation = %request.operation, "Rejected one-off config for a registered operation");
        return error_response(
            guard,
            StatusCode::CONFLICT,
            "operation_registered",
            &format!("'{}' has a registered quota", request.operation),
        );
    }

    let one_off = match request.config.as_ref().map(LimitSpec::to_config).transpose() {
        Ok(config) => config,
        Err(e) => {
            warn!(error = %e, "Rejected one-off rate limit config");
            return error_response(guard, StatusCode::BAD_REQUEST, "invalid_config", &e.to_string());
        }
    };

    let Some(config) = registry.resolve(&request.operation, one_off) else {
        return error_response(
            guard,
            StatusCode::NOT_FOUND,
            "unknown_operation",
            &format!("no rate limit configured for '{}'", request.operation),
        );
    };

    let identity = match request.identifier.as_deref().filter(|id| !id.is_empty()) {
        Some(identifier) => CallerIdentity::from(identifier),
        None => CallerIdentity::resolve(principal.as_ref().map(|Extension(p)| p), &headers),
    };

    match guard.evaluate(&identity, &request.operation, &config).await {
        Verdict::Proceed(quota) => {
            info!(
                identifier = %identity,
                operation = %request.operation,
                remaining = quota.map(|q| q.remaining),
                "Rate limit decision: allowed"
            );

            let body = CheckResponse {
                allowed: true,
                limit: config.max_requests(),
                remaining: quota.map(|q| q.remaining),
                reset_time: quota.map(|q| q.reset_time),
                degraded: quota.is_none(),
            };
            let mut response = (StatusCode::OK, Json(body)).into_response();
            let headers = response.headers_mut();
            headers.insert(X_RATELIMIT_LIMIT, HeaderValue::from(config.max_requests()));
            if let Some(quota) = quota {
                headers.insert(X_RATELIMIT_REMAINING, HeaderValue::from(quota.remaining));
            }
            apply_security_headers(headers, guard.header_options());
            response
        }
        Verdict::Reject(response) => {
            info!(
                identifier = %identity,
                operation = %request.operation,
                status = %response.status(),
                "Rate limit decision: denied"
            );
            response
        }
    }
}

fn error_response(guard: &RequestGuard, status: StatusCode, code: &str, message: &str) -> Response {
    let mut response = (status, Json(json!({ "error": code, "message": message }))).into_response();
    apply_security_headers(response.headers_mut(), guard.header_options());
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::headers::HeaderOptions;
    use crate::ratelimit::{ConfigRegistry, LocalStore, RateLimiter};
    use std::sync::Arc;

    fn create_state() -> AppState {
        let store = Arc::new(LocalStore::new());
        let limiter = RateLimiter::with_registry(store, Arc::new(ConfigRegistry::presets()));
        AppState::new(RequestGuard::new(Arc::new(limiter), HeaderOptions::default()))
    }

    fn request(operation: &str, identifier: Option<&str>) -> CheckRequest {
        CheckRequest {
            identifier: identifier.map(str::to_string),
            operation: operation.to_string(),
            config: None,
        }
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_check_allowed() {
        let state = create_state();

        let response = check(
            State(state),
            None,
            HeaderMap::new(),
            Json(request("auth", Some("user_1"))),
        )
        .await;

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers().get("x-ratelimit-remaining").unwrap(), "4");
        assert_eq!(response.headers().get("x-frame-options").unwrap(), "DENY");

        let body = body_json(response).await;
        assert_eq!(body["allowed"], true);
        assert_eq!(body["limit"], 5);
        assert_eq!(body["remaining"], 4);
        assert!(body.get("degraded").is_none());
    }

    #[tokio::test]
    async fn test_check_denied_after_quota() {
        let state = create_state();

        for _ in 0..5 {
            check(
                State(state.clone()),
                None,
                HeaderMap::new(),
                Json(request("auth", Some("user_1"))),
            )
            .await;
        }
        let response = check(
            State(state),
            None,
            HeaderMap::new(),
            Json(request("auth", Some("user_1"))),
        )
        .await;

        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        let body = body_json(response).await;
        assert_eq!(body["error"], "rate_limited");
    }

    #[tokio::test]
    async fn test_check_resolves_identity_from_headers() {
        let state = create_state();
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static("198.51.100.4"));

        for _ in 0..5 {
            check(
                State(state.clone()),
                None,
                headers.clone(),
                Json(request("auth", None)),
            )
            .await;
        }
        let by_address = check(
            State(state.clone()),
            None,
            headers,
            Json(request("auth", None)),
        )
        .await;
        assert_eq!(by_address.status(), StatusCode::TOO_MANY_REQUESTS);

        let by_principal = check(
            State(state),
            Some(Extension(AuthenticatedPrincipal("user_9".to_string()))),
            HeaderMap::new(),
            Json(request("auth", None)),
        )
        .await;
        assert_eq!(by_principal.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_check_unknown_operation() {
        let response = check(
            State(create_state()),
            None,
            HeaderMap::new(),
            Json(request("teleport", Some("user_1"))),
        )
        .await;

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(response.headers().get("x-content-type-options").unwrap(), "nosniff");
    }

    #[tokio::test]
    async fn test_check_one_off_config() {
        let mut req = request("teleport", Some("user_1"));
        req.config = Some(LimitSpec {
            window_secs: Some(60),
            max_requests: Some(1),
            ..Default::default()
        });
        let state = create_state();

        let first = check(State(state.clone()), None, HeaderMap::new(), Json(req.clone())).await;
        assert_eq!(first.status(), StatusCode::OK);

        let second = check(State(state), None, HeaderMap::new(), Json(req)).await;
        assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(second.headers().get("x-ratelimit-window").unwrap(), "60");
    }

    #[tokio::test]
    async fn test_one_off_cannot_override_registered_quota() {
        let state = create_state();
        let mut req = request("payment", Some("user_1"));
        req.config = Some(LimitSpec {
            window_secs: Some(1),
            max_requests: Some(1_000_000),
            ..Default::default()
        });

        for _ in 0..50 {
            let response =
                check(State(state.clone()), None, HeaderMap::new(), Json(req.clone())).await;
            assert_eq!(response.status(), StatusCode::CONFLICT);
        }

        let mut allowed = 0;
        for _ in 0..50 {
            let response = check(
                State(state.clone()),
                None,
                HeaderMap::new(),
                Json(request("payment", Some("user_1"))),
            )
            .await;
            if response.status() == StatusCode::OK {
                allowed += 1;
            }
        }
        assert_eq!(allowed, 10);
    }

    #[tokio::test]
    async fn test_check_invalid_one_off_config() {
        let mut req = request("teleport", Some("user_1"));
        req.config = Some(LimitSpec {
            window_secs: Some(0),
            max_requests: Some(1),
            ..Default::default()
        });

        let response = check(State(create_state()), None, HeaderMap::new(), Json(req)).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_json(response).await;
        assert_eq!(body["error"], "invalid_config");
    }

    #[tokio::test]
    async fn test_operations_lists_registry() {
        let Json(views) = operations(State(create_state())).await;
        let payment = views.iter().find(|v| v.name == "payment").unwrap();

        assert_eq!(payment.window_secs, 3600);
        assert_eq!(payment.failure_mode, FailureMode::Closed);
    }

    #[tokio::test]
    async fn test_health_reports_store() {
        let Json(body) = health(State(create_state())).await;
        assert_eq!(body["status"], "ok");
        assert_eq!(body["store"], "local");
    }
}
