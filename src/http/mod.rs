//! HTTP surface: request guard, hardening headers, and the decision service.

mod guard;
mod headers;
mod server;
mod service;

pub use guard::{
    guard_layer, retry_after_secs, AuthenticatedPrincipal, CallerIdentity, GuardedOperation,
    RequestGuard, Verdict, ANONYMOUS, X_RATELIMIT_LIMIT, X_RATELIMIT_REMAINING,
    X_RATELIMIT_WINDOW,
};
pub use headers::{apply_security_headers, baseline_header_names, security_headers, HeaderOptions};
pub use server::HttpServer;
pub use service::{router, AppState, CheckRequest, CheckResponse, OperationView};
