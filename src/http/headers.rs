//! Hardening headers applied to every guarded response.

use axum::http::header::{self, HeaderMap, HeaderName, HeaderValue};
use serde::{Deserialize, Serialize};

/// Optional headers on top of the baseline set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeaderOptions {
    /// Add `Strict-Transport-Security`
    #[serde(default = "default_true")]
    pub include_transport_security: bool,
    /// Add `Content-Security-Policy`
    #[serde(default)]
    pub include_content_policy: bool,
}

impl Default for HeaderOptions {
    fn default() -> Self {
        Self {
            include_transport_security: true,
            include_content_policy: false,
        }
    }
}

fn default_true() -> bool {
    true
}

/// The headers every response carries regardless of options.
const BASELINE: [(&str, &str); 4] = [
    ("x-content-type-options", "nosniff"),
    ("x-frame-options", "DENY"),
    ("referrer-policy", "strict-origin-when-cross-origin"),
    ("permissions-policy", "camera=(), microphone=(), geolocation=()"),
];

const TRANSPORT_SECURITY: &str = "max-age=31536000; includeSubDomains";
const CONTENT_POLICY: &str = "default-src 'self'; frame-ancestors 'none'; object-src 'none'";

/// Build the ordered header set for `options`.
///
/// The result depends only on `options`.
pub fn security_headers(options: HeaderOptions) -> Vec<(HeaderName, HeaderValue)> {
    let mut headers: Vec<(HeaderName, HeaderValue)> = BASELINE
        .into_iter()
        .map(|(name, value)| (HeaderName::from_static(name), HeaderValue::from_static(value)))
        .collect();

    if options.include_transport_security {
        headers.push((
            header::STRICT_TRANSPORT_SECURITY,
            HeaderValue::from_static(TRANSPORT_SECURITY),
        ));
    }
    if options.include_content_policy {
        headers.push((
            header::CONTENT_SECURITY_POLICY,
            HeaderValue::from_static(CONTENT_POLICY),
        ));
    }

    headers
}

/// Names of the baseline headers.
pub fn baseline_header_names() -> impl Iterator<Item = HeaderName> {
    BASELINE.into_iter().map(|(name, _)| HeaderName::from_static(name))
}

/// Insert the header set into `headers`, replacing existing values.
pub fn apply_security_headers(headers: &mut HeaderMap, options: HeaderOptions) {
    for (name, value) in security_headers(options) {
        headers.insert(name, value);
    }
}
