//! Counter key derivation.

/// A key that uniquely identifies a counter.
///
/// Composed of the caller identifier and the operation name. Neither part is
/// parsed or normalised.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RateLimitKey(String);

impl RateLimitKey {
    /// Create a new key from an identifier and an operation.
    pub fn new(identifier: &str, operation: &str) -> Self {
        Self(format!("{}:{}", identifier, operation))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for RateLimitKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}
