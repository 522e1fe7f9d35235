//! Operation quota table.
//!
//! The registry maps operation names to their [`RateLimitConfig`]. It is
//! built and validated once at startup and never mutated afterwards. Rules
//! can come from the built-in presets, a YAML file, or code.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use tracing::info;

use super::counter::{FailureMode, InvalidConfig, RateLimitConfig};
use crate::error::{Result, WardenError};

/// Time unit for rate limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeUnit {
    Second,
    Minute,
    Hour,
    Day,
}

impl TimeUnit {
    /// Get the duration of this time unit.
    pub fn duration(&self) -> Duration {
        match self {
            TimeUnit::Second => Duration::from_secs(1),
            TimeUnit::Minute => Duration::from_secs(60),
            TimeUnit::Hour => Duration::from_secs(3600),
            TimeUnit::Day => Duration::from_secs(86400),
        }
    }
}

/// A quota as written in configuration.
///
/// Either `window_secs` + `max_requests` or `requests_per_unit` + `unit`
/// must be present.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimitSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_requests: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub window_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requests_per_unit: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<TimeUnit>,
    #[serde(default)]
    pub failure_mode: FailureMode,
}

impl LimitSpec {
    /// Validate into a configuration.
    pub fn to_config(&self) -> std::result::Result<RateLimitConfig, InvalidConfig> {
        let (window, max_requests) = match self {
            LimitSpec {
                window_secs: Some(secs),
                max_requests: Some(max),
                ..
            } => (Duration::from_secs(*secs), *max),
            LimitSpec {
                unit: Some(unit),
                requests_per_unit: Some(max),
                ..
            } => (unit.duration(), *max),
            _ => return Err(InvalidConfig::Incomplete),
        };

        Ok(RateLimitConfig::new(window, max_requests)?.with_failure_mode(self.failure_mode))
    }
}

/// A named rule in a rules file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleSpec {
    pub name: String,
    #[serde(flatten)]
    pub limit: LimitSpec,
}

/// Top level of a rules file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RulesFile {
    #[serde(default)]
    pub operations: Vec<RuleSpec>,
}

/// Immutable table of operation quotas.
#[derive(Debug, Clone, Default)]
pub struct ConfigRegistry {
    operations: BTreeMap<String, RateLimitConfig>,
}

impl ConfigRegistry {
    /// Create a registry with no operations.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn builder() -> ConfigRegistryBuilder {
        ConfigRegistryBuilder::default()
    }

    /// The built-in presets.
    pub fn presets() -> Self {
        let mut operations = BTreeMap::new();
        for (name, window_secs, max_requests, failure_mode) in PRESETS {
            let config = RateLimitConfig::new(Duration::from_secs(*window_secs), *max_requests)
                .map(|config| config.with_failure_mode(*failure_mode));
            // Preset values are non-zero constants.
            if let Ok(config) = config {
                operations.insert(name.to_string(), config);
            }
        }
        Self { operations }
    }

    /// Load rules from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::builder().rules_file(path)?.build().map_err(Into::into)
    }

    /// Load rules from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        Self::builder().rules_yaml(yaml)?.build().map_err(Into::into)
    }

    /// Get the configuration for an operation.
    pub fn get(&self, operation: &str) -> Option<&RateLimitConfig> {
        self.operations.get(operation)
    }

    /// Pick the configuration for a check.
    ///
    /// A registered operation always uses its table entry. `one_off` only
    /// applies to operations the table does not know.
    pub fn resolve(
        &self,
        operation: &str,
        one_off: Option<RateLimitConfig>,
    ) -> Option<RateLimitConfig> {
        self.get(operation).copied().or(one_off)
    }

    /// Whether `operation` has a table entry.
    pub fn contains(&self, operation: &str) -> bool {
        self.operations.contains_key(operation)
    }

    /// Iterate over all operations in name order.
    pub fn operations(&self) -> impl Iterator<Item = (&str, &RateLimitConfig)> {
        self.operations
            .iter()
            .map(|(name, config)| (name.as_str(), config))
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }
}

/// (name, window seconds, max requests, failure mode)
const PRESETS: &[(&str, u64, u64, FailureMode)] = &[
    ("api", 60, 100, FailureMode::Open),
    ("auth", 900, 5, FailureMode::Open),
    ("ai_generation", 60, 20, FailureMode::Open),
    ("upload", 60, 10, FailureMode::Open),
    ("payment", 3600, 10, FailureMode::Closed),
    ("webhook", 60, 1000, FailureMode::Open),
];

/// Collects rules before freezing them into a [`ConfigRegistry`].
///
/// Explicit rules replace presets of the same name. Two explicit rules with
/// the same name are an error.
#[derive(Debug, Default)]
pub struct ConfigRegistryBuilder {
    base: BTreeMap<String, RateLimitConfig>,
    rules: Vec<(String, RateLimitConfig)>,
}

impl ConfigRegistryBuilder {
    /// Start from the built-in presets.
    pub fn with_presets(mut self) -> Self {
        self.base = ConfigRegistry::presets().operations;
        self
    }

    pub fn operation(mut self, name: impl Into<String>, config: RateLimitConfig) -> Self {
        self.rules.push((name.into(), config));
        self
    }

    /// Add every rule from a YAML file.
    pub fn rules_file<P: AsRef<Path>>(self, path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading rate limit rules");

        let contents = std::fs::read_to_string(path)?;
        self.rules_yaml(&contents)
    }

    /// Add every rule from a YAML string.
    pub fn rules_yaml(mut self, yaml: &str) -> Result<Self> {
        let file: RulesFile = serde_yaml::from_str(yaml)
            .map_err(|e| WardenError::Config(format!("Failed to parse rate limit rules: {}", e)))?;

        for rule in file.operations {
            let config = rule.limit.to_config().map_err(|source| InvalidConfig::Rule {
                operation: rule.name.clone(),
                source: Box::new(source),
            })?;
            self.rules.push((rule.name, config));
        }
        Ok(self)
    }

    pub fn build(self) -> std::result::Result<ConfigRegistry, InvalidConfig> {
        let mut operations = self.base;
        let mut seen = std::collections::HashSet::new();

        for (name, config) in self.rules {
            if !seen.insert(name.clone()) {
                return Err(InvalidConfig::DuplicateOperation(name));
            }
            operations.insert(name, config);
        }

        Ok(ConfigRegistry { operations })
    }
}
