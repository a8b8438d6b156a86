//! Registry client configuration.

use std::env;

use taxa_core::defaults::{
    REGISTRY_CHILDREN_LIMIT, REGISTRY_SLOW_MS, REGISTRY_TIMEOUT_SECS, REGISTRY_URL,
};

/// Configuration for the GBIF registry client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryConfig {
    /// Base URL of the API, without trailing slash.
    pub base_url: String,
    /// Request timeout in seconds.
    pub timeout_secs: u64,
    /// Page size when listing children.
    pub children_limit: u32,
    /// Requests slower than this are logged with `slow = true`.
    pub slow_threshold_ms: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            base_url: REGISTRY_URL.to_string(),
            timeout_secs: REGISTRY_TIMEOUT_SECS,
            children_limit: REGISTRY_CHILDREN_LIMIT,
            slow_threshold_ms: REGISTRY_SLOW_MS,
        }
    }
}

impl RegistryConfig {
    /// Load from `GBIF_BASE_URL`, `GBIF_TIMEOUT_SECS` and `GBIF_CHILDREN_LIMIT`.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            base_url: env::var("GBIF_BASE_URL")
                .map(|url| url.trim_end_matches('/').to_string())
                .unwrap_or(defaults.base_url),
            timeout_secs: env::var("GBIF_TIMEOUT_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.timeout_secs),
            children_limit: env::var("GBIF_CHILDREN_LIMIT")
                .ok()
                .and_then(|s| s.parse().ok())
                .filter(|n| *n > 0)
                .unwrap_or(defaults.children_limit),
            slow_threshold_ms: defaults.slow_threshold_ms,
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }

    pub fn with_children_limit(mut self, limit: u32) -> Self {
        self.children_limit = limit.max(1);
        self
    }

    pub fn with_slow_threshold_ms(mut self, ms: u64) -> Self {
        self.slow_threshold_ms = ms;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_points_at_public_api() {
        let config = RegistryConfig::default();
        assert_eq!(config.base_url, "https://api.gbif.org/v1");
        assert_eq!(config.children_limit, REGISTRY_CHILDREN_LIMIT);
    }

    #[test]
    fn test_builder_strips_trailing_slash() {
        let config = RegistryConfig::default()
            .with_base_url("http://localhost:8080/v1/")
            .with_children_limit(0)
            .with_timeout_secs(5);
        assert_eq!(config.base_url, "http://localhost:8080/v1");
        assert_eq!(config.children_limit, 1);
        assert_eq!(config.timeout_secs, 5);
    }
}
