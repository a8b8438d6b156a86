//! Engine configuration.

use std::env;

use taxa_core::defaults::{
    HARVEST_DEFAULT_OWNER, HARVEST_MAX_PAGES, HARVEST_PAGE_SIZE, HARVEST_SOURCE,
    RESOLVER_MAX_CHILD_DEPTH, RESOLVER_MAX_PARENT_DEPTH, RESOLVER_MAX_REDIRECTS,
};

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

fn env_non_blank(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Bounds for the taxon resolver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolverConfig {
    /// Parent-chain recursion depth at which upward resolution stops.
    pub max_parent_depth: usize,
    /// Levels of descendants resolved below the requested node.
    pub max_child_depth: usize,
    /// Canonical/accepted redirect hops followed per lookup.
    pub max_redirects: usize,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            max_parent_depth: RESOLVER_MAX_PARENT_DEPTH,
            max_child_depth: RESOLVER_MAX_CHILD_DEPTH,
            max_redirects: RESOLVER_MAX_REDIRECTS,
        }
    }
}

impl ResolverConfig {
    /// Create config from environment variables (with defaults).
    ///
    /// | Variable | Default | Description |
    /// |----------|---------|-------------|
    /// | `RESOLVER_MAX_PARENT_DEPTH` | `10` | Parent recursion bound |
    /// | `RESOLVER_MAX_CHILD_DEPTH` | `10` | Subtree depth when fetching children |
    /// | `RESOLVER_MAX_REDIRECTS` | `5` | Redirect hops per lookup |
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            max_parent_depth: env_parse("RESOLVER_MAX_PARENT_DEPTH")
                .unwrap_or(defaults.max_parent_depth),
            max_child_depth: env_parse("RESOLVER_MAX_CHILD_DEPTH")
                .unwrap_or(defaults.max_child_depth),
            max_redirects: env_parse("RESOLVER_MAX_REDIRECTS").unwrap_or(defaults.max_redirects),
        }
    }

    pub fn with_max_parent_depth(mut self, depth: usize) -> Self {
        self.max_parent_depth = depth;
        self
    }

    pub fn with_max_child_depth(mut self, depth: usize) -> Self {
        self.max_child_depth = depth;
        self
    }

    pub fn with_max_redirects(mut self, hops: usize) -> Self {
        self.max_redirects = hops;
        self
    }
}

/// Settings for occurrence harvesting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HarvestConfig {
    /// Occurrences requested per page.
    pub page_size: u32,
    /// ISO country filter applied to every query.
    pub country: Option<String>,
    /// Source collection tag stamped on records.
    pub source: String,
    /// Owner used when the request names none.
    pub default_owner: String,
    /// Hard cap on pages fetched per run.
    pub max_pages: u32,
    /// Skip records whose upstream id matches several rows instead of
    /// updating the first one.
    pub fail_on_duplicate_upstream_id: bool,
}

impl Default for HarvestConfig {
    fn default() -> Self {
        Self {
            page_size: HARVEST_PAGE_SIZE,
            country: None,
            source: HARVEST_SOURCE.to_string(),
            default_owner: HARVEST_DEFAULT_OWNER.to_string(),
            max_pages: HARVEST_MAX_PAGES,
            fail_on_duplicate_upstream_id: false,
        }
    }
}

impl HarvestConfig {
    /// Create config from environment variables (with defaults).
    ///
    /// | Variable | Default | Description |
    /// |----------|---------|-------------|
    /// | `HARVEST_PAGE_SIZE` | `20` | Occurrences per page |
    /// | `HARVEST_COUNTRY` | unset | Country filter |
    /// | `HARVEST_SOURCE` | `gbif` | Source tag |
    /// | `HARVEST_DEFAULT_OWNER` | `GBIF.org` | Owner fallback |
    /// | `HARVEST_MAX_PAGES` | `10000` | Page cap per run |
    /// | `HARVEST_FAIL_ON_DUPLICATE` | `false` | Skip duplicated upstream ids |
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            page_size: env_parse::<u32>("HARVEST_PAGE_SIZE")
                .filter(|n| *n > 0)
                .unwrap_or(defaults.page_size),
            country: env_non_blank("HARVEST_COUNTRY"),
            source: env_non_blank("HARVEST_SOURCE").unwrap_or(defaults.source),
            default_owner: env_non_blank("HARVEST_DEFAULT_OWNER").unwrap_or(defaults.default_owner),
            max_pages: env_parse::<u32>("HARVEST_MAX_PAGES")
                .filter(|n| *n > 0)
                .unwrap_or(defaults.max_pages),
            fail_on_duplicate_upstream_id: env::var("HARVEST_FAIL_ON_DUPLICATE")
                .map(|v| v == "true" || v == "1")
                .unwrap_or(false),
        }
    }

    pub fn with_page_size(mut self, size: u32) -> Self {
        self.page_size = size.max(1);
        self
    }

    pub fn with_country(mut self, country: impl Into<String>) -> Self {
        self.country = Some(country.into());
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    pub fn with_default_owner(mut self, owner: impl Into<String>) -> Self {
        self.default_owner = owner.into();
        self
    }

    pub fn with_max_pages(mut self, pages: u32) -> Self {
        self.max_pages = pages.max(1);
        self
    }

    pub fn with_fail_on_duplicate_upstream_id(mut self, fail: bool) -> Self {
        self.fail_on_duplicate_upstream_id = fail;
        self
    }
}
