//! Centralized default constants for taxa.
//!
//! **This module is the single source of truth** for shared default values.
//! Crates should reference these constants instead of defining their own
//! magic numbers.

// =============================================================================
// REGISTRY
// =============================================================================

/// Default base URL of the taxonomic registry API.
pub const REGISTRY_URL: &str = "https://api.gbif.org/v1";

/// Timeout for registry requests in seconds.
pub const REGISTRY_TIMEOUT_SECS: u64 = 30;

/// Page size used when listing the children of a registry node.
pub const REGISTRY_CHILDREN_LIMIT: u32 = 100;

/// Registry responses slower than this are logged as slow.
pub const REGISTRY_SLOW_MS: u64 = 5_000;

// =============================================================================
// RESOLVER
// =============================================================================

/// Maximum parent-chain recursion depth before upward resolution stops.
///
/// Guards against key cycles in upstream data.
pub const RESOLVER_MAX_PARENT_DEPTH: usize = 10;

/// Maximum subtree depth walked below the requested node when children are
/// fetched.
pub const RESOLVER_MAX_CHILD_DEPTH: usize = 10;

/// Maximum number of canonical/accepted redirect hops for one lookup.
pub const RESOLVER_MAX_REDIRECTS: usize = 5;

/// Separator used when persisting legacy names.
pub const LEGACY_NAME_SEPARATOR: char = ';';

// =============================================================================
// HARVEST
// =============================================================================

/// Occurrence page size.
pub const HARVEST_PAGE_SIZE: u32 = 20;

/// Hard cap on pages fetched by a single harvest run.
pub const HARVEST_MAX_PAGES: u32 = 10_000;

/// Source collection tag stamped on harvested occurrences.
pub const HARVEST_SOURCE: &str = "gbif";

/// Owner identity used when the caller does not supply one.
pub const HARVEST_DEFAULT_OWNER: &str = "GBIF.org";

/// Site name used when an occurrence carries no locality.
pub const SITE_PLACEHOLDER_NAME: &str = "Unknown locality";

/// Spatial reference identifier for site points (WGS 84).
pub const SITE_SRID: i32 = 4326;

// =============================================================================
// DATABASE
// =============================================================================

/// Default maximum number of connections in the pool.
pub const DB_MAX_CONNECTIONS: u32 = 10;

/// Default connection timeout in seconds.
pub const DB_CONNECT_TIMEOUT_SECS: u64 = 30;

/// Default idle timeout in seconds.
pub const DB_IDLE_TIMEOUT_SECS: u64 = 600;

// =============================================================================
// JOB PROCESSING
// =============================================================================

/// Default maximum retry count for failed jobs.
pub const JOB_MAX_RETRIES: i32 = 3;

/// Default job worker poll interval in milliseconds.
pub const JOB_POLL_INTERVAL_MS: u64 = 2_000;

/// Default maximum concurrent jobs per worker.
pub const JOB_MAX_CONCURRENT: usize = 4;

/// Default job execution timeout in seconds (1 hour; large harvests page slowly).
pub const JOB_TIMEOUT_SECS: u64 = 3_600;
