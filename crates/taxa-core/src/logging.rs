//! Structured logging schema and field name constants for taxa.
//!
//! All crates use these names for structured `tracing` fields so log
//! aggregation can query every subsystem the same way.
//!
//! ## Log Level Contract
//!
//! | Level | Usage |
//! |-------|-------|
//! | ERROR | Degraded service, requires operator attention |
//! | WARN  | Recoverable issue, automatic fallback applied |
//! | INFO  | Lifecycle events, operation completions |
//! | DEBUG | Decision points, intermediate values |
//! | TRACE | Per-record iteration |

// ─── Identity fields ───────────────────────────────────────────────────────

/// Subsystem originating the log event.
/// Values: "registry", "engine", "db", "jobs"
pub const SUBSYSTEM: &str = "subsystem";

/// Component within a subsystem.
/// Examples: "resolver", "merge", "harvest", "pool", "worker"
pub const COMPONENT: &str = "component";

/// Logical operation name.
/// Examples: "resolve", "merge_duplicates", "harvest", "get_by_key"
pub const OPERATION: &str = "op";

// ─── Entity fields ─────────────────────────────────────────────────────────

/// Internal taxon id.
pub const TAXON_ID: &str = "taxon_id";

/// Registry key of a taxon.
pub const EXTERNAL_KEY: &str = "external_key";

/// Harvest run / job id.
pub const RUN_ID: &str = "run_id";

/// Upstream occurrence id.
pub const UPSTREAM_ID: &str = "upstream_id";

/// Site id.
pub const SITE_ID: &str = "site_id";

/// Job UUID being processed.
pub const JOB_ID: &str = "job_id";

/// Job type enum variant.
pub const JOB_TYPE: &str = "job_type";

// ─── Measurement fields ────────────────────────────────────────────────────

/// Wall-clock duration in milliseconds.
pub const DURATION_MS: &str = "duration_ms";

/// Number of results returned by a query.
pub const RESULT_COUNT: &str = "result_count";

/// Page offset of an occurrence fetch.
pub const OFFSET: &str = "offset";

/// Recursion depth of a resolver call.
pub const DEPTH: &str = "depth";

// ─── Outcome fields ────────────────────────────────────────────────────────

/// Boolean success/failure indicator.
pub const SUCCESS: &str = "success";

/// Error message when an operation fails.
pub const ERROR_MSG: &str = "error";

/// Slow operation threshold exceeded.
pub const SLOW: &str = "slow";
