//! Structured logging field name constants for the annotation workflow.
//!
//! All crates use these names for structured `tracing` fields so log
//! aggregation can query every subsystem the same way.
//!
//! ## Log Level Contract
//!
//! | Level | Usage |
//! |-------|-------|
//! | ERROR | Stage failed, requires operator attention |
//! | WARN  | Recoverable issue: retry, skipped malformed row |
//! | INFO  | Lifecycle events, stage completions with counts |
//! | DEBUG | Batch boundaries, config choices, benign duplicates |
//! | TRACE | Per-row detail |

// ─── Identity fields ───────────────────────────────────────────────────────

/// Subsystem originating the log event. One of [`SUBSYSTEM_VALUES`].
pub const SUBSYSTEM: &str = "subsystem";

/// Every value emitted under [`SUBSYSTEM`].
pub const SUBSYSTEM_VALUES: &[&str] = &["database", "workflow", "retry"];

/// Component within a subsystem.
/// Examples: "pool", "isa_closure", "mapping", "aggregator", "runner"
pub const COMPONENT: &str = "component";

/// Logical operation name.
/// Examples: "commit_expansion", "delete_ontology", "claim_batch"
pub const OPERATION: &str = "op";

// ─── Entity fields ─────────────────────────────────────────────────────────

/// Resource code being processed.
pub const RESOURCE_ID: &str = "resource_id";

/// Pipeline stage.
pub const STAGE: &str = "stage";

/// Ontology identifier.
pub const ONTOLOGY_ID: &str = "ontology_id";

/// Direct or expanded annotation row id.
pub const ANNOTATION_ID: &str = "annotation_id";

// ─── Measurement fields ────────────────────────────────────────────────────

/// Wall-clock duration in milliseconds.
pub const DURATION_MS: &str = "duration_ms";

/// Rows read, written, or updated.
pub const ROW_COUNT: &str = "row_count";

/// Rows skipped as malformed or duplicate.
pub const SKIPPED: &str = "skipped";

/// Batch sequence number within a stage invocation.
pub const BATCH: &str = "batch";

// ─── Retry fields ──────────────────────────────────────────────────────────

/// Attempt number, starting at 1.
pub const ATTEMPT: &str = "attempt";

/// Sleep before the next attempt.
pub const BACKOFF_MS: &str = "backoff_ms";

// ─── Database fields ───────────────────────────────────────────────────────

/// Number of active connections in the pool.
pub const POOL_SIZE: &str = "pool_size";

/// Number of idle connections in the pool.
pub const POOL_IDLE: &str = "pool_idle";

/// Database table affected.
pub const DB_TABLE: &str = "db_table";

// ─── Outcome fields ────────────────────────────────────────────────────────

/// Boolean success/failure indicator.
pub const SUCCESS: &str = "success";

/// Error message when an operation fails.
pub const ERROR_MSG: &str = "error";
