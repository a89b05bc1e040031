//! Centralized default constants for the annotation workflow.
//!
//! **This module is the single source of truth** for shared default values.
//! Crates and binaries reference these constants instead of defining their
//! own magic numbers.

// =============================================================================
// SCORING WEIGHTS
// =============================================================================

/// Weight of an annotation reported by the source itself.
pub const WEIGHT_REPORTED: f64 = 10.0;

/// Weight of a preferred-name dictionary match.
pub const WEIGHT_PREFERRED_TERM: f64 = 10.0;

/// Weight of a synonym dictionary match.
pub const WEIGHT_SYNONYM: f64 = 8.0;

/// Decay per is-a level. Level 1 scores 6, level 2 scores 4, level 5+ scores 1.
pub const WEIGHT_ISA_DECAY_FACTOR: f64 = 0.6;

/// Weight of a mapping expansion.
pub const WEIGHT_MAPPING: f64 = 7.0;

// =============================================================================
// WORKFLOW
// =============================================================================

/// Rows read and committed per batch by each stage.
pub const BATCH_SIZE: i64 = 5_000;

/// Resources processed concurrently by the workflow runner.
pub const MAX_CONCURRENT_RESOURCES: usize = 2;

/// Upper bound for a single stage invocation on one resource (1 hour).
pub const STAGE_TIMEOUT_SECS: u64 = 3_600;

/// Workflow event broadcast channel capacity.
pub const EVENT_BUS_CAPACITY: usize = 256;

// =============================================================================
// RETRY
// =============================================================================

/// Attempts per bulk store operation, including the first.
pub const RETRY_MAX_ATTEMPTS: u32 = 5;

/// Backoff before the second attempt.
pub const RETRY_INITIAL_BACKOFF_MS: u64 = 100;

/// Backoff cap.
pub const RETRY_MAX_BACKOFF_MS: u64 = 5_000;

// =============================================================================
// QUERIES
// =============================================================================

/// Default number of elements returned per concept.
pub const SCORE_QUERY_LIMIT: i64 = 100;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decay_default_matches_documented_levels() {
        let bonus = |level: f64| (10.0 * (-WEIGHT_ISA_DECAY_FACTOR * level).exp() + 1.0).floor();
        assert_eq!(bonus(1.0), 6.0);
        assert_eq!(bonus(2.0), 4.0);
        assert_eq!(bonus(5.0), 1.0);
    }

    #[test]
    fn test_retry_backoff_ordering() {
        assert!(RETRY_INITIAL_BACKOFF_MS <= RETRY_MAX_BACKOFF_MS);
        assert!(RETRY_MAX_ATTEMPTS >= 1);
    }
}
