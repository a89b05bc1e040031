//! Scoring weights and per-source score functions used by the aggregator.

use serde::{Deserialize, Serialize};

use crate::defaults;
use crate::error::{Error, Result};
use crate::models::TermKind;

/// Named weight configuration passed to the aggregator.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ObrWeight {
    /// Weight of an annotation reported by the source.
    pub reported: f64,
    /// Weight of a preferred-name dictionary match.
    pub preferred_term: f64,
    /// Weight of a synonym dictionary match.
    pub synonym: f64,
    /// Exponential decay applied per is-a level.
    pub isa_decay_factor: f64,
    /// Weight of a mapping expansion.
    pub mapping_weight: f64,
}

impl Default for ObrWeight {
    fn default() -> Self {
        Self {
            reported: defaults::WEIGHT_REPORTED,
            preferred_term: defaults::WEIGHT_PREFERRED_TERM,
            synonym: defaults::WEIGHT_SYNONYM,
            isa_decay_factor: defaults::WEIGHT_ISA_DECAY_FACTOR,
            mapping_weight: defaults::WEIGHT_MAPPING,
        }
    }
}

impl ObrWeight {
    /// Load weights from environment variables (with defaults).
    ///
    /// | Variable | Default |
    /// |----------|---------|
    /// | `OBR_WEIGHT_REPORTED` | `10` |
    /// | `OBR_WEIGHT_PREFERRED_TERM` | `10` |
    /// | `OBR_WEIGHT_SYNONYM` | `8` |
    /// | `OBR_WEIGHT_ISA_DECAY` | `0.6` |
    /// | `OBR_WEIGHT_MAPPING` | `7` |
    pub fn from_env() -> Self {
        let base = Self::default();
        Self {
            reported: env_f64("OBR_WEIGHT_REPORTED").unwrap_or(base.reported),
            preferred_term: env_f64("OBR_WEIGHT_PREFERRED_TERM").unwrap_or(base.preferred_term),
            synonym: env_f64("OBR_WEIGHT_SYNONYM").unwrap_or(base.synonym),
            isa_decay_factor: env_f64("OBR_WEIGHT_ISA_DECAY").unwrap_or(base.isa_decay_factor),
            mapping_weight: env_f64("OBR_WEIGHT_MAPPING").unwrap_or(base.mapping_weight),
        }
    }

    /// Reject non-finite or negative weights.
    pub fn validate(&self) -> Result<()> {
        let fields = [
            ("reported", self.reported),
            ("preferred_term", self.preferred_term),
            ("synonym", self.synonym),
            ("isa_decay_factor", self.isa_decay_factor),
            ("mapping_weight", self.mapping_weight),
        ];
        for (name, value) in fields {
            if !value.is_finite() || value < 0.0 {
                return Err(Error::Config(format!(
                    "weight {} must be a non-negative number, got {}",
                    name, value
                )));
            }
        }
        Ok(())
    }

    /// Base weight of a direct annotation by how it was produced.
    pub fn term_weight(&self, kind: TermKind) -> f64 {
        match kind {
            TermKind::Reported => self.reported,
            TermKind::PreferredTerm => self.preferred_term,
            TermKind::SynonymTerm => self.synonym,
        }
    }

    /// Score of a direct annotation.
    pub fn direct_score(&self, context_weight: f64, kind: TermKind) -> f64 {
        context_weight * self.term_weight(kind)
    }

    /// Integer bonus for an ancestor `level` steps up: `floor(10 e^(-k level) + 1)`.
    pub fn isa_bonus(&self, level: i32) -> f64 {
        (10.0 * (-self.isa_decay_factor * f64::from(level)).exp() + 1.0).floor()
    }

    /// Score of an is-a expanded annotation.
    pub fn isa_score(&self, context_weight: f64, level: i32) -> f64 {
        context_weight * self.isa_bonus(level)
    }

    /// Score of a mapping expanded annotation. Mapping type is not weighted.
    pub fn mapping_score(&self, context_weight: f64) -> f64 {
        context_weight * self.mapping_weight
    }
}

fn env_f64(key: &str) -> Option<f64> {
    std::env::var(key).ok().and_then(|v| v.parse::<f64>().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_weights_are_valid() {
        assert!(ObrWeight::default().validate().is_ok());
    }

    #[test]
    fn test_direct_score_by_term_kind() {
        let w = ObrWeight {
            reported: 12.0,
            preferred_term: 10.0,
            synonym: 8.0,
            ..ObrWeight::default()
        };
        assert_eq!(w.direct_score(1.0, TermKind::Reported), 12.0);
        assert_eq!(w.direct_score(1.0, TermKind::PreferredTerm), 10.0);
        assert_eq!(w.direct_score(0.5, TermKind::SynonymTerm), 4.0);
    }

    #[test]
    fn test_isa_bonus_known_values() {
        let w = ObrWeight {
            isa_decay_factor: 0.6,
            ..ObrWeight::default()
        };
        // floor(10 * e^-0.6 + 1) = floor(6.488)
        assert_eq!(w.isa_bonus(1), 6.0);
        // floor(10 * e^-1.2 + 1) = floor(4.011)
        assert_eq!(w.isa_bonus(2), 4.0);
        // Far ancestors bottom out at 1
        assert_eq!(w.isa_bonus(50), 1.0);
    }

    #[test]
    fn test_isa_score_non_increasing_with_level() {
        let w = ObrWeight::default();
        let mut previous = f64::INFINITY;
        for level in 1..=20 {
            let score = w.isa_score(0.8, level);
            assert!(score <= previous, "level {level}: {score} > {previous}");
            previous = score;
        }
    }

    #[test]
    fn test_zero_decay_gives_flat_bonus() {
        let w = ObrWeight {
            isa_decay_factor: 0.0,
            ..ObrWeight::default()
        };
        assert_eq!(w.isa_bonus(1), 11.0);
        assert_eq!(w.isa_bonus(7), 11.0);
    }

    #[test]
    fn test_mapping_score() {
        let w = ObrWeight {
            mapping_weight: 7.0,
            ..ObrWeight::default()
        };
        assert_eq!(w.mapping_score(2.0), 14.0);
    }

    #[test]
    fn test_validate_rejects_negative_and_nan() {
        let w = ObrWeight {
            synonym: -1.0,
            ..ObrWeight::default()
        };
        assert!(matches!(w.validate(), Err(Error::Config(_))));

        let w = ObrWeight {
            isa_decay_factor: f64::NAN,
            ..ObrWeight::default()
        };
        assert!(w.validate().is_err());
    }
}
