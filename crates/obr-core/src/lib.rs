//! # obr-core
//!
//! Core types, traits, and abstractions for the ontology-based annotation
//! workflow.
//!
//! This crate provides the domain model (resources, contexts, concepts,
//! direct and expanded annotations, aggregated scores), the workflow state
//! machine that gates every pipeline stage, the scoring weights, the store and
//! ontology-relation traits the stages are written against, and the retry
//! controller that wraps every bulk store call.

pub mod defaults;
pub mod error;
pub mod logging;
pub mod memory;
pub mod models;
pub mod retry;
pub mod traits;
pub mod weights;
pub mod workflow;

// Re-export commonly used types at crate root
pub use error::{Error, Result};
pub use models::*;
pub use retry::{with_retry, RetryPolicy};
pub use traits::*;
pub use weights::ObrWeight;
pub use workflow::{DirectStatus, ExpandedStatus, Stage};
