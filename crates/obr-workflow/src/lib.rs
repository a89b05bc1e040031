//! # obr-workflow
//!
//! Post-tagging pipeline of the ontology-based annotation workflow.
//!
//! This crate provides:
//! - Is-a closure expansion of direct annotations
//! - Mapping expansion across ontologies
//! - Weighted aggregation into the per-(element, concept) score index
//! - A runner that drives resources through the stages in order, with bounded
//!   concurrency, per-stage timeouts, and progress events on a broadcast channel
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use obr_db::{Database, PgAnnotationStore, PgOntologyRelations};
//! use obr_workflow::{WorkflowBuilder, WorkflowConfig};
//!
//! let db = Database::connect("postgres://...").await?;
//! let store = Arc::new(PgAnnotationStore::new(db.pool.clone()));
//! let relations = Arc::new(PgOntologyRelations::new(db.pool.clone()));
//!
//! let runner = WorkflowBuilder::new(store, relations)
//!     .with_config(WorkflowConfig::from_env())
//!     .build();
//!
//! // Listen for events
//! let mut events = runner.events();
//! tokio::spawn(async move {
//!     while let Ok(event) = events.recv().await {
//!         println!("Event: {:?}", event);
//!     }
//! });
//!
//! let report = runner.run(&["GEO".to_string(), "PubMed".to_string()]).await;
//! assert!(report.is_success());
//! ```

pub mod aggregator;
pub mod expander;
pub mod handler;
pub mod runner;

// Re-export core types
pub use obr_core::*;

pub use aggregator::Aggregator;
pub use expander::Expander;
pub use handler::{StageContext, StageHandler, StageReport, StageResult};
pub use runner::{
    ResourceReport, WorkflowBuilder, WorkflowConfig, WorkflowEvent, WorkflowReport, WorkflowRunner,
};
