//! Core traits for the annotation workflow.
//!
//! These traits define the seams between the pipeline stages, the backing
//! store, and the external ontology access layer, enabling the PostgreSQL
//! backend in production and the in-memory backend in tests.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::models::*;
use crate::workflow::{DirectStatus, Stage};

// =============================================================================
// ONTOLOGY ACCESS
// =============================================================================

/// Read-only view of the precomputed ontology relations.
///
/// Both lookups take the distinct concepts of a whole batch so a stage issues
/// one lookup per batch, never one per row.
#[async_trait]
pub trait OntologyRelations: Send + Sync {
    /// `ParentOf`: every `(concept, ancestor, level)` for the given concepts.
    async fn parents_of(&self, concepts: &[ConceptRef]) -> Result<Vec<ParentEdge>>;

    /// `MappedTo`: every `(concept, target, mapping_type)` for the given concepts.
    async fn mappings_of(&self, concepts: &[ConceptRef]) -> Result<Vec<MappingEdge>>;
}

// =============================================================================
// ANNOTATION STORE (pipeline surface)
// =============================================================================

/// New expanded rows plus the direct rows that produced them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExpansionCommit {
    pub resource_id: String,
    pub stage: Stage,
    /// Direct annotation ids moved from `stage.input()` to `stage.output()`.
    pub consumed: Vec<i64>,
    pub emitted: Vec<NewExpandedAnnotation>,
}

/// Score deltas plus the rows they were computed from.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AggregationCommit {
    pub resource_id: String,
    /// One entry per (element, concept); added onto existing totals.
    pub contributions: Vec<ScoreContribution>,
    /// Direct annotation ids moved from `mapping_done` to `indexing_done`.
    pub direct_ids: Vec<i64>,
    /// Expanded annotation ids moved from `pending_index` to `indexed`.
    pub expanded_ids: Vec<i64>,
}

impl AggregationCommit {
    pub fn is_empty(&self) -> bool {
        self.contributions.is_empty() && self.direct_ids.is_empty() && self.expanded_ids.is_empty()
    }
}

/// Store operations the pipeline stages are built on.
///
/// Each commit is atomic: either every emitted row and every status change
/// lands, or none does. Status changes are guarded by the expected input
/// state; if any consumed row has already left it the commit is rejected.
#[async_trait]
pub trait AnnotationStore: Send + Sync {
    /// Contexts registered for the resource.
    async fn contexts(&self, resource_id: &str) -> Result<Vec<Context>>;

    /// Up to `limit` direct annotations of the resource in `status`, oldest first.
    async fn direct_batch(
        &self,
        resource_id: &str,
        status: DirectStatus,
        limit: i64,
    ) -> Result<Vec<DirectAnnotation>>;

    /// Up to `limit` pending expanded annotations of the given type, oldest first.
    async fn pending_expanded_batch(
        &self,
        resource_id: &str,
        expansion_type: ExpansionType,
        limit: i64,
    ) -> Result<Vec<ExpandedAnnotation>>;

    /// Insert emitted rows and advance consumed rows. Returns rows inserted.
    async fn commit_expansion(&self, commit: &ExpansionCommit) -> Result<u64>;

    /// Merge contributions additively and advance consumed rows.
    /// Returns the number of (element, concept) keys touched.
    async fn commit_aggregation(&self, commit: &AggregationCommit) -> Result<u64>;

    /// Total aggregated score rows for the resource.
    async fn aggregated_count(&self, resource_id: &str) -> Result<i64>;
}

// =============================================================================
// RESOURCE ADAPTER SURFACE
// =============================================================================

/// Registration of resources, contexts, and elements.
#[async_trait]
pub trait ResourceRepository: Send + Sync {
    /// Insert or update a resource together with its contexts.
    async fn register_resource(&self, resource: &Resource, contexts: &[Context]) -> Result<()>;

    /// Fetch a resource by id.
    async fn get_resource(&self, resource_id: &str) -> Result<Option<Resource>>;

    /// List registered resources.
    async fn list_resources(&self) -> Result<Vec<Resource>>;

    /// Add elements; already-known local ids are ignored. Returns rows inserted.
    async fn add_elements(&self, resource_id: &str, local_element_ids: &[String]) -> Result<u64>;

    /// Record the dictionary version used for every element of the resource.
    async fn mark_dictionary_version(&self, resource_id: &str, version: i32) -> Result<u64>;
}

/// Intake of direct annotations from the tagging stage.
#[async_trait]
pub trait DirectAnnotationRepository: Send + Sync {
    /// Bulk insert in state `direct_annotation_done`.
    ///
    /// Duplicates of an existing `(element, concept, context, term)` and rows
    /// naming an unknown element or context are skipped. Returns rows inserted.
    async fn add_direct_annotations(
        &self,
        resource_id: &str,
        annotations: &[NewDirectAnnotation],
    ) -> Result<u64>;

    /// Row counts per workflow status.
    async fn status_counts(&self, resource_id: &str) -> Result<StatusCounts>;
}

// =============================================================================
// SEARCH SURFACE
// =============================================================================

/// Read access to the aggregated index.
#[async_trait]
pub trait ScoreRepository: Send + Sync {
    /// Concepts scored for an element, highest first.
    async fn scores_for_element(
        &self,
        resource_id: &str,
        local_element_id: &str,
    ) -> Result<Vec<ElementConceptScore>>;

    /// Elements scored for a concept across resources, highest first.
    async fn scores_for_concept(
        &self,
        concept: &ConceptRef,
        limit: i64,
    ) -> Result<Vec<ConceptElementScore>>;

    /// Annotation counts grouped by concept ontology.
    async fn ontology_statistics(&self, resource_id: &str) -> Result<Vec<OntologyStatistics>>;
}

// =============================================================================
// MAINTENANCE
// =============================================================================

/// Administrative deletion, distinct from the forward flow.
#[async_trait]
pub trait MaintenanceRepository: Send + Sync {
    /// Remove every annotation row and score referencing the ontology.
    async fn delete_ontology(&self, ontology_id: &str) -> Result<bool> {
        self.delete_ontologies(&[ontology_id.to_string()]).await
    }

    /// Remove every annotation row and score referencing any of the ontologies.
    async fn delete_ontologies(&self, ontology_ids: &[String]) -> Result<bool>;

    /// Remove a resource with all of its elements, annotations, and scores.
    async fn delete_resource(&self, resource_id: &str) -> Result<bool>;
}
