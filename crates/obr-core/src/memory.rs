//! In-memory annotation store and static ontology relations for testing.
//!
//! Implements every store trait with the same gating and atomicity rules as
//! the PostgreSQL backend, so pipeline behaviour can be tested without a
//! database.
//!
//! ## Usage
//!
//! ```rust
//! use obr_core::memory::{MemoryAnnotationStore, StaticOntologyRelations};
//! use obr_core::ConceptRef;
//!
//! let store = MemoryAnnotationStore::new();
//! let relations = StaticOntologyRelations::new()
//!     .with_parent(ConceptRef::new("NCI", "C1"), ConceptRef::new("NCI", "C2"), 1);
//! ```

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;

use crate::error::{Error, Result};
use crate::models::*;
use crate::traits::*;
use crate::workflow::{DirectStatus, ExpandedStatus};

// =============================================================================
// STATIC ONTOLOGY RELATIONS
// =============================================================================

/// Fixture-backed [`OntologyRelations`].
#[derive(Debug, Clone, Default)]
pub struct StaticOntologyRelations {
    parents: HashMap<ConceptRef, Vec<(ConceptRef, i32)>>,
    mappings: HashMap<ConceptRef, Vec<(ConceptRef, MappingType)>>,
}

impl StaticOntologyRelations {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `ParentOf(concept, ancestor, level)`.
    pub fn with_parent(mut self, concept: ConceptRef, ancestor: ConceptRef, level: i32) -> Self {
        self.parents
            .entry(concept)
            .or_default()
            .push((ancestor, level));
        self
    }

    /// Add `MappedTo(concept, target, mapping_type)`.
    pub fn with_mapping(
        mut self,
        concept: ConceptRef,
        target: ConceptRef,
        mapping_type: MappingType,
    ) -> Self {
        self.mappings
            .entry(concept)
            .or_default()
            .push((target, mapping_type));
        self
    }
}

#[async_trait]
impl OntologyRelations for StaticOntologyRelations {
    async fn parents_of(&self, concepts: &[ConceptRef]) -> Result<Vec<ParentEdge>> {
        Ok(concepts
            .iter()
            .flat_map(|c| {
                self.parents
                    .get(c)
                    .into_iter()
                    .flatten()
                    .map(move |(ancestor, level)| ParentEdge {
                        concept: c.clone(),
                        ancestor: ancestor.clone(),
                        level: *level,
                    })
            })
            .collect())
    }

    async fn mappings_of(&self, concepts: &[ConceptRef]) -> Result<Vec<MappingEdge>> {
        Ok(concepts
            .iter()
            .flat_map(|c| {
                self.mappings
                    .get(c)
                    .into_iter()
                    .flatten()
                    .map(move |(target, mapping_type)| MappingEdge {
                        concept: c.clone(),
                        target: target.clone(),
                        mapping_type: *mapping_type,
                    })
            })
            .collect())
    }
}

// =============================================================================
// IN-MEMORY STORE
// =============================================================================

#[derive(Debug, Default)]
struct MemoryState {
    resources: BTreeMap<String, Resource>,
    contexts: BTreeMap<String, Vec<Context>>,
    elements: Vec<Element>,
    direct: Vec<DirectAnnotation>,
    expanded: Vec<ExpandedAnnotation>,
    scores: BTreeMap<(i64, String), f64>,
    next_id: i64,
    pending_failures: u32,
}

impl MemoryState {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    fn element_ids(&self, resource_id: &str) -> HashSet<i64> {
        self.elements
            .iter()
            .filter(|e| e.resource_id == resource_id)
            .map(|e| e.id)
            .collect()
    }

    fn take_injected_failure(&mut self) -> Result<()> {
        if self.pending_failures > 0 {
            self.pending_failures -= 1;
            return Err(Error::Database(sqlx::Error::PoolTimedOut));
        }
        Ok(())
    }
}

/// Ontology id of a stored concept reference; the whole string if it has no `/`.
fn ontology_of(concept: &str) -> &str {
    concept.split('/').next().unwrap_or(concept)
}

fn stats_entry<'a>(
    stats: &'a mut BTreeMap<String, OntologyStatistics>,
    concept: &str,
) -> &'a mut OntologyStatistics {
    let ontology = ontology_of(concept).to_string();
    stats
        .entry(ontology.clone())
        .or_insert_with(|| OntologyStatistics {
            ontology_id: ontology,
            ..Default::default()
        })
}

/// Thread-safe in-memory implementation of the store traits.
#[derive(Debug, Clone, Default)]
pub struct MemoryAnnotationStore {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryAnnotationStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> Result<MutexGuard<'_, MemoryState>> {
        self.state
            .lock()
            .map_err(|_| Error::Internal("memory store lock poisoned".into()))
    }

    /// Make the next `n` commit calls fail with a transient pool timeout
    /// before touching any state.
    pub fn inject_transient_failures(&self, n: u32) -> Result<()> {
        self.state()?.pending_failures = n;
        Ok(())
    }

    /// Snapshot of the resource's direct annotations.
    pub fn direct_annotations(&self, resource_id: &str) -> Result<Vec<DirectAnnotation>> {
        let state = self.state()?;
        let elements = state.element_ids(resource_id);
        Ok(state
            .direct
            .iter()
            .filter(|d| elements.contains(&d.element_id))
            .cloned()
            .collect())
    }

    /// Snapshot of the resource's expanded annotations.
    pub fn expanded_annotations(&self, resource_id: &str) -> Result<Vec<ExpandedAnnotation>> {
        let state = self.state()?;
        let elements = state.element_ids(resource_id);
        Ok(state
            .expanded
            .iter()
            .filter(|x| elements.contains(&x.element_id))
            .cloned()
            .collect())
    }

    /// Snapshot of the resource's aggregated scores.
    pub fn aggregated_scores(&self, resource_id: &str) -> Result<Vec<AggregatedScore>> {
        let state = self.state()?;
        let elements = state.element_ids(resource_id);
        Ok(state
            .scores
            .iter()
            .filter(|((element_id, _), _)| elements.contains(element_id))
            .map(|((element_id, concept), score)| AggregatedScore {
                element_id: *element_id,
                concept: concept.clone(),
                score: *score,
            })
            .collect())
    }

    /// Aggregated score of one (element, concept) pair.
    pub fn score(
        &self,
        resource_id: &str,
        local_element_id: &str,
        concept: &str,
    ) -> Result<Option<f64>> {
        let state = self.state()?;
        let element = state
            .elements
            .iter()
            .find(|e| e.resource_id == resource_id && e.local_element_id == local_element_id);
        Ok(element.and_then(|e| state.scores.get(&(e.id, concept.to_string())).copied()))
    }
}

#[async_trait]
impl ResourceRepository for MemoryAnnotationStore {
    async fn register_resource(&self, resource: &Resource, contexts: &[Context]) -> Result<()> {
        let mut state = self.state()?;
        state
            .resources
            .insert(resource.resource_id.clone(), resource.clone());
        let registered = state
            .contexts
            .entry(resource.resource_id.clone())
            .or_default();
        for context in contexts {
            match registered.iter_mut().find(|c| c.name == context.name) {
                Some(existing) => *existing = context.clone(),
                None => registered.push(context.clone()),
            }
        }
        Ok(())
    }

    async fn get_resource(&self, resource_id: &str) -> Result<Option<Resource>> {
        Ok(self.state()?.resources.get(resource_id).cloned())
    }

    async fn list_resources(&self) -> Result<Vec<Resource>> {
        Ok(self.state()?.resources.values().cloned().collect())
    }

    async fn add_elements(&self, resource_id: &str, local_element_ids: &[String]) -> Result<u64> {
        let mut state = self.state()?;
        if !state.resources.contains_key(resource_id) {
            return Err(Error::NotFound(format!("resource {}", resource_id)));
        }
        let mut inserted = 0;
        for local in local_element_ids {
            let exists = state
                .elements
                .iter()
                .any(|e| e.resource_id == resource_id && &e.local_element_id == local);
            if !exists {
                let id = state.next_id();
                state.elements.push(Element {
                    id,
                    resource_id: resource_id.to_string(),
                    local_element_id: local.clone(),
                    dictionary_version: None,
                });
                inserted += 1;
            }
        }
        Ok(inserted)
    }

    async fn mark_dictionary_version(&self, resource_id: &str, version: i32) -> Result<u64> {
        let mut state = self.state()?;
        let resource = state
            .resources
            .get_mut(resource_id)
            .ok_or_else(|| Error::NotFound(format!("resource {}", resource_id)))?;
        resource.last_dictionary_version = Some(version);
        let mut updated = 0;
        for element in state
            .elements
            .iter_mut()
            .filter(|e| e.resource_id == resource_id)
        {
            element.dictionary_version = Some(version);
            updated += 1;
        }
        Ok(updated)
    }
}

#[async_trait]
impl DirectAnnotationRepository for MemoryAnnotationStore {
    async fn add_direct_annotations(
        &self,
        resource_id: &str,
        annotations: &[NewDirectAnnotation],
    ) -> Result<u64> {
        let mut state = self.state()?;
        let mut inserted = 0;
        for new in annotations {
            let element_id = state
                .elements
                .iter()
                .find(|e| e.resource_id == resource_id && e.local_element_id == new.local_element_id)
                .map(|e| e.id);
            let known_context = state
                .contexts
                .get(resource_id)
                .map(|cs| cs.iter().any(|c| c.name == new.context))
                .unwrap_or(false);
            let Some(element_id) = element_id.filter(|_| known_context) else {
                continue;
            };
            let duplicate = state.direct.iter().any(|d| {
                d.element_id == element_id
                    && d.concept == new.concept
                    && d.context == new.context
                    && d.term_id == new.term_id
            });
            if duplicate {
                continue;
            }
            let id = state.next_id();
            state.direct.push(DirectAnnotation {
                id,
                element_id,
                concept: new.concept.clone(),
                context: new.context.clone(),
                term_kind: new.term_kind,
                term_id: new.term_id.clone(),
                status: DirectStatus::DirectAnnotationDone,
            });
            inserted += 1;
        }
        Ok(inserted)
    }

    async fn status_counts(&self, resource_id: &str) -> Result<StatusCounts> {
        let state = self.state()?;
        let elements = state.element_ids(resource_id);
        let direct = DirectStatus::ALL
            .iter()
            .map(|s| {
                let n = state
                    .direct
                    .iter()
                    .filter(|d| d.status == *s && elements.contains(&d.element_id))
                    .count() as i64;
                (*s, n)
            })
            .filter(|(_, n)| *n > 0)
            .collect();
        let expanded = ExpandedStatus::ALL
            .iter()
            .map(|s| {
                let n = state
                    .expanded
                    .iter()
                    .filter(|x| x.status == *s && elements.contains(&x.element_id))
                    .count() as i64;
                (*s, n)
            })
            .filter(|(_, n)| *n > 0)
            .collect();
        Ok(StatusCounts { direct, expanded })
    }
}

#[async_trait]
impl AnnotationStore for MemoryAnnotationStore {
    async fn contexts(&self, resource_id: &str) -> Result<Vec<Context>> {
        Ok(self
            .state()?
            .contexts
            .get(resource_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn direct_batch(
        &self,
        resource_id: &str,
        status: DirectStatus,
        limit: i64,
    ) -> Result<Vec<DirectAnnotation>> {
        let state = self.state()?;
        let elements = state.element_ids(resource_id);
        Ok(state
            .direct
            .iter()
            .filter(|d| d.status == status && elements.contains(&d.element_id))
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }

    async fn pending_expanded_batch(
        &self,
        resource_id: &str,
        expansion_type: ExpansionType,
        limit: i64,
    ) -> Result<Vec<ExpandedAnnotation>> {
        let state = self.state()?;
        let elements = state.element_ids(resource_id);
        Ok(state
            .expanded
            .iter()
            .filter(|x| {
                x.status == ExpandedStatus::PendingIndex
                    && x.expansion.expansion_type() == expansion_type
                    && elements.contains(&x.element_id)
            })
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }

    async fn commit_expansion(&self, commit: &ExpansionCommit) -> Result<u64> {
        let mut state = self.state()?;
        state.take_injected_failure()?;

        let consumed: HashSet<i64> = commit.consumed.iter().copied().collect();
        let input = commit.stage.input();
        let ready = state
            .direct
            .iter()
            .filter(|d| consumed.contains(&d.id) && d.status == input)
            .count();
        if ready != consumed.len() {
            return Err(Error::Internal(format!(
                "{} of {} rows left {} before commit",
                consumed.len() - ready,
                consumed.len(),
                input
            )));
        }

        for d in state.direct.iter_mut().filter(|d| consumed.contains(&d.id)) {
            d.status = d.status.advance(commit.stage)?;
        }
        for new in &commit.emitted {
            let id = state.next_id();
            state.expanded.push(ExpandedAnnotation {
                id,
                element_id: new.element_id,
                concept: new.concept.clone(),
                context: new.context.clone(),
                origin_concept: new.origin_concept.clone(),
                expansion: new.expansion,
                status: ExpandedStatus::PendingIndex,
            });
        }
        Ok(commit.emitted.len() as u64)
    }

    async fn commit_aggregation(&self, commit: &AggregationCommit) -> Result<u64> {
        let mut state = self.state()?;
        state.take_injected_failure()?;

        let direct_ids: HashSet<i64> = commit.direct_ids.iter().copied().collect();
        let expanded_ids: HashSet<i64> = commit.expanded_ids.iter().copied().collect();
        let direct_ready = state
            .direct
            .iter()
            .filter(|d| direct_ids.contains(&d.id) && d.status == DirectStatus::MappingDone)
            .count();
        let expanded_ready = state
            .expanded
            .iter()
            .filter(|x| expanded_ids.contains(&x.id) && x.status == ExpandedStatus::PendingIndex)
            .count();
        if direct_ready != direct_ids.len() || expanded_ready != expanded_ids.len() {
            return Err(Error::Internal(
                "aggregation input rows changed state before commit".into(),
            ));
        }

        for d in state.direct.iter_mut().filter(|d| direct_ids.contains(&d.id)) {
            d.status = DirectStatus::IndexingDone;
        }
        for x in state
            .expanded
            .iter_mut()
            .filter(|x| expanded_ids.contains(&x.id))
        {
            x.status = ExpandedStatus::Indexed;
        }
        for c in &commit.contributions {
            *state
                .scores
                .entry((c.element_id, c.concept.clone()))
                .or_insert(0.0) += c.score;
        }
        Ok(commit.contributions.len() as u64)
    }

    async fn aggregated_count(&self, resource_id: &str) -> Result<i64> {
        let state = self.state()?;
        let elements = state.element_ids(resource_id);
        Ok(state
            .scores
            .keys()
            .filter(|(element_id, _)| elements.contains(element_id))
            .count() as i64)
    }
}

#[async_trait]
impl ScoreRepository for MemoryAnnotationStore {
    async fn scores_for_element(
        &self,
        resource_id: &str,
        local_element_id: &str,
    ) -> Result<Vec<ElementConceptScore>> {
        let state = self.state()?;
        let Some(element) = state
            .elements
            .iter()
            .find(|e| e.resource_id == resource_id && e.local_element_id == local_element_id)
        else {
            return Ok(Vec::new());
        };
        let mut scores: Vec<ElementConceptScore> = state
            .scores
            .iter()
            .filter(|((element_id, _), _)| *element_id == element.id)
            .map(|((_, concept), score)| ElementConceptScore {
                concept: concept.clone(),
                score: *score,
            })
            .collect();
        scores.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| a.concept.cmp(&b.concept))
        });
        Ok(scores)
    }

    async fn scores_for_concept(
        &self,
        concept: &ConceptRef,
        limit: i64,
    ) -> Result<Vec<ConceptElementScore>> {
        let state = self.state()?;
        let concept = concept.to_string();
        let elements: HashMap<i64, &Element> = state.elements.iter().map(|e| (e.id, e)).collect();
        let mut hits: Vec<ConceptElementScore> = state
            .scores
            .iter()
            .filter(|((_, c), _)| *c == concept)
            .filter_map(|((element_id, _), score)| {
                elements.get(element_id).map(|e| ConceptElementScore {
                    resource_id: e.resource_id.clone(),
                    local_element_id: e.local_element_id.clone(),
                    score: *score,
                })
            })
            .collect();
        hits.sort_by(|a, b| b.score.total_cmp(&a.score));
        hits.truncate(limit.max(0) as usize);
        Ok(hits)
    }

    async fn ontology_statistics(&self, resource_id: &str) -> Result<Vec<OntologyStatistics>> {
        let state = self.state()?;
        let elements = state.element_ids(resource_id);
        let mut stats: BTreeMap<String, OntologyStatistics> = BTreeMap::new();
        for d in state.direct.iter().filter(|d| elements.contains(&d.element_id)) {
            stats_entry(&mut stats, &d.concept).direct_annotations += 1;
        }
        for x in state
            .expanded
            .iter()
            .filter(|x| elements.contains(&x.element_id))
        {
            let s = stats_entry(&mut stats, &x.concept);
            match x.expansion.expansion_type() {
                ExpansionType::IsaClosure => s.isa_annotations += 1,
                ExpansionType::Mapping => s.mapping_annotations += 1,
            }
        }
        for (element_id, concept) in state.scores.keys() {
            if elements.contains(element_id) {
                stats_entry(&mut stats, concept).aggregated_scores += 1;
            }
        }
        Ok(stats.into_values().collect())
    }
}

#[async_trait]
impl MaintenanceRepository for MemoryAnnotationStore {
    async fn delete_ontologies(&self, ontology_ids: &[String]) -> Result<bool> {
        let mut state = self.state()?;
        let doomed: HashSet<&str> = ontology_ids.iter().map(String::as_str).collect();
        state.direct.retain(|d| !doomed.contains(ontology_of(&d.concept)));
        state.expanded.retain(|x| {
            !doomed.contains(ontology_of(&x.concept))
                && !doomed.contains(ontology_of(&x.origin_concept))
        });
        state
            .scores
            .retain(|(_, concept), _| !doomed.contains(ontology_of(concept)));
        Ok(true)
    }

    async fn delete_resource(&self, resource_id: &str) -> Result<bool> {
        let mut state = self.state()?;
        let elements = state.element_ids(resource_id);
        state.direct.retain(|d| !elements.contains(&d.element_id));
        state.expanded.retain(|x| !elements.contains(&x.element_id));
        state
            .scores
            .retain(|(element_id, _), _| !elements.contains(element_id));
        state.elements.retain(|e| e.resource_id != resource_id);
        state.contexts.remove(resource_id);
        state.resources.remove(resource_id);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resource(id: &str) -> Resource {
        Resource {
            resource_id: id.to_string(),
            name: format!("{id} resource"),
            description: None,
            main_context: Some(format!("{id}_title")),
            last_dictionary_version: None,
        }
    }

    async fn seeded() -> MemoryAnnotationStore {
        let store = MemoryAnnotationStore::new();
        store
            .register_resource(
                &resource("GEO"),
                &[Context::new(
                    "GEO",
                    "GEO_title",
                    1.0,
                    ContextKind::ForConceptRecognition,
                )],
            )
            .await
            .unwrap();
        store
            .add_elements("GEO", &["E1".to_string(), "E2".to_string()])
            .await
            .unwrap();
        store
    }

    #[tokio::test]
    async fn test_static_relations_lookup() {
        let c1 = ConceptRef::new("NCI", "C1");
        let relations = StaticOntologyRelations::new()
            .with_parent(c1.clone(), ConceptRef::new("NCI", "C2"), 1)
            .with_parent(c1.clone(), ConceptRef::new("NCI", "C3"), 2);

        let edges = relations
            .parents_of(&[c1.clone(), ConceptRef::new("NCI", "X")])
            .await
            .unwrap();
        assert_eq!(edges.len(), 2);
        assert!(edges.iter().all(|e| e.concept == c1));
        assert!(relations.mappings_of(&[c1]).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_add_elements_ignores_duplicates() {
        let store = seeded().await;
        let inserted = store
            .add_elements("GEO", &["E1".to_string(), "E3".to_string()])
            .await
            .unwrap();
        assert_eq!(inserted, 1);
    }

    #[tokio::test]
    async fn test_add_elements_unknown_resource() {
        let store = MemoryAnnotationStore::new();
        let err = store.add_elements("PM", &["x".into()]).await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn test_add_direct_skips_duplicates_and_unknown_rows() {
        let store = seeded().await;
        let c = ConceptRef::new("NCI", "C1");
        let rows = vec![
            NewDirectAnnotation::matched("E1", &c, "GEO_title", TermKind::PreferredTerm, "t1"),
            NewDirectAnnotation::matched("E1", &c, "GEO_title", TermKind::PreferredTerm, "t1"),
            NewDirectAnnotation::matched("E9", &c, "GEO_title", TermKind::PreferredTerm, "t1"),
            NewDirectAnnotation::matched("E1", &c, "GEO_summary", TermKind::PreferredTerm, "t1"),
        ];
        assert_eq!(store.add_direct_annotations("GEO", &rows).await.unwrap(), 1);

        let counts = store.status_counts("GEO").await.unwrap();
        assert_eq!(counts.direct_in(DirectStatus::DirectAnnotationDone), 1);
    }

    #[tokio::test]
    async fn test_commit_expansion_rejects_rows_past_gate() {
        let store = seeded().await;
        let c = ConceptRef::new("NCI", "C1");
        store
            .add_direct_annotations(
                "GEO",
                &[NewDirectAnnotation::matched(
                    "E1",
                    &c,
                    "GEO_title",
                    TermKind::PreferredTerm,
                    "t1",
                )],
            )
            .await
            .unwrap();
        let id = store.direct_annotations("GEO").unwrap()[0].id;
        let commit = ExpansionCommit {
            resource_id: "GEO".into(),
            stage: crate::Stage::IsaClosure,
            consumed: vec![id],
            emitted: vec![],
        };
        store.commit_expansion(&commit).await.unwrap();
        assert!(store.commit_expansion(&commit).await.is_err());
    }

    #[tokio::test]
    async fn test_injected_failure_leaves_state_untouched() {
        let store = seeded().await;
        store.inject_transient_failures(1).unwrap();
        let commit = AggregationCommit {
            resource_id: "GEO".into(),
            contributions: vec![ScoreContribution {
                element_id: 1,
                concept: "NCI/C1".into(),
                score: 3.0,
            }],
            ..Default::default()
        };
        let err = store.commit_aggregation(&commit).await.unwrap_err();
        assert!(err.is_transient());
        assert_eq!(store.aggregated_count("GEO").await.unwrap(), 0);

        store.commit_aggregation(&commit).await.unwrap();
        assert_eq!(store.aggregated_count("GEO").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_mark_dictionary_version() {
        let store = seeded().await;
        assert_eq!(store.mark_dictionary_version("GEO", 12).await.unwrap(), 2);
        let r = store.get_resource("GEO").await.unwrap().unwrap();
        assert_eq!(r.last_dictionary_version, Some(12));
    }

    #[test]
    fn test_ontology_of() {
        assert_eq!(ontology_of("NCI/C1"), "NCI");
        assert_eq!(ontology_of("broken"), "broken");
    }
}
