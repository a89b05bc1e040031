//! Is-a closure and mapping expansion.
//!
//! Both stages read direct annotations at their input gate in batches, look
//! up the relation for every distinct concept of the batch at once, emit one
//! expanded annotation per (row, related concept), and commit the emitted rows
//! together with the consumed rows' transition in one atomic store call.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use obr_core::{
    with_retry, AnnotationStore, ConceptRef, DirectAnnotation, Error, Expansion, ExpansionCommit,
    NewExpandedAnnotation, OntologyRelations, Result, Stage,
};

use crate::handler::{StageContext, StageHandler, StageReport, StageResult};

/// Expands direct annotations along one ontology relation.
pub struct Expander {
    stage: Stage,
    store: Arc<dyn AnnotationStore>,
    relations: Arc<dyn OntologyRelations>,
}

/// Counts for one committed batch.
#[derive(Debug, Default, Clone, Copy)]
struct BatchOutcome {
    consumed: u64,
    skipped: u64,
    emitted: u64,
}

type RelatedConcepts = HashMap<ConceptRef, Vec<(ConceptRef, Expansion)>>;

impl Expander {
    /// `ExpandIsaClosure`: emit every ancestor with its is-a distance.
    pub fn isa_closure(
        store: Arc<dyn AnnotationStore>,
        relations: Arc<dyn OntologyRelations>,
    ) -> Self {
        Self {
            stage: Stage::IsaClosure,
            store,
            relations,
        }
    }

    /// `ExpandMapping`: emit every mapped concept with its mapping type.
    pub fn mapping(store: Arc<dyn AnnotationStore>, relations: Arc<dyn OntologyRelations>) -> Self {
        Self {
            stage: Stage::Mapping,
            store,
            relations,
        }
    }

    /// Drain the stage input for the resource. The report's `emitted` count is
    /// the number of expanded rows created.
    pub async fn expand(&self, ctx: &StageContext) -> Result<StageReport> {
        let start = Instant::now();
        let resource_id = ctx.resource_id.as_str();
        let mut report = StageReport::new(resource_id, self.stage);

        let store = self.store.clone();
        let contexts: HashSet<String> = with_retry(&ctx.retry, "load_contexts", || {
            let store = store.clone();
            async move { store.contexts(resource_id).await }
        })
        .await?
        .into_iter()
        .map(|c| c.name)
        .collect();

        loop {
            let outcome = with_retry(&ctx.retry, self.stage.as_str(), || {
                self.run_batch(resource_id, ctx.batch_size, &contexts)
            })
            .await?;

            if outcome.consumed == 0 {
                break;
            }
            report.batches += 1;
            report.consumed += outcome.consumed;
            report.skipped += outcome.skipped;
            report.emitted += outcome.emitted;
            ctx.report_progress(report.batches, outcome.consumed);

            debug!(
                subsystem = "workflow",
                component = "expander",
                resource_id,
                stage = %self.stage,
                batch = report.batches,
                row_count = outcome.emitted,
                consumed = outcome.consumed,
                "Committed batch"
            );
        }

        report.duration_ms = start.elapsed().as_millis() as u64;
        info!(
            subsystem = "workflow",
            component = "expander",
            resource_id,
            stage = %self.stage,
            consumed = report.consumed,
            skipped = report.skipped,
            row_count = report.emitted,
            duration_ms = report.duration_ms,
            "Expansion complete"
        );
        Ok(report)
    }

    /// Read, expand, and commit one batch. Replayed as a whole on transient
    /// failure; rows committed by an earlier attempt are no longer selected.
    async fn run_batch(
        &self,
        resource_id: &str,
        batch_size: i64,
        contexts: &HashSet<String>,
    ) -> Result<BatchOutcome> {
        let rows = self
            .store
            .direct_batch(resource_id, self.stage.input(), batch_size)
            .await?;
        if rows.is_empty() {
            return Ok(BatchOutcome::default());
        }

        let mut usable: Vec<(&DirectAnnotation, ConceptRef)> = Vec::with_capacity(rows.len());
        let mut skipped = 0;
        for row in &rows {
            match usable_concept(row, contexts) {
                Some(concept) => usable.push((row, concept)),
                None => skipped += 1,
            }
        }

        let distinct: Vec<ConceptRef> = usable
            .iter()
            .map(|(_, c)| c.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let related = self.related(&distinct).await?;

        let mut emitted = Vec::new();
        for (row, concept) in &usable {
            let Some(targets) = related.get(concept) else {
                continue;
            };
            let origin = concept.to_string();
            for (target, expansion) in targets {
                emitted.push(NewExpandedAnnotation {
                    element_id: row.element_id,
                    concept: target.to_string(),
                    context: row.context.clone(),
                    origin_concept: origin.clone(),
                    expansion: *expansion,
                });
            }
        }

        let commit = ExpansionCommit {
            resource_id: resource_id.to_string(),
            stage: self.stage,
            consumed: rows.iter().map(|r| r.id).collect(),
            emitted,
        };
        let inserted = self.store.commit_expansion(&commit).await?;

        Ok(BatchOutcome {
            consumed: rows.len() as u64,
            skipped,
            emitted: inserted,
        })
    }

    /// One relation lookup for all distinct concepts of a batch.
    async fn related(&self, concepts: &[ConceptRef]) -> Result<RelatedConcepts> {
        let mut related: RelatedConcepts = HashMap::new();
        if concepts.is_empty() {
            return Ok(related);
        }
        match self.stage {
            Stage::IsaClosure => {
                for edge in self.relations.parents_of(concepts).await? {
                    if edge.level < 1 {
                        warn!(
                            subsystem = "workflow",
                            component = "expander",
                            concept = %edge.concept,
                            ancestor = %edge.ancestor,
                            level = edge.level,
                            "Skipping is-a edge with non-positive level"
                        );
                        continue;
                    }
                    related.entry(edge.concept).or_default().push((
                        edge.ancestor,
                        Expansion::IsaClosure { level: edge.level },
                    ));
                }
            }
            Stage::Mapping => {
                for edge in self.relations.mappings_of(concepts).await? {
                    related.entry(edge.concept).or_default().push((
                        edge.target,
                        Expansion::Mapping {
                            mapping_type: edge.mapping_type,
                        },
                    ));
                }
            }
            Stage::Aggregation => {
                return Err(Error::Internal(
                    "aggregation is not an expansion stage".into(),
                ))
            }
        }
        Ok(related)
    }
}

/// Concept of a row that can be expanded, or `None` (logged) if the row is
/// malformed and only advances.
pub(crate) fn usable_concept(
    row: &DirectAnnotation,
    contexts: &HashSet<String>,
) -> Option<ConceptRef> {
    if !contexts.contains(&row.context) {
        warn!(
            subsystem = "workflow",
            annotation_id = row.id,
            context = %row.context,
            "Skipping annotation with unknown context"
        );
        return None;
    }
    match row.concept.parse::<ConceptRef>() {
        Ok(concept) => Some(concept),
        Err(e) => {
            warn!(
                subsystem = "workflow",
                annotation_id = row.id,
                error = %e,
                "Skipping annotation with malformed concept"
            );
            None
        }
    }
}

#[async_trait]
impl StageHandler for Expander {
    fn stage(&self) -> Stage {
        self.stage
    }

    async fn execute(&self, ctx: StageContext) -> StageResult {
        match self.expand(&ctx).await {
            Ok(report) => StageResult::Success(report),
            Err(e) => StageResult::Failed(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use obr_core::memory::{MemoryAnnotationStore, StaticOntologyRelations};
    use obr_core::{
        Context, ContextKind, DirectAnnotationRepository, DirectStatus, ExpandedStatus,
        MappingType, NewDirectAnnotation, Resource, ResourceRepository, TermKind,
    };

    fn c(s: &str) -> ConceptRef {
        s.parse().unwrap()
    }

    async fn store_with(rows: &[NewDirectAnnotation]) -> Arc<MemoryAnnotationStore> {
        let store = Arc::new(MemoryAnnotationStore::new());
        store
            .register_resource(
                &Resource {
                    resource_id: "R".into(),
                    name: "R".into(),
                    description: None,
                    main_context: None,
                    last_dictionary_version: None,
                },
                &[Context::new("R", "title", 1.0, ContextKind::ForConceptRecognition)],
            )
            .await
            .unwrap();
        store
            .add_elements("R", &["E1".to_string(), "E2".to_string()])
            .await
            .unwrap();
        store.add_direct_annotations("R", rows).await.unwrap();
        store
    }

    fn matched(local: &str, concept: &str) -> NewDirectAnnotation {
        NewDirectAnnotation::matched(local, &c(concept), "title", TermKind::PreferredTerm, "t")
    }

    #[tokio::test]
    async fn test_isa_expansion_emits_every_ancestor() {
        let store = store_with(&[matched("E1", "NCI/C1")]).await;
        let relations = Arc::new(
            StaticOntologyRelations::new()
                .with_parent(c("NCI/C1"), c("NCI/C2"), 1)
                .with_parent(c("NCI/C1"), c("NCI/C3"), 2),
        );
        let expander = Expander::isa_closure(store.clone(), relations);

        let report = expander.expand(&StageContext::new("R")).await.unwrap();
        assert_eq!(report.consumed, 1);
        assert_eq!(report.emitted, 2);
        assert_eq!(report.count(), 2);

        let expanded = store.expanded_annotations("R").unwrap();
        let mut levels: Vec<(String, Option<i32>)> = expanded
            .iter()
            .map(|x| (x.concept.clone(), x.expansion.level()))
            .collect();
        levels.sort();
        assert_eq!(
            levels,
            vec![("NCI/C2".into(), Some(1)), ("NCI/C3".into(), Some(2))]
        );
        assert!(expanded
            .iter()
            .all(|x| x.origin_concept == "NCI/C1" && x.status == ExpandedStatus::PendingIndex));

        let direct = store.direct_annotations("R").unwrap();
        assert_eq!(direct[0].status, DirectStatus::IsaClosureDone);
    }

    #[tokio::test]
    async fn test_rerun_is_noop() {
        let store = store_with(&[matched("E1", "NCI/C1")]).await;
        let relations =
            Arc::new(StaticOntologyRelations::new().with_parent(c("NCI/C1"), c("NCI/C2"), 1));
        let expander = Expander::isa_closure(store.clone(), relations);

        expander.expand(&StageContext::new("R")).await.unwrap();
        let second = expander.expand(&StageContext::new("R")).await.unwrap();
        assert_eq!(second.consumed, 0);
        assert_eq!(second.batches, 0);
        assert_eq!(store.expanded_annotations("R").unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_batches_loop_until_drained() {
        let rows: Vec<_> = (0..5)
            .map(|i| matched(if i % 2 == 0 { "E1" } else { "E2" }, &format!("GO/{i}")))
            .collect();
        let store = store_with(&rows).await;
        let expander = Expander::isa_closure(store.clone(), Arc::new(StaticOntologyRelations::new()));

        let report = expander
            .expand(&StageContext::new("R").with_batch_size(2))
            .await
            .unwrap();
        assert_eq!(report.batches, 3);
        assert_eq!(report.consumed, 5);
        assert_eq!(report.emitted, 0);
        assert!(store
            .direct_annotations("R")
            .unwrap()
            .iter()
            .all(|d| d.status == DirectStatus::IsaClosureDone));
    }

    #[tokio::test]
    async fn test_mapping_expansion_reads_isa_output() {
        let store = store_with(&[matched("E1", "MSH/D1")]).await;
        let relations = Arc::new(StaticOntologyRelations::new().with_mapping(
            c("MSH/D1"),
            c("NCI/C9"),
            MappingType::ExplicitRelation,
        ));

        // Nothing is at the mapping gate yet.
        let mapping = Expander::mapping(store.clone(), relations.clone());
        assert_eq!(mapping.expand(&StageContext::new("R")).await.unwrap().consumed, 0);

        Expander::isa_closure(store.clone(), relations)
            .expand(&StageContext::new("R"))
            .await
            .unwrap();
        let report = mapping.expand(&StageContext::new("R")).await.unwrap();
        assert_eq!(report.emitted, 1);

        let expanded = store.expanded_annotations("R").unwrap();
        assert_eq!(
            expanded[0].expansion,
            Expansion::Mapping {
                mapping_type: MappingType::ExplicitRelation
            }
        );
        assert_eq!(
            store.direct_annotations("R").unwrap()[0].status,
            DirectStatus::MappingDone
        );
    }

    #[tokio::test]
    async fn test_self_ancestor_is_emitted_as_supplied() {
        let store = store_with(&[matched("E1", "GO/1")]).await;
        let relations =
            Arc::new(StaticOntologyRelations::new().with_parent(c("GO/1"), c("GO/1"), 1));
        let report = Expander::isa_closure(store.clone(), relations)
            .expand(&StageContext::new("R"))
            .await
            .unwrap();
        assert_eq!(report.emitted, 1);
        assert_eq!(store.expanded_annotations("R").unwrap()[0].concept, "GO/1");
    }

    #[test]
    fn test_usable_concept_rejects_malformed_rows() {
        let contexts: HashSet<String> = ["title".to_string()].into_iter().collect();
        let row = |concept: &str, context: &str| DirectAnnotation {
            id: 1,
            element_id: 1,
            concept: concept.into(),
            context: context.into(),
            term_kind: TermKind::PreferredTerm,
            term_id: None,
            status: DirectStatus::DirectAnnotationDone,
        };
        assert_eq!(
            usable_concept(&row("GO/1", "title"), &contexts),
            Some(c("GO/1"))
        );
        assert_eq!(usable_concept(&row("GO1", "title"), &contexts), None);
        assert_eq!(usable_concept(&row("GO/1", "abstract"), &contexts), None);
    }
}
