//! Aggregation of direct and expanded annotations into per-(element, concept)
//! scores.
//!
//! Three inputs are drained in turn: direct rows at `mapping_done`, then
//! pending is-a rows, then pending mapping rows. Each batch is weighted,
//! grouped by (element, concept), and merged additively into the index in the
//! same commit that advances the consumed rows.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use obr_core::{
    with_retry, AggregationCommit, AnnotationStore, ConceptRef, DirectStatus, ExpandedAnnotation,
    Expansion, ExpansionType, ObrWeight, Result, ScoreContribution, Stage,
};

use crate::expander::usable_concept;
use crate::handler::{StageContext, StageHandler, StageReport, StageResult};

/// Which rows a batch is read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Input {
    Direct,
    Expanded(ExpansionType),
}

impl Input {
    const ORDER: [Input; 3] = [
        Input::Direct,
        Input::Expanded(ExpansionType::IsaClosure),
        Input::Expanded(ExpansionType::Mapping),
    ];

    fn as_str(self) -> &'static str {
        match self {
            Self::Direct => "aggregate_direct",
            Self::Expanded(ExpansionType::IsaClosure) => "aggregate_isa_closure",
            Self::Expanded(ExpansionType::Mapping) => "aggregate_mapping",
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct BatchOutcome {
    consumed: u64,
    skipped: u64,
    touched: u64,
}

/// Sums contributions per (element, concept).
#[derive(Debug, Default)]
struct ScoreAccumulator {
    totals: BTreeMap<(i64, String), f64>,
}

impl ScoreAccumulator {
    fn add(&mut self, element_id: i64, concept: String, score: f64) {
        *self.totals.entry((element_id, concept)).or_insert(0.0) += score;
    }

    fn into_contributions(self) -> Vec<ScoreContribution> {
        self.totals
            .into_iter()
            .map(|((element_id, concept), score)| ScoreContribution {
                element_id,
                concept,
                score,
            })
            .collect()
    }
}

/// `Aggregate(resource, weights)`.
pub struct Aggregator {
    store: Arc<dyn AnnotationStore>,
    weights: ObrWeight,
}

impl Aggregator {
    pub fn new(store: Arc<dyn AnnotationStore>, weights: ObrWeight) -> Self {
        Self { store, weights }
    }

    /// Drain every aggregation input for the resource. The report's
    /// `total_entries` is the resource's aggregated row count afterwards.
    pub async fn aggregate(&self, ctx: &StageContext) -> Result<StageReport> {
        self.weights.validate()?;

        let start = Instant::now();
        let resource_id = ctx.resource_id.as_str();
        let mut report = StageReport::new(resource_id, Stage::Aggregation);

        let store = self.store.clone();
        let context_weights: HashMap<String, f64> =
            with_retry(&ctx.retry, "load_contexts", || {
                let store = store.clone();
                async move { store.contexts(resource_id).await }
            })
            .await?
            .into_iter()
            .map(|c| (c.name, c.weight))
            .collect();

        for input in Input::ORDER {
            loop {
                let outcome = with_retry(&ctx.retry, input.as_str(), || {
                    self.run_batch(resource_id, input, ctx.batch_size, &context_weights)
                })
                .await?;

                if outcome.consumed == 0 {
                    break;
                }
                report.batches += 1;
                report.consumed += outcome.consumed;
                report.skipped += outcome.skipped;
                report.emitted += outcome.touched;
                ctx.report_progress(report.batches, outcome.consumed);

                debug!(
                    subsystem = "workflow",
                    component = "aggregator",
                    op = input.as_str(),
                    resource_id,
                    batch = report.batches,
                    consumed = outcome.consumed,
                    row_count = outcome.touched,
                    "Committed batch"
                );
            }
        }

        let store = self.store.clone();
        let total = with_retry(&ctx.retry, "aggregated_count", || {
            let store = store.clone();
            async move { store.aggregated_count(resource_id).await }
        })
        .await?;
        report.total_entries = Some(total);
        report.duration_ms = start.elapsed().as_millis() as u64;

        info!(
            subsystem = "workflow",
            component = "aggregator",
            resource_id,
            consumed = report.consumed,
            skipped = report.skipped,
            row_count = total,
            duration_ms = report.duration_ms,
            "Aggregation complete"
        );
        Ok(report)
    }

    async fn run_batch(
        &self,
        resource_id: &str,
        input: Input,
        batch_size: i64,
        context_weights: &HashMap<String, f64>,
    ) -> Result<BatchOutcome> {
        let mut scores = ScoreAccumulator::default();
        let mut commit = AggregationCommit {
            resource_id: resource_id.to_string(),
            ..Default::default()
        };
        let mut skipped = 0;

        match input {
            Input::Direct => {
                let rows = self
                    .store
                    .direct_batch(resource_id, DirectStatus::MappingDone, batch_size)
                    .await?;
                let contexts: HashSet<String> = context_weights.keys().cloned().collect();
                for row in &rows {
                    commit.direct_ids.push(row.id);
                    match (usable_concept(row, &contexts), context_weights.get(&row.context)) {
                        (Some(concept), Some(weight)) => scores.add(
                            row.element_id,
                            concept.to_string(),
                            self.weights.direct_score(*weight, row.term_kind),
                        ),
                        _ => skipped += 1,
                    }
                }
            }
            Input::Expanded(expansion_type) => {
                let rows = self
                    .store
                    .pending_expanded_batch(resource_id, expansion_type, batch_size)
                    .await?;
                for row in &rows {
                    commit.expanded_ids.push(row.id);
                    match self.expanded_score(row, context_weights) {
                        Some((concept, score)) => scores.add(row.element_id, concept, score),
                        None => skipped += 1,
                    }
                }
            }
        }

        let consumed = (commit.direct_ids.len() + commit.expanded_ids.len()) as u64;
        if consumed == 0 {
            return Ok(BatchOutcome::default());
        }

        commit.contributions = scores.into_contributions();
        let touched = self.store.commit_aggregation(&commit).await?;

        Ok(BatchOutcome {
            consumed,
            skipped,
            touched,
        })
    }

    fn expanded_score(
        &self,
        row: &ExpandedAnnotation,
        context_weights: &HashMap<String, f64>,
    ) -> Option<(String, f64)> {
        let Some(weight) = context_weights.get(&row.context) else {
            warn!(
                subsystem = "workflow",
                component = "aggregator",
                annotation_id = row.id,
                context = %row.context,
                "Skipping expanded annotation with unknown context"
            );
            return None;
        };
        let concept = match row.concept.parse::<ConceptRef>() {
            Ok(concept) => concept,
            Err(e) => {
                warn!(
                    subsystem = "workflow",
                    component = "aggregator",
                    annotation_id = row.id,
                    error = %e,
                    "Skipping expanded annotation with malformed concept"
                );
                return None;
            }
        };
        let score = match row.expansion {
            Expansion::IsaClosure { level } => self.weights.isa_score(*weight, level),
            Expansion::Mapping { .. } => self.weights.mapping_score(*weight),
        };
        Some((concept.to_string(), score))
    }
}

#[async_trait]
impl StageHandler for Aggregator {
    fn stage(&self) -> Stage {
        Stage::Aggregation
    }

    async fn execute(&self, ctx: StageContext) -> StageResult {
        match self.aggregate(&ctx).await {
            Ok(report) => StageResult::Success(report),
            Err(e) => StageResult::Failed(e.to_string()),
        }
    }
}
