//! Pipeline surface of the annotation store.
//!
//! Every commit runs in one transaction. Status updates are guarded by the
//! expected input state (`id = ANY($n) AND status = $m`); when fewer rows
//! match than were consumed, another run got there first and the whole
//! transaction is rolled back.

use std::time::Instant;

use async_trait::async_trait;
use sqlx::{postgres::PgRow, Pool, Postgres, Row, Transaction};
use tracing::debug;

use obr_core::{
    AggregationCommit, AnnotationStore, Context, DirectAnnotation, DirectStatus, Error,
    ExpandedAnnotation, ExpandedStatus, Expansion, ExpansionCommit, ExpansionType, MappingType,
    NewExpandedAnnotation, Result,
};

use crate::resources::parse_context_row;

/// PostgreSQL implementation of AnnotationStore.
pub struct PgAnnotationStore {
    pool: Pool<Postgres>,
}

impl PgAnnotationStore {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }
}

pub(crate) fn parse_direct_row(row: PgRow) -> Result<DirectAnnotation> {
    let term_kind: String = row.get("term_kind");
    let status: String = row.get("status");
    Ok(DirectAnnotation {
        id: row.get("id"),
        element_id: row.get("element_id"),
        concept: row.get("concept"),
        context: row.get("context"),
        term_kind: term_kind.parse().map_err(Error::Serialization)?,
        term_id: row.get("term_id"),
        status: status.parse().map_err(Error::Serialization)?,
    })
}

pub(crate) fn parse_expansion(
    expansion_type: &str,
    isa_level: Option<i32>,
    mapping_type: Option<&str>,
) -> Result<Expansion> {
    let expansion_type: ExpansionType = expansion_type.parse().map_err(Error::Serialization)?;
    match (expansion_type, isa_level, mapping_type) {
        (ExpansionType::IsaClosure, Some(level), _) => Ok(Expansion::IsaClosure { level }),
        (ExpansionType::Mapping, _, Some(mapping_type)) => Ok(Expansion::Mapping {
            mapping_type: mapping_type
                .parse::<MappingType>()
                .map_err(Error::Serialization)?,
        }),
        (expansion_type, _, _) => Err(Error::Serialization(format!(
            "{} expansion without its value",
            expansion_type
        ))),
    }
}

pub(crate) fn parse_expanded_row(row: PgRow) -> Result<ExpandedAnnotation> {
    let expansion_type: String = row.get("expansion_type");
    let isa_level: Option<i32> = row.get("isa_level");
    let mapping_type: Option<String> = row.get("mapping_type");
    let status: String = row.get("status");
    Ok(ExpandedAnnotation {
        id: row.get("id"),
        element_id: row.get("element_id"),
        concept: row.get("concept"),
        context: row.get("context"),
        origin_concept: row.get("origin_concept"),
        expansion: parse_expansion(&expansion_type, isa_level, mapping_type.as_deref())?,
        status: status.parse::<ExpandedStatus>().map_err(Error::Serialization)?,
    })
}

/// Move `ids` from `from` to `to`, failing if any of them is no longer in `from`.
async fn advance_direct(
    tx: &mut Transaction<'_, Postgres>,
    resource_id: &str,
    ids: &[i64],
    from: DirectStatus,
    to: DirectStatus,
) -> Result<()> {
    if ids.is_empty() {
        return Ok(());
    }
    let result = sqlx::query(
        "UPDATE obr_direct_annotation SET status = $3::obr_direct_status
         WHERE resource_id = $1 AND id = ANY($2) AND status = $4::obr_direct_status",
    )
    .bind(resource_id)
    .bind(ids)
    .bind(to.as_str())
    .bind(from.as_str())
    .execute(&mut **tx)
    .await
    .map_err(Error::Database)?;

    if result.rows_affected() != ids.len() as u64 {
        return Err(Error::Internal(format!(
            "{} of {} rows left {} before commit",
            ids.len() as u64 - result.rows_affected().min(ids.len() as u64),
            ids.len(),
            from
        )));
    }
    Ok(())
}

async fn insert_expanded(
    tx: &mut Transaction<'_, Postgres>,
    resource_id: &str,
    rows: &[NewExpandedAnnotation],
) -> Result<u64> {
    if rows.is_empty() {
        return Ok(0);
    }

    let mut element_ids = Vec::with_capacity(rows.len());
    let mut concepts = Vec::with_capacity(rows.len());
    let mut contexts = Vec::with_capacity(rows.len());
    let mut origins = Vec::with_capacity(rows.len());
    let mut types = Vec::with_capacity(rows.len());
    let mut levels: Vec<Option<i32>> = Vec::with_capacity(rows.len());
    let mut mapping_types: Vec<Option<String>> = Vec::with_capacity(rows.len());
    for row in rows {
        element_ids.push(row.element_id);
        concepts.push(row.concept.as_str());
        contexts.push(row.context.as_str());
        origins.push(row.origin_concept.as_str());
        types.push(row.expansion.expansion_type().as_str());
        levels.push(row.expansion.level());
        mapping_types.push(row.expansion.mapping_type().map(|m| m.as_str().to_string()));
    }

    let result = sqlx::query(
        "INSERT INTO obr_expanded_annotation
             (resource_id, element_id, concept, context, origin_concept,
              expansion_type, isa_level, mapping_type)
         SELECT $1, u.element_id, u.concept, u.context, u.origin_concept,
                u.expansion_type::obr_expansion_type, u.isa_level,
                u.mapping_type::obr_mapping_type
         FROM UNNEST($2::bigint[], $3::text[], $4::text[], $5::text[],
                     $6::text[], $7::int[], $8::text[])
              AS u(element_id, concept, context, origin_concept,
                   expansion_type, isa_level, mapping_type)",
    )
    .bind(resource_id)
    .bind(&element_ids)
    .bind(&concepts)
    .bind(&contexts)
    .bind(&origins)
    .bind(&types)
    .bind(&levels)
    .bind(&mapping_types)
    .execute(&mut **tx)
    .await
    .map_err(Error::Database)?;

    Ok(result.rows_affected())
}

#[async_trait]
impl AnnotationStore for PgAnnotationStore {
    async fn contexts(&self, resource_id: &str) -> Result<Vec<Context>> {
        let rows = sqlx::query(
            "SELECT resource_id, name, weight, kind::text AS kind, ontology_id
             FROM obr_context WHERE resource_id = $1 ORDER BY name",
        )
        .bind(resource_id)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        rows.into_iter().map(parse_context_row).collect()
    }

    async fn direct_batch(
        &self,
        resource_id: &str,
        status: DirectStatus,
        limit: i64,
    ) -> Result<Vec<DirectAnnotation>> {
        let rows = sqlx::query(
            "SELECT id, element_id, concept, context, term_kind::text AS term_kind,
                    term_id, status::text AS status
             FROM obr_direct_annotation
             WHERE resource_id = $1 AND status = $2::obr_direct_status
             ORDER BY id
             LIMIT $3",
        )
        .bind(resource_id)
        .bind(status.as_str())
        .bind(limit.max(0))
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        rows.into_iter().map(parse_direct_row).collect()
    }

    async fn pending_expanded_batch(
        &self,
        resource_id: &str,
        expansion_type: ExpansionType,
        limit: i64,
    ) -> Result<Vec<ExpandedAnnotation>> {
        let rows = sqlx::query(
            "SELECT id, element_id, concept, context, origin_concept,
                    expansion_type::text AS expansion_type, isa_level,
                    mapping_type::text AS mapping_type, status::text AS status
             FROM obr_expanded_annotation
             WHERE resource_id = $1
               AND expansion_type = $2::obr_expansion_type
               AND status = 'pending_index'::obr_expanded_status
             ORDER BY id
             LIMIT $3",
        )
        .bind(resource_id)
        .bind(expansion_type.as_str())
        .bind(limit.max(0))
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        rows.into_iter().map(parse_expanded_row).collect()
    }

    async fn commit_expansion(&self, commit: &ExpansionCommit) -> Result<u64> {
        let start = Instant::now();
        let mut tx = self.pool.begin().await.map_err(Error::Database)?;

        advance_direct(
            &mut tx,
            &commit.resource_id,
            &commit.consumed,
            commit.stage.input(),
            commit.stage.output(),
        )
        .await?;
        let inserted = insert_expanded(&mut tx, &commit.resource_id, &commit.emitted).await?;

        tx.commit().await.map_err(Error::Database)?;

        debug!(
            subsystem = "database",
            component = "annotation_store",
            op = "commit_expansion",
            resource_id = %commit.resource_id,
            stage = %commit.stage,
            consumed = commit.consumed.len(),
            row_count = inserted,
            duration_ms = start.elapsed().as_millis() as u64,
            "Committed expansion batch"
        );
        Ok(inserted)
    }

    async fn commit_aggregation(&self, commit: &AggregationCommit) -> Result<u64> {
        let start = Instant::now();
        let mut tx = self.pool.begin().await.map_err(Error::Database)?;

        advance_direct(
            &mut tx,
            &commit.resource_id,
            &commit.direct_ids,
            DirectStatus::MappingDone,
            DirectStatus::IndexingDone,
        )
        .await?;

        if !commit.expanded_ids.is_empty() {
            let result = sqlx::query(
                "UPDATE obr_expanded_annotation SET status = 'indexed'::obr_expanded_status
                 WHERE resource_id = $1 AND id = ANY($2)
                   AND status = 'pending_index'::obr_expanded_status",
            )
            .bind(&commit.resource_id)
            .bind(&commit.expanded_ids)
            .execute(&mut *tx)
            .await
            .map_err(Error::Database)?;

            if result.rows_affected() != commit.expanded_ids.len() as u64 {
                return Err(Error::Internal(
                    "aggregation input rows changed state before commit".into(),
                ));
            }
        }

        let mut touched = 0;
        if !commit.contributions.is_empty() {
            let element_ids: Vec<i64> = commit.contributions.iter().map(|c| c.element_id).collect();
            let concepts: Vec<&str> = commit
                .contributions
                .iter()
                .map(|c| c.concept.as_str())
                .collect();
            let scores: Vec<f64> = commit.contributions.iter().map(|c| c.score).collect();

            // Keys must be unique within one statement for ON CONFLICT DO UPDATE.
            let result = sqlx::query(
                "INSERT INTO obr_aggregated_score (element_id, resource_id, concept, score)
                 SELECT u.element_id, $1, u.concept, u.score
                 FROM UNNEST($2::bigint[], $3::text[], $4::float8[]) AS u(element_id, concept, score)
                 ON CONFLICT (element_id, concept)
                 DO UPDATE SET score = obr_aggregated_score.score + EXCLUDED.score",
            )
            .bind(&commit.resource_id)
            .bind(&element_ids)
            .bind(&concepts)
            .bind(&scores)
            .execute(&mut *tx)
            .await
            .map_err(Error::Database)?;
            touched = result.rows_affected();
        }

        tx.commit().await.map_err(Error::Database)?;

        debug!(
            subsystem = "database",
            component = "annotation_store",
            op = "commit_aggregation",
            resource_id = %commit.resource_id,
            consumed = commit.direct_ids.len() + commit.expanded_ids.len(),
            row_count = touched,
            duration_ms = start.elapsed().as_millis() as u64,
            "Committed aggregation batch"
        );
        Ok(touched)
    }

    async fn aggregated_count(&self, resource_id: &str) -> Result<i64> {
        sqlx::query_scalar("SELECT COUNT(*) FROM obr_aggregated_score WHERE resource_id = $1")
            .bind(resource_id)
            .fetch_one(&self.pool)
            .await
            .map_err(Error::Database)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_expansion_isa() {
        assert_eq!(
            parse_expansion("isa_closure", Some(2), None).unwrap(),
            Expansion::IsaClosure { level: 2 }
        );
    }

    #[test]
    fn test_parse_expansion_mapping() {
        assert_eq!(
            parse_expansion("mapping", None, Some("same_identity")).unwrap(),
            Expansion::Mapping {
                mapping_type: MappingType::SameIdentity
            }
        );
    }

    #[test]
    fn test_parse_expansion_missing_value() {
        assert!(matches!(
            parse_expansion("isa_closure", None, None),
            Err(Error::Serialization(_))
        ));
        assert!(matches!(
            parse_expansion("mapping", Some(1), None),
            Err(Error::Serialization(_))
        ));
        assert!(parse_expansion("sideways", Some(1), None).is_err());
    }
}
