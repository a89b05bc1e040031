//! Read access to the aggregated index.

use async_trait::async_trait;
use sqlx::{Pool, Postgres, Row};

use obr_core::{
    ConceptElementScore, ConceptRef, ElementConceptScore, Error, OntologyStatistics, Result,
    ScoreRepository,
};

/// PostgreSQL implementation of ScoreRepository.
pub struct PgScoreRepository {
    pool: Pool<Postgres>,
}

impl PgScoreRepository {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ScoreRepository for PgScoreRepository {
    async fn scores_for_element(
        &self,
        resource_id: &str,
        local_element_id: &str,
    ) -> Result<Vec<ElementConceptScore>> {
        let rows = sqlx::query(
            "SELECT s.concept, s.score
             FROM obr_aggregated_score s
             JOIN obr_element e ON e.id = s.element_id
             WHERE e.resource_id = $1 AND e.local_element_id = $2
             ORDER BY s.score DESC, s.concept",
        )
        .bind(resource_id)
        .bind(local_element_id)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(rows
            .into_iter()
            .map(|row| ElementConceptScore {
                concept: row.get("concept"),
                score: row.get("score"),
            })
            .collect())
    }

    async fn scores_for_concept(
        &self,
        concept: &ConceptRef,
        limit: i64,
    ) -> Result<Vec<ConceptElementScore>> {
        let rows = sqlx::query(
            "SELECT e.resource_id, e.local_element_id, s.score
             FROM obr_aggregated_score s
             JOIN obr_element e ON e.id = s.element_id
             WHERE s.concept = $1
             ORDER BY s.score DESC, e.resource_id, e.local_element_id
             LIMIT $2",
        )
        .bind(concept.to_string())
        .bind(limit.max(0))
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(rows
            .into_iter()
            .map(|row| ConceptElementScore {
                resource_id: row.get("resource_id"),
                local_element_id: row.get("local_element_id"),
                score: row.get("score"),
            })
            .collect())
    }

    async fn ontology_statistics(&self, resource_id: &str) -> Result<Vec<OntologyStatistics>> {
        let rows = sqlx::query(
            "WITH d AS (
                 SELECT split_part(concept, '/', 1) AS ontology_id, COUNT(*) AS n
                 FROM obr_direct_annotation WHERE resource_id = $1 GROUP BY 1
             ), x AS (
                 SELECT split_part(concept, '/', 1) AS ontology_id,
                        COUNT(*) FILTER (WHERE expansion_type = 'isa_closure') AS isa,
                        COUNT(*) FILTER (WHERE expansion_type = 'mapping') AS mapping
                 FROM obr_expanded_annotation WHERE resource_id = $1 GROUP BY 1
             ), s AS (
                 SELECT split_part(concept, '/', 1) AS ontology_id, COUNT(*) AS n
                 FROM obr_aggregated_score WHERE resource_id = $1 GROUP BY 1
             )
             SELECT ontology_id,
                    COALESCE(d.n, 0) AS direct_annotations,
                    COALESCE(x.isa, 0) AS isa_annotations,
                    COALESCE(x.mapping, 0) AS mapping_annotations,
                    COALESCE(s.n, 0) AS aggregated_scores
             FROM (SELECT ontology_id FROM d
                   UNION SELECT ontology_id FROM x
                   UNION SELECT ontology_id FROM s) o
             LEFT JOIN d USING (ontology_id)
             LEFT JOIN x USING (ontology_id)
             LEFT JOIN s USING (ontology_id)
             ORDER BY ontology_id",
        )
        .bind(resource_id)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(rows
            .into_iter()
            .map(|row| OntologyStatistics {
                ontology_id: row.get("ontology_id"),
                direct_annotations: row.get("direct_annotations"),
                isa_annotations: row.get("isa_annotations"),
                mapping_annotations: row.get("mapping_annotations"),
                aggregated_scores: row.get("aggregated_scores"),
            })
            .collect())
    }
}
