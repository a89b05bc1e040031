//! Intake of direct annotations and per-status bookkeeping.

use async_trait::async_trait;
use sqlx::{Pool, Postgres, Row};
use tracing::debug;

use obr_core::{
    DirectAnnotationRepository, DirectStatus, Error, ExpandedStatus, NewDirectAnnotation, Result,
    StatusCounts,
};

/// PostgreSQL implementation of DirectAnnotationRepository.
pub struct PgDirectAnnotationRepository {
    pool: Pool<Postgres>,
}

impl PgDirectAnnotationRepository {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DirectAnnotationRepository for PgDirectAnnotationRepository {
    async fn add_direct_annotations(
        &self,
        resource_id: &str,
        annotations: &[NewDirectAnnotation],
    ) -> Result<u64> {
        if annotations.is_empty() {
            return Ok(0);
        }

        let locals: Vec<&str> = annotations
            .iter()
            .map(|a| a.local_element_id.as_str())
            .collect();
        let concepts: Vec<&str> = annotations.iter().map(|a| a.concept.as_str()).collect();
        let contexts: Vec<&str> = annotations.iter().map(|a| a.context.as_str()).collect();
        let kinds: Vec<&str> = annotations.iter().map(|a| a.term_kind.as_str()).collect();
        let term_ids: Vec<Option<&str>> =
            annotations.iter().map(|a| a.term_id.as_deref()).collect();

        // The joins drop rows naming an unknown element or context.
        let result = sqlx::query(
            "INSERT INTO obr_direct_annotation
                 (resource_id, element_id, concept, context, term_kind, term_id)
             SELECT $1, e.id, u.concept, u.context, u.term_kind::obr_term_kind, u.term_id
             FROM UNNEST($2::text[], $3::text[], $4::text[], $5::text[], $6::text[])
                  AS u(local_element_id, concept, context, term_kind, term_id)
             JOIN obr_element e
               ON e.resource_id = $1 AND e.local_element_id = u.local_element_id
             JOIN obr_context c
               ON c.resource_id = $1 AND c.name = u.context
             ON CONFLICT DO NOTHING",
        )
        .bind(resource_id)
        .bind(&locals)
        .bind(&concepts)
        .bind(&contexts)
        .bind(&kinds)
        .bind(&term_ids)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;

        debug!(
            subsystem = "database",
            component = "direct_annotations",
            op = "add",
            resource_id,
            row_count = result.rows_affected(),
            skipped = (annotations.len() as u64).saturating_sub(result.rows_affected()),
            "Added direct annotations"
        );
        Ok(result.rows_affected())
    }

    async fn status_counts(&self, resource_id: &str) -> Result<StatusCounts> {
        let direct_rows = sqlx::query(
            "SELECT status::text AS status, COUNT(*) AS n
             FROM obr_direct_annotation WHERE resource_id = $1
             GROUP BY status ORDER BY status",
        )
        .bind(resource_id)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        let expanded_rows = sqlx::query(
            "SELECT status::text AS status, COUNT(*) AS n
             FROM obr_expanded_annotation WHERE resource_id = $1
             GROUP BY status ORDER BY status",
        )
        .bind(resource_id)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        let mut direct = Vec::with_capacity(direct_rows.len());
        for row in direct_rows {
            let status: String = row.get("status");
            let status: DirectStatus = status.parse().map_err(Error::Serialization)?;
            direct.push((status, row.get::<i64, _>("n")));
        }

        let mut expanded = Vec::with_capacity(expanded_rows.len());
        for row in expanded_rows {
            let status: String = row.get("status");
            let status: ExpandedStatus = status.parse().map_err(Error::Serialization)?;
            expanded.push((status, row.get::<i64, _>("n")));
        }

        Ok(StatusCounts { direct, expanded })
    }
}
