//! Administrative deletion of ontologies and resources.

use std::time::Instant;

use async_trait::async_trait;
use sqlx::{Pool, Postgres, Transaction};
use tracing::{debug, info};

use obr_core::{Error, MaintenanceRepository, Result};

/// PostgreSQL implementation of MaintenanceRepository.
pub struct PgMaintenanceRepository {
    pool: Pool<Postgres>,
}

impl PgMaintenanceRepository {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }
}

async fn delete_where(
    tx: &mut Transaction<'_, Postgres>,
    table: &'static str,
    sql: &str,
    bind: &[String],
) -> Result<u64> {
    let result = sqlx::query(sql)
        .bind(bind)
        .execute(&mut **tx)
        .await
        .map_err(Error::Database)?;
    debug!(
        subsystem = "database",
        component = "maintenance",
        db_table = table,
        row_count = result.rows_affected(),
        "Deleted rows"
    );
    Ok(result.rows_affected())
}

#[async_trait]
impl MaintenanceRepository for PgMaintenanceRepository {
    async fn delete_ontologies(&self, ontology_ids: &[String]) -> Result<bool> {
        if ontology_ids.is_empty() {
            return Ok(true);
        }
        let start = Instant::now();
        let mut tx = self.pool.begin().await.map_err(Error::Database)?;

        let direct = delete_where(
            &mut tx,
            "obr_direct_annotation",
            "DELETE FROM obr_direct_annotation WHERE split_part(concept, '/', 1) = ANY($1)",
            ontology_ids,
        )
        .await?;
        // Rows expanded from a deleted concept go too, whatever ontology they point at.
        let expanded = delete_where(
            &mut tx,
            "obr_expanded_annotation",
            "DELETE FROM obr_expanded_annotation
             WHERE split_part(concept, '/', 1) = ANY($1)
                OR split_part(origin_concept, '/', 1) = ANY($1)",
            ontology_ids,
        )
        .await?;
        let scores = delete_where(
            &mut tx,
            "obr_aggregated_score",
            "DELETE FROM obr_aggregated_score WHERE split_part(concept, '/', 1) = ANY($1)",
            ontology_ids,
        )
        .await?;

        tx.commit().await.map_err(Error::Database)?;

        info!(
            subsystem = "database",
            component = "maintenance",
            op = "delete_ontologies",
            ontology_id = ?ontology_ids,
            row_count = direct + expanded + scores,
            duration_ms = start.elapsed().as_millis() as u64,
            "Deleted ontology annotations"
        );
        Ok(true)
    }

    async fn delete_resource(&self, resource_id: &str) -> Result<bool> {
        let start = Instant::now();
        let mut tx = self.pool.begin().await.map_err(Error::Database)?;
        let id = [resource_id.to_string()];

        let mut deleted = 0;
        for (table, sql) in [
            (
                "obr_aggregated_score",
                "DELETE FROM obr_aggregated_score WHERE resource_id = ANY($1)",
            ),
            (
                "obr_expanded_annotation",
                "DELETE FROM obr_expanded_annotation WHERE resource_id = ANY($1)",
            ),
            (
                "obr_direct_annotation",
                "DELETE FROM obr_direct_annotation WHERE resource_id = ANY($1)",
            ),
            (
                "obr_element",
                "DELETE FROM obr_element WHERE resource_id = ANY($1)",
            ),
            (
                "obr_context",
                "DELETE FROM obr_context WHERE resource_id = ANY($1)",
            ),
            (
                "obr_resource",
                "DELETE FROM obr_resource WHERE resource_id = ANY($1)",
            ),
        ] {
            deleted += delete_where(&mut tx, table, sql, &id).await?;
        }

        tx.commit().await.map_err(Error::Database)?;

        info!(
            subsystem = "database",
            component = "maintenance",
            op = "delete_resource",
            resource_id,
            row_count = deleted,
            duration_ms = start.elapsed().as_millis() as u64,
            "Deleted resource"
        );
        Ok(true)
    }
}
