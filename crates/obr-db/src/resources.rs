//! Resource, context, and element registration.

use async_trait::async_trait;
use sqlx::{postgres::PgRow, Pool, Postgres, Row};
use tracing::{debug, info};

use obr_core::{Context, ContextKind, Error, Resource, ResourceRepository, Result};

/// PostgreSQL implementation of ResourceRepository.
pub struct PgResourceRepository {
    pool: Pool<Postgres>,
}

impl PgResourceRepository {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    fn parse_resource_row(row: PgRow) -> Resource {
        Resource {
            resource_id: row.get("resource_id"),
            name: row.get("name"),
            description: row.get("description"),
            main_context: row.get("main_context"),
            last_dictionary_version: row.get("last_dictionary_version"),
        }
    }

    async fn ensure_exists(&self, resource_id: &str) -> Result<()> {
        let exists: bool =
            sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM obr_resource WHERE resource_id = $1)")
                .bind(resource_id)
                .fetch_one(&self.pool)
                .await
                .map_err(Error::Database)?;
        if exists {
            Ok(())
        } else {
            Err(Error::NotFound(format!("resource {}", resource_id)))
        }
    }
}

/// Parse an `obr_context` row.
pub(crate) fn parse_context_row(row: PgRow) -> Result<Context> {
    let kind: String = row.get("kind");
    let ontology_id: Option<String> = row.get("ontology_id");
    Ok(Context {
        name: row.get("name"),
        resource_id: row.get("resource_id"),
        weight: row.get("weight"),
        kind: ContextKind::from_parts(&kind, ontology_id).map_err(Error::Serialization)?,
    })
}

#[async_trait]
impl ResourceRepository for PgResourceRepository {
    async fn register_resource(&self, resource: &Resource, contexts: &[Context]) -> Result<()> {
        for context in contexts {
            if context.resource_id != resource.resource_id {
                return Err(Error::InvalidInput(format!(
                    "context {} belongs to {}, not {}",
                    context.name, context.resource_id, resource.resource_id
                )));
            }
        }

        let mut tx = self.pool.begin().await.map_err(Error::Database)?;

        sqlx::query(
            "INSERT INTO obr_resource (resource_id, name, description, main_context, last_dictionary_version)
             VALUES ($1, $2, $3, $4, $5)
             ON CONFLICT (resource_id) DO UPDATE
             SET name = EXCLUDED.name,
                 description = EXCLUDED.description,
                 main_context = EXCLUDED.main_context,
                 updated_at = now()",
        )
        .bind(&resource.resource_id)
        .bind(&resource.name)
        .bind(&resource.description)
        .bind(&resource.main_context)
        .bind(resource.last_dictionary_version)
        .execute(&mut *tx)
        .await
        .map_err(Error::Database)?;

        for context in contexts {
            sqlx::query(
                "INSERT INTO obr_context (resource_id, name, weight, kind, ontology_id)
                 VALUES ($1, $2, $3, $4::obr_context_kind, $5)
                 ON CONFLICT (resource_id, name) DO UPDATE
                 SET weight = EXCLUDED.weight,
                     kind = EXCLUDED.kind,
                     ontology_id = EXCLUDED.ontology_id",
            )
            .bind(&resource.resource_id)
            .bind(&context.name)
            .bind(context.weight)
            .bind(context.kind.as_str())
            .bind(context.kind.bound_ontology())
            .execute(&mut *tx)
            .await
            .map_err(Error::Database)?;
        }

        tx.commit().await.map_err(Error::Database)?;

        info!(
            subsystem = "database",
            component = "resources",
            op = "register",
            resource_id = %resource.resource_id,
            row_count = contexts.len(),
            "Registered resource"
        );
        Ok(())
    }

    async fn get_resource(&self, resource_id: &str) -> Result<Option<Resource>> {
        let row = sqlx::query(
            "SELECT resource_id, name, description, main_context, last_dictionary_version
             FROM obr_resource WHERE resource_id = $1",
        )
        .bind(resource_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(row.map(Self::parse_resource_row))
    }

    async fn list_resources(&self) -> Result<Vec<Resource>> {
        let rows = sqlx::query(
            "SELECT resource_id, name, description, main_context, last_dictionary_version
             FROM obr_resource ORDER BY resource_id",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(rows.into_iter().map(Self::parse_resource_row).collect())
    }

    async fn add_elements(&self, resource_id: &str, local_element_ids: &[String]) -> Result<u64> {
        self.ensure_exists(resource_id).await?;

        let result = sqlx::query(
            "INSERT INTO obr_element (resource_id, local_element_id)
             SELECT $1, u.local_element_id FROM UNNEST($2::text[]) AS u(local_element_id)
             ON CONFLICT (resource_id, local_element_id) DO NOTHING",
        )
        .bind(resource_id)
        .bind(local_element_ids)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;

        debug!(
            subsystem = "database",
            component = "resources",
            op = "add_elements",
            resource_id,
            row_count = result.rows_affected(),
            skipped = (local_element_ids.len() as u64).saturating_sub(result.rows_affected()),
            "Added elements"
        );
        Ok(result.rows_affected())
    }

    async fn mark_dictionary_version(&self, resource_id: &str, version: i32) -> Result<u64> {
        let mut tx = self.pool.begin().await.map_err(Error::Database)?;

        let resource = sqlx::query(
            "UPDATE obr_resource SET last_dictionary_version = $2, updated_at = now()
             WHERE resource_id = $1",
        )
        .bind(resource_id)
        .bind(version)
        .execute(&mut *tx)
        .await
        .map_err(Error::Database)?;

        if resource.rows_affected() == 0 {
            return Err(Error::NotFound(format!("resource {}", resource_id)));
        }

        let elements =
            sqlx::query("UPDATE obr_element SET dictionary_version = $2 WHERE resource_id = $1")
                .bind(resource_id)
                .bind(version)
                .execute(&mut *tx)
                .await
                .map_err(Error::Database)?;

        tx.commit().await.map_err(Error::Database)?;
        Ok(elements.rows_affected())
    }
}
