//! Precomputed ontology relations.
//!
//! `obr_relation_is_a` holds the transitive is-a closure with minimal
//! distances and `obr_relation_mapping` the cross-ontology mappings. Both are
//! maintained by the ontology access layer; the workflow only reads them.

use async_trait::async_trait;
use sqlx::{Pool, Postgres, Row};
use tracing::{info, warn};

use obr_core::{ConceptRef, Error, MappingEdge, MappingType, OntologyRelations, ParentEdge, Result};

/// PostgreSQL implementation of OntologyRelations.
pub struct PgOntologyRelations {
    pool: Pool<Postgres>,
}

impl PgOntologyRelations {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    /// Upsert is-a closure edges. A re-loaded edge keeps the smaller level.
    pub async fn load_parents(&self, edges: &[ParentEdge]) -> Result<u64> {
        if edges.is_empty() {
            return Ok(0);
        }
        let concepts: Vec<String> = edges.iter().map(|e| e.concept.to_string()).collect();
        let ancestors: Vec<String> = edges.iter().map(|e| e.ancestor.to_string()).collect();
        let levels: Vec<i32> = edges.iter().map(|e| e.level).collect();

        let result = sqlx::query(
            "INSERT INTO obr_relation_is_a (concept, ancestor, level)
             SELECT DISTINCT ON (u.concept, u.ancestor) u.concept, u.ancestor, u.level
             FROM UNNEST($1::text[], $2::text[], $3::int[]) AS u(concept, ancestor, level)
             ORDER BY u.concept, u.ancestor, u.level
             ON CONFLICT (concept, ancestor)
             DO UPDATE SET level = LEAST(obr_relation_is_a.level, EXCLUDED.level)",
        )
        .bind(&concepts)
        .bind(&ancestors)
        .bind(&levels)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;

        info!(
            subsystem = "database",
            component = "relations",
            op = "load_parents",
            row_count = result.rows_affected(),
            "Loaded is-a closure edges"
        );
        Ok(result.rows_affected())
    }

    /// Insert mapping edges; already-known edges are ignored.
    pub async fn load_mappings(&self, edges: &[MappingEdge]) -> Result<u64> {
        if edges.is_empty() {
            return Ok(0);
        }
        let concepts: Vec<String> = edges.iter().map(|e| e.concept.to_string()).collect();
        let targets: Vec<String> = edges.iter().map(|e| e.target.to_string()).collect();
        let types: Vec<&str> = edges.iter().map(|e| e.mapping_type.as_str()).collect();

        let result = sqlx::query(
            "INSERT INTO obr_relation_mapping (concept, target, mapping_type)
             SELECT u.concept, u.target, u.mapping_type::obr_mapping_type
             FROM UNNEST($1::text[], $2::text[], $3::text[]) AS u(concept, target, mapping_type)
             ON CONFLICT DO NOTHING",
        )
        .bind(&concepts)
        .bind(&targets)
        .bind(&types)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;

        info!(
            subsystem = "database",
            component = "relations",
            op = "load_mappings",
            row_count = result.rows_affected(),
            "Loaded mapping edges"
        );
        Ok(result.rows_affected())
    }
}

/// Parse both ends of a stored edge; malformed edges are logged and dropped.
fn parse_pair(table: &str, from: &str, to: &str) -> Option<(ConceptRef, ConceptRef)> {
    match (from.parse::<ConceptRef>(), to.parse::<ConceptRef>()) {
        (Ok(from), Ok(to)) => Some((from, to)),
        (Err(e), _) | (_, Err(e)) => {
            warn!(
                subsystem = "database",
                component = "relations",
                db_table = table,
                error = %e,
                "Skipping malformed relation edge"
            );
            None
        }
    }
}

#[async_trait]
impl OntologyRelations for PgOntologyRelations {
    async fn parents_of(&self, concepts: &[ConceptRef]) -> Result<Vec<ParentEdge>> {
        if concepts.is_empty() {
            return Ok(Vec::new());
        }
        let keys: Vec<String> = concepts.iter().map(ToString::to_string).collect();

        let rows = sqlx::query(
            "SELECT concept, ancestor, level FROM obr_relation_is_a
             WHERE concept = ANY($1)
             ORDER BY concept, level, ancestor",
        )
        .bind(&keys)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(rows
            .into_iter()
            .filter_map(|row| {
                let concept: String = row.get("concept");
                let ancestor: String = row.get("ancestor");
                parse_pair("obr_relation_is_a", &concept, &ancestor).map(|(concept, ancestor)| {
                    ParentEdge {
                        concept,
                        ancestor,
                        level: row.get("level"),
                    }
                })
            })
            .collect())
    }

    async fn mappings_of(&self, concepts: &[ConceptRef]) -> Result<Vec<MappingEdge>> {
        if concepts.is_empty() {
            return Ok(Vec::new());
        }
        let keys: Vec<String> = concepts.iter().map(ToString::to_string).collect();

        let rows = sqlx::query(
            "SELECT concept, target, mapping_type::text AS mapping_type FROM obr_relation_mapping
             WHERE concept = ANY($1)
             ORDER BY concept, target, mapping_type",
        )
        .bind(&keys)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        let mut edges = Vec::with_capacity(rows.len());
        for row in rows {
            let concept: String = row.get("concept");
            let target: String = row.get("target");
            let mapping_type: String = row.get("mapping_type");
            let Some((concept, target)) = parse_pair("obr_relation_mapping", &concept, &target)
            else {
                continue;
            };
            edges.push(MappingEdge {
                concept,
                target,
                mapping_type: mapping_type
                    .parse::<MappingType>()
                    .map_err(Error::Serialization)?,
            });
        }
        Ok(edges)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_pair() {
        let (from, to) = parse_pair("t", "GO/1", "GO/2").unwrap();
        assert_eq!(from, ConceptRef::new("GO", "1"));
        assert_eq!(to, ConceptRef::new("GO", "2"));
        assert!(parse_pair("t", "GO1", "GO/2").is_none());
        assert!(parse_pair("t", "GO/1", "/2").is_none());
    }
}
