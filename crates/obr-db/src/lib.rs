//! # obr-db
//!
//! PostgreSQL backend for the annotation workflow.
//!
//! This crate provides:
//! - Connection pool management
//! - The transactional annotation store the pipeline stages commit through
//! - Resource, context, and element registration
//! - Direct annotation intake
//! - Read access to the precomputed ontology relations
//! - Score queries and ontology statistics over the aggregated index
//! - Ontology and resource deletion
//!
//! ## Example
//!
//! ```rust,ignore
//! use obr_db::{Database, ScoreRepository};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let db = Database::connect("postgres://localhost/obr").await?;
//!     for hit in db.scores.scores_for_element("GEO", "GSE1").await? {
//!         println!("{} {}", hit.concept, hit.score);
//!     }
//!     Ok(())
//! }
//! ```
pub mod annotation_store;
pub mod direct_annotations;
pub mod maintenance;
pub mod pool;
pub mod relations;
pub mod resources;
pub mod scores;

// Test fixtures for integration tests
// Note: Always compiled so integration tests (in tests/) can use DEFAULT_TEST_DATABASE_URL
pub mod test_fixtures;

// Re-export core types
pub use obr_core::*;

pub use annotation_store::PgAnnotationStore;
pub use direct_annotations::PgDirectAnnotationRepository;
pub use maintenance::PgMaintenanceRepository;
pub use pool::{create_pool, create_pool_with_config, log_pool_metrics, PoolConfig};
pub use relations::PgOntologyRelations;
pub use resources::PgResourceRepository;
pub use scores::PgScoreRepository;

/// Combined database context with all repositories.
pub struct Database {
    /// The underlying connection pool.
    pub pool: sqlx::Pool<sqlx::Postgres>,
    pub resources: PgResourceRepository,
    pub direct_annotations: PgDirectAnnotationRepository,
    /// Batch reads and atomic commits used by the pipeline stages.
    pub store: PgAnnotationStore,
    pub relations: PgOntologyRelations,
    pub scores: PgScoreRepository,
    pub maintenance: PgMaintenanceRepository,
}

impl Database {
    /// Create a new Database instance from a connection pool.
    pub fn new(pool: sqlx::Pool<sqlx::Postgres>) -> Self {
        Self {
            resources: PgResourceRepository::new(pool.clone()),
            direct_annotations: PgDirectAnnotationRepository::new(pool.clone()),
            store: PgAnnotationStore::new(pool.clone()),
            relations: PgOntologyRelations::new(pool.clone()),
            scores: PgScoreRepository::new(pool.clone()),
            maintenance: PgMaintenanceRepository::new(pool.clone()),
            pool,
        }
    }

    /// Create a new Database instance by connecting to the given URL.
    pub async fn connect(url: &str) -> Result<Self> {
        let pool = create_pool(url).await?;
        Ok(Self::new(pool))
    }

    /// Create with custom pool configuration.
    pub async fn connect_with_config(url: &str, config: PoolConfig) -> Result<Self> {
        let pool = create_pool_with_config(url, config).await?;
        Ok(Self::new(pool))
    }

    /// Run pending migrations.
    #[cfg(feature = "migrations")]
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .map_err(|e| Error::Database(sqlx::Error::Migrate(Box::new(e))))?;
        Ok(())
    }

    /// Get the underlying connection pool.
    pub fn pool(&self) -> &sqlx::Pool<sqlx::Postgres> {
        &self.pool
    }
}

impl Clone for Database {
    fn clone(&self) -> Self {
        Self::new(self.pool.clone())
    }
}
