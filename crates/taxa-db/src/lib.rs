//! # taxa-db
//!
//! PostgreSQL + PostGIS database layer for taxa.
//!
//! This crate provides:
//! - Connection pool management
//! - Repository implementations for taxa, sites, occurrences and jobs
//! - Transactional units of work for merges and occurrence upserts
//! - Proximity lookups with PostGIS `ST_DWithin`
//!
//! ## Example
//!
//! ```rust,ignore
//! use taxa_db::Database;
//! use taxa_core::{Rank, TaxonRepository};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let db = Database::connect("postgres://localhost/taxa").await?;
//!     let tigers = db.taxa.find_merge_candidates("Panthera tigris", Rank::Species).await?;
//!     println!("{} candidates", tigers.len());
//!     Ok(())
//! }
//! ```
pub mod jobs;
pub mod occurrences;
pub mod pool;
pub mod sites;
pub mod taxa;

// Always compiled so integration tests (in tests/) can use the fixtures.
pub mod test_fixtures;

pub use taxa_core::{Error, Result};

pub use jobs::PgJobRepository;
pub use occurrences::{PgOccurrenceRepository, PgOccurrenceUnitOfWork};
pub use pool::{create_pool, create_pool_with_config, PoolConfig};
pub use sites::PgSiteRepository;
pub use taxa::{PgTaxonRepository, PgTaxonUnitOfWork};

/// Escape LIKE/ILIKE wildcard characters (`%`, `_`, `\`) in user input.
pub fn escape_like(input: &str) -> String {
    input
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_")
}

/// Combined database context with all repositories.
#[derive(Clone)]
pub struct Database {
    /// The underlying connection pool.
    pub pool: sqlx::Pool<sqlx::Postgres>,
    /// Taxon repository.
    pub taxa: PgTaxonRepository,
    /// Site repository for spatial dedup.
    pub sites: PgSiteRepository,
    /// Occurrence repository.
    pub occurrences: PgOccurrenceRepository,
    /// Job repository for background processing.
    pub jobs: PgJobRepository,
}

impl Database {
    /// Create a new Database instance from a connection pool.
    pub fn new(pool: sqlx::Pool<sqlx::Postgres>) -> Self {
        Self {
            taxa: PgTaxonRepository::new(pool.clone()),
            sites: PgSiteRepository::new(pool.clone()),
            occurrences: PgOccurrenceRepository::new(pool.clone()),
            jobs: PgJobRepository::new(pool.clone()),
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
