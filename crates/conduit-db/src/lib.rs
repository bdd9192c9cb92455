//! # conduit-db
//!
//! PostgreSQL persistence layer for conduit.
//!
//! This crate provides:
//! - Connection pool setup and occupancy stats
//! - [`PgJobStore`], the durable [`JobStore`] implementation
//! - Schema migrations (behind the `migrations` feature)
//!
//! ## Example
//!
//! ```rust,ignore
//! use conduit_db::{Database, JobStore};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let db = Database::connect("postgres://localhost/conduit").await?;
//!     db.migrate().await?;
//!     let recoverable = db.jobs.load_recoverable().await?;
//!     println!("{} jobs to restore", recoverable.len());
//!     Ok(())
//! }
//! ```

pub mod jobs;
pub mod pool;

// Note: Always compiled so integration tests (in tests/) can use DEFAULT_TEST_DATABASE_URL
pub mod test_fixtures;

// Re-export core types
pub use conduit_core::*;

pub use jobs::PgJobStore;
pub use pool::{PoolConfig, PoolStats};

/// Combined database context.
#[derive(Clone)]
pub struct Database {
    /// The underlying connection pool.
    pub pool: sqlx::Pool<sqlx::Postgres>,
    /// Job, result, dead-letter and quota persistence.
    pub jobs: PgJobStore,
}

impl Database {
    /// Create a new Database instance from a connection pool.
    pub fn new(pool: sqlx::Pool<sqlx::Postgres>) -> Self {
        Self {
            jobs: PgJobStore::new(pool.clone()),
            pool,
        }
    }

    /// Create a new Database instance by connecting to the given URL.
    pub async fn connect(url: &str) -> Result<Self> {
        let pool = pool::connect(url, &PoolConfig::default()).await?;
        Ok(Self::new(pool))
    }

    /// Connect using `DATABASE_URL` and the `DB_*` pool settings.
    pub async fn from_env() -> Result<Self> {
        let database_url = std::env::var("DATABASE_URL")
            .map_err(|_| Error::Config("DATABASE_URL is not set".to_string()))?;
        let pool = pool::connect(&database_url, &PoolConfig::from_env()).await?;
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

    pub fn pool_stats(&self) -> PoolStats {
        PoolStats::of(&self.pool)
    }
}
