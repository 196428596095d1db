//! Job store for the sitedeploy orchestrator.
//!
//! Provides the [`JobRepo`] trait with a PostgreSQL implementation and an
//! in-memory one for tests and local development. All state transitions are
//! conditional writes keyed on the expected prior status.

pub mod error;
pub mod memory;
pub mod repo;

pub use error::{DbError, DbResult};
pub use memory::MemoryJobRepo;
pub use repo::{Inserted, JobFilter, JobPage, JobRepo, PgJobRepo, StatusCounts};

use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

/// Create a new database connection pool.
pub async fn create_pool(database_url: &str, max_connections: u32) -> DbResult<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(database_url)
        .await?;
    Ok(pool)
}

/// Run database migrations.
pub async fn run_migrations(pool: &PgPool) -> DbResult<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}
