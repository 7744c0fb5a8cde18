pub mod runner;

use anyhow::{anyhow, Context, Result};
use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};

pub use runner::DbRunner;

cfg_if::cfg_if! {
    if #[cfg(feature = "pg")] {
        pub use deadpool_diesel::postgres::{Manager, Object, Pool};

        /// The Diesel connection type.
        pub type DbConnection = diesel::pg::PgConnection;
        /// The Diesel backend type.
        pub type DbType = diesel::pg::Pg;

        pub const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations.pg");
    } else if #[cfg(feature = "sqlite")] {
        pub use deadpool_diesel::sqlite::{Manager, Object, Pool};

        /// The Diesel connection type.
        pub type DbConnection = diesel::sqlite::SqliteConnection;
        /// The Diesel backend type.
        pub type DbType = diesel::sqlite::Sqlite;

        pub const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations.sqlite");
    }
}

pub fn build_pool(database_url: &str) -> Result<Pool> {
    let manager = Manager::new(database_url, deadpool_diesel::Runtime::Tokio1);
    Pool::builder(manager)
        .max_size(8)
        .build()
        .context("failed to create database pool")
}

/// Applies any migrations the database has not seen yet. Returns how many ran.
pub async fn run_migrations(pool: &Pool) -> Result<usize> {
    let conn = pool
        .get()
        .await
        .map_err(|e| anyhow!("failed to retrieve database connection: {e}"))?;

    conn.interact(|c| {
        c.run_pending_migrations(MIGRATIONS)
            .map(|applied| applied.len())
            .map_err(|e| anyhow!("failed to run migrations: {e}"))
    })
    .await
    .map_err(|e| anyhow!("migration task failed: {e}"))?
}
