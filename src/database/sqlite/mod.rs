use anyhow::{Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use std::path::Path;
use tracing::{debug, info};

use crate::database::sqlite::models::CacheRow;
use crate::database::sqlite::queries::CacheEntryQueries;

#[cfg(test)]
mod tests;

pub mod models;
pub mod queries;

pub type DbPool = Pool<Sqlite>;

/// SQLite database holding the durable cache tier
#[derive(Debug, Clone)]
pub struct Database {
    pool: DbPool,
}

impl Database {
    pub async fn new<P: AsRef<Path>>(database_path: P) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(database_path)
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(10)
            .connect_with(options)
            .await
            .context("Failed to create database connection pool")?;

        let database = Self { pool };
        database.run_migrations().await?;

        Ok(database)
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    pub async fn run_migrations(&self) -> Result<()> {
        info!("Running database migrations");

        sqlx::migrate!("src/database/sqlite/migrations")
            .run(&self.pool)
            .await
            .context("Failed to run schema migration")?;

        debug!("Database migrations completed successfully");
        Ok(())
    }

    pub async fn initialize_from_config_dir(config_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(config_dir).with_context(|| {
            format!(
                "Failed to create config directory: {}",
                config_dir.display()
            )
        })?;

        Self::new(config_dir.join("cache.db")).await
    }

    // Cache entry operations
    pub async fn get_cache_entry(&self, key: &str) -> Result<Option<CacheRow>> {
        CacheEntryQueries::get(&self.pool, key).await
    }

    pub async fn put_cache_entry(&self, row: &CacheRow) -> Result<()> {
        CacheEntryQueries::upsert(&self.pool, row).await
    }

    pub async fn delete_cache_entry(&self, key: &str) -> Result<bool> {
        CacheEntryQueries::delete(&self.pool, key).await
    }

    pub async fn delete_cache_entry_version(&self, row: &CacheRow) -> Result<bool> {
        CacheEntryQueries::delete_version(&self.pool, row).await
    }

    pub async fn delete_expired_cache_entries(&self, now_ms: i64) -> Result<u64> {
        CacheEntryQueries::delete_expired(&self.pool, now_ms).await
    }

    pub async fn clear_cache_entries(&self) -> Result<u64> {
        CacheEntryQueries::clear(&self.pool).await
    }

    pub async fn count_cache_entries(&self) -> Result<i64> {
        CacheEntryQueries::count(&self.pool).await
    }

    /// Optimize database performance by running VACUUM and ANALYZE
    pub async fn optimize(&self) -> Result<()> {
        info!("Optimizing database performance");

        sqlx::query("VACUUM")
            .execute(&self.pool)
            .await
            .context("Failed to vacuum database")?;

        sqlx::query("ANALYZE")
            .execute(&self.pool)
            .await
            .context("Failed to analyze database")?;

        debug!("Database optimization completed");
        Ok(())
    }
}
