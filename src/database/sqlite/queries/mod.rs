use super::models::CacheRow;
use anyhow::{Context, Result};
use sqlx::SqlitePool;
use tracing::debug;

pub struct CacheEntryQueries;

impl CacheEntryQueries {
    #[inline]
    pub async fn get(pool: &SqlitePool, key: &str) -> Result<Option<CacheRow>> {
        let row = sqlx::query_as::<_, CacheRow>(
            r#"
            SELECT key,
                   value,
                   created_at,
                   expires_at,
                   ttl_ms
            FROM cache_entries WHERE key = ?
            "#,
        )
        .bind(key)
        .fetch_optional(pool)
        .await
        .context("Failed to get cache entry")?;

        Ok(row)
    }

    /// Insert or overwrite an entry; overwriting resets its expiry
    #[inline]
    pub async fn upsert(pool: &SqlitePool, row: &CacheRow) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO cache_entries (key, value, created_at, expires_at, ttl_ms)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                created_at = excluded.created_at,
                expires_at = excluded.expires_at,
                ttl_ms = excluded.ttl_ms
            "#,
        )
        .bind(&row.key)
        .bind(&row.value)
        .bind(row.created_at)
        .bind(row.expires_at)
        .bind(row.ttl_ms)
        .execute(pool)
        .await
        .context("Failed to store cache entry")?;

        Ok(())
    }

    #[inline]
    pub async fn delete(pool: &SqlitePool, key: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM cache_entries WHERE key = ?")
            .bind(key)
            .execute(pool)
            .await
            .context("Failed to delete cache entry")?;

        Ok(result.rows_affected() > 0)
    }

    /// Delete `row` only while it is still the stored version of its key
    #[inline]
    pub async fn delete_version(pool: &SqlitePool, row: &CacheRow) -> Result<bool> {
        let result = sqlx::query(
            "DELETE FROM cache_entries WHERE key = ? AND created_at = ? AND value = ?",
        )
        .bind(&row.key)
        .bind(row.created_at)
        .bind(&row.value)
        .execute(pool)
        .await
        .context("Failed to delete cache entry version")?;

        Ok(result.rows_affected() > 0)
    }

    #[inline]
    pub async fn delete_expired(pool: &SqlitePool, now_ms: i64) -> Result<u64> {
        let result = sqlx::query("DELETE FROM cache_entries WHERE expires_at <= ?")
            .bind(now_ms)
            .execute(pool)
            .await
            .context("Failed to delete expired cache entries")?;

        let removed = result.rows_affected();
        if removed > 0 {
            debug!("Deleted {} expired cache rows", removed);
        }
        Ok(removed)
    }

    #[inline]
    pub async fn clear(pool: &SqlitePool) -> Result<u64> {
        let result = sqlx::query("DELETE FROM cache_entries")
            .execute(pool)
            .await
            .context("Failed to clear cache entries")?;

        Ok(result.rows_affected())
    }

    #[inline]
    pub async fn count(pool: &SqlitePool) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM cache_entries")
            .fetch_one(pool)
            .await
            .context("Failed to count cache entries")?;

        Ok(count)
    }
}
