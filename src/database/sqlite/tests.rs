use super::*;
use anyhow::Result;
use std::collections::HashSet;
use tempfile::TempDir;

async fn create_test_database() -> Result<(TempDir, Database)> {
    let temp_dir = TempDir::new()?;
    let database = Database::initialize_from_config_dir(temp_dir.path()).await?;
    Ok((temp_dir, database))
}

fn row(key: &str, value: &str, expires_at: i64) -> CacheRow {
    CacheRow {
        key: key.to_string(),
        value: value.to_string(),
        created_at: 1_000,
        expires_at,
        ttl_ms: expires_at - 1_000,
    }
}

#[tokio::test]
async fn integration_schema_migration() -> Result<()> {
    let (_temp_dir, database) = create_test_database().await?;

    let tables: Vec<String> = sqlx::query_scalar(
        "SELECT name FROM sqlite_master WHERE type='table' AND name NOT LIKE 'sqlite_%' AND name NOT LIKE '_sqlx%'",
    )
    .fetch_all(database.pool())
    .await?;

    let actual_tables: HashSet<&str> = tables.iter().map(|t| t.as_str()).collect();
    assert_eq!(actual_tables, HashSet::from(["cache_entries"]));

    Ok(())
}

#[tokio::test]
async fn put_get_delete() -> Result<()> {
    let (_temp_dir, database) = create_test_database().await?;

    database
        .put_cache_entry(&row("abc", "{\"x\":1}", 5_000))
        .await?;
    let fetched = database.get_cache_entry("abc").await?;
    assert_eq!(fetched, Some(row("abc", "{\"x\":1}", 5_000)));

    assert!(database.delete_cache_entry("abc").await?);
    assert!(!database.delete_cache_entry("abc").await?);
    assert_eq!(database.get_cache_entry("abc").await?, None);

    Ok(())
}

#[tokio::test]
async fn upsert_overwrites_and_resets_expiry() -> Result<()> {
    let (_temp_dir, database) = create_test_database().await?;

    database.put_cache_entry(&row("k", "\"old\"", 2_000)).await?;
    database.put_cache_entry(&row("k", "\"new\"", 9_000)).await?;

    let fetched = database
        .get_cache_entry("k")
        .await?
        .expect("entry should exist");
    assert_eq!(fetched.value, "\"new\"");
    assert_eq!(fetched.expires_at, 9_000);
    assert_eq!(database.count_cache_entries().await?, 1);

    Ok(())
}

#[tokio::test]
async fn delete_expired_only_removes_stale_rows() -> Result<()> {
    let (_temp_dir, database) = create_test_database().await?;

    database.put_cache_entry(&row("stale", "1", 2_000)).await?;
    database.put_cache_entry(&row("fresh", "2", 8_000)).await?;

    let removed = database.delete_expired_cache_entries(5_000).await?;

    assert_eq!(removed, 1);
    assert!(database.get_cache_entry("stale").await?.is_none());
    assert!(database.get_cache_entry("fresh").await?.is_some());

    Ok(())
}

#[tokio::test]
async fn clear_removes_everything() -> Result<()> {
    let (_temp_dir, database) = create_test_database().await?;

    for i in 0..5 {
        database
            .put_cache_entry(&row(&format!("k{}", i), "0", 10_000))
            .await?;
    }

    assert_eq!(database.clear_cache_entries().await?, 5);
    assert_eq!(database.count_cache_entries().await?, 0);

    Ok(())
}

#[tokio::test]
async fn concurrent_writes_are_serialized() -> Result<()> {
    let (_temp_dir, database) = create_test_database().await?;

    let mut handles = Vec::new();
    for i in 0..10 {
        let database = database.clone();
        let handle = tokio::spawn(async move {
            database
                .put_cache_entry(&row(&format!("key{}", i), "0", 10_000))
                .await
        });
        handles.push(handle);
    }

    for handle in handles {
        handle.await??;
    }

    assert_eq!(database.count_cache_entries().await?, 10);

    Ok(())
}

#[tokio::test]
async fn version_delete_spares_newer_rows() -> Result<()> {
    let (_temp_dir, database) = create_test_database().await?;
    let stale = row("k", "\"old\"", 2_000);
    database.put_cache_entry(&stale).await?;
    database.put_cache_entry(&row("k", "\"new\"", 9_000)).await?;

    assert!(!database.delete_cache_entry_version(&stale).await?);
    assert!(database.get_cache_entry("k").await?.is_some());

    let current = row("k", "\"new\"", 9_000);
    assert!(database.delete_cache_entry_version(&current).await?);
    assert_eq!(database.get_cache_entry("k").await?, None);

    Ok(())
}
