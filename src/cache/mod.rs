// Cache module
// Two-tier key/value cache: a bounded LRU memory tier over a SQLite durable tier with TTL expiry


use std::collections::{BTreeMap, HashMap};
use std::marker::PhantomData;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use serde::de::DeserializeOwned;
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tokio::time::sleep;
use tracing::{debug, error, warn};

use crate::database::Database;
use crate::database::sqlite::models::CacheRow;
use crate::embeddings::EmbeddingRecord;
use crate::{RagError, Result};

/// Cache of chunk embeddings keyed by model, document, chunk and content hash
pub type EmbeddingCache = TieredCache<EmbeddingRecord>;

#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct CacheStats {
    pub memory_entries: usize,
    pub durable_entries: u64,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expirations: u64,
    pub corruptions: u64,
}

#[derive(Debug)]
struct MemoryEntry<V> {
    value: V,
    expires_at: i64,
    last_access: u64,
}

/// LRU bookkeeping: `order` maps access tick to key, one tick per live entry.
///
/// `writes` advances on every `set`, `delete` and `clear`. A durable-tier read
/// may only be promoted into memory if no write landed while it was in flight.
#[derive(Debug)]
struct MemoryTier<V> {
    entries: HashMap<String, MemoryEntry<V>>,
    order: BTreeMap<u64, String>,
    tick: u64,
    writes: u64,
}

impl<V> MemoryTier<V> {
    fn new() -> Self {
        Self {
            entries: HashMap::new(),
            order: BTreeMap::new(),
            tick: 0,
            writes: 0,
        }
    }

    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    fn record_write(&mut self) {
        self.writes += 1;
    }

    fn touch(&mut self, key: &str) -> Option<&MemoryEntry<V>> {
        let tick = self.next_tick();
        let entry = self.entries.get_mut(key)?;
        self.order.remove(&entry.last_access);
        entry.last_access = tick;
        self.order.insert(tick, key.to_string());
        Some(entry)
    }

    fn remove(&mut self, key: &str) -> Option<MemoryEntry<V>> {
        let entry = self.entries.remove(key)?;
        self.order.remove(&entry.last_access);
        Some(entry)
    }

    /// Insert or overwrite, returning how many entries were evicted to respect `max_size`
    fn insert(&mut self, key: String, value: V, expires_at: i64, max_size: usize) -> u64 {
        self.remove(&key);

        let mut evicted = 0;
        while self.entries.len() >= max_size {
            let Some((_, oldest)) = self.order.pop_first() else {
                break;
            };
            self.entries.remove(&oldest);
            evicted += 1;
        }

        let tick = self.next_tick();
        self.order.insert(tick, key.clone());
        self.entries.insert(
            key,
            MemoryEntry {
                value,
                expires_at,
                last_access: tick,
            },
        );
        evicted
    }

    fn purge_expired(&mut self, now: i64) -> usize {
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.expires_at <= now)
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            self.remove(key);
        }
        expired.len()
    }

    fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
        self.record_write();
    }
}

#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
    corruptions: AtomicU64,
}

/// Two-tier cache of JSON-serializable values.
///
/// Reads check the memory tier, then the durable tier, re-populating memory on
/// a durable hit. Lookups never fail: durable errors and corrupt rows are
/// logged and reported as misses. The memory lock is never held across a
/// database call.
///
/// Writers update the durable tier before the memory tier, and a promotion is
/// dropped when any write happened since the durable read started, so a
/// `delete` or newer `set` is never undone by a concurrent `get`.
#[derive(Debug)]
pub struct TieredCache<V> {
    memory: Mutex<MemoryTier<V>>,
    database: Database,
    max_size: usize,
    default_ttl: Duration,
    counters: Counters,
    _value: PhantomData<fn() -> V>,
}

impl<V> TieredCache<V>
where
    V: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    #[inline]
    pub fn new(database: Database, max_size: usize, default_ttl: Duration) -> Self {
        Self {
            memory: Mutex::new(MemoryTier::new()),
            database,
            max_size: max_size.max(1),
            default_ttl,
            counters: Counters::default(),
            _value: PhantomData,
        }
    }

    #[inline]
    pub async fn get(&self, key: &str) -> Option<V> {
        let hashed = hash_key(key);
        let now = now_ms();

        let writes_before = {
            let mut memory = self.memory.lock().await;
            let cached = memory
                .touch(&hashed)
                .map(|entry| (entry.expires_at > now).then(|| entry.value.clone()));
            match cached {
                Some(Some(value)) => {
                    drop(memory);
                    self.counters.hits.fetch_add(1, Ordering::Relaxed);
                    return Some(value);
                }
                Some(None) => {
                    memory.remove(&hashed);
                    self.counters.expirations.fetch_add(1, Ordering::Relaxed);
                }
                None => {}
            }
            memory.writes
        };

        let row = match self.database.get_cache_entry(&hashed).await {
            Ok(Some(row)) => row,
            Ok(None) => {
                self.record_miss(key);
                return None;
            }
            Err(e) => {
                warn!("Durable cache lookup failed for {}: {:#}", key, e);
                self.record_miss(key);
                return None;
            }
        };

        if row.is_expired_at(now) {
            debug!("Cache entry {} expired at {}", key, row.expires_at_utc());
            self.counters.expirations.fetch_add(1, Ordering::Relaxed);
            self.delete_stale(&row).await;
            self.record_miss(key);
            return None;
        }

        let value: V = match serde_json::from_str(&row.value) {
            Ok(value) => value,
            Err(e) => {
                warn!(
                    "{}",
                    RagError::CacheCorruption(format!("entry {} ({}): {}", key, hashed, e))
                );
                self.counters.corruptions.fetch_add(1, Ordering::Relaxed);
                self.delete_stale(&row).await;
                self.record_miss(key);
                return None;
            }
        };

        {
            let mut memory = self.memory.lock().await;
            if memory.writes == writes_before {
                let evicted =
                    memory.insert(hashed, value.clone(), row.expires_at, self.max_size);
                drop(memory);
                self.counters.evictions.fetch_add(evicted, Ordering::Relaxed);
                debug!("Cache entry {} promoted from durable tier", key);
            } else {
                debug!("Cache entry {} changed during lookup, not promoted", key);
            }
        }
        self.counters.hits.fetch_add(1, Ordering::Relaxed);

        Some(value)
    }

    /// Store a value in both tiers.
    ///
    /// Returns `false` when the durable write failed; the memory tier still
    /// holds the value in that case.
    #[inline]
    pub async fn set(&self, key: &str, value: V, ttl: Option<Duration>) -> bool {
        let ttl = ttl.unwrap_or(self.default_ttl);
        let ttl_ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
        let created_at = now_ms();
        let expires_at = created_at.saturating_add(ttl_ms);

        let serialized = match serde_json::to_string(&value) {
            Ok(serialized) => serialized,
            Err(e) => {
                error!("Failed to serialize cache entry {}: {}", key, e);
                return false;
            }
        };

        let row = CacheRow {
            key: hash_key(key),
            value: serialized,
            created_at,
            expires_at,
            ttl_ms,
        };
        let stored = match self.database.put_cache_entry(&row).await {
            Ok(()) => true,
            Err(e) => {
                warn!("Durable cache write failed for {}: {:#}", key, e);
                false
            }
        };

        let evicted = {
            let mut memory = self.memory.lock().await;
            memory.record_write();
            memory.insert(row.key, value, expires_at, self.max_size)
        };
        if evicted > 0 {
            self.counters.evictions.fetch_add(evicted, Ordering::Relaxed);
            debug!("Evicted {} memory cache entries", evicted);
        }

        stored
    }

    /// Remove a key from both tiers, returning whether either tier held it
    #[inline]
    pub async fn delete(&self, key: &str) -> bool {
        let hashed = hash_key(key);
        let in_durable = match self.database.delete_cache_entry(&hashed).await {
            Ok(removed) => removed,
            Err(e) => {
                warn!("Durable cache delete failed for {}: {:#}", key, e);
                false
            }
        };
        let in_memory = {
            let mut memory = self.memory.lock().await;
            memory.record_write();
            memory.remove(&hashed).is_some()
        };
        in_memory || in_durable
    }

    #[inline]
    pub async fn clear(&self) -> Result<u64> {
        let cleared = self
            .database
            .clear_cache_entries()
            .await
            .map_err(|e| RagError::Database(format!("{:#}", e)));
        self.memory.lock().await.clear();
        cleared
    }

    /// Drop expired entries from both tiers, returning the number removed
    #[inline]
    pub async fn purge_expired(&self) -> Result<u64> {
        let now = now_ms();
        let from_memory = self.memory.lock().await.purge_expired(now) as u64;
        let from_durable = self
            .database
            .delete_expired_cache_entries(now)
            .await
            .map_err(|e| RagError::Database(format!("{:#}", e)))?;

        let removed = from_memory + from_durable;
        self.counters
            .expirations
            .fetch_add(removed, Ordering::Relaxed);
        if removed > 0 {
            debug!(
                "Purged {} expired cache entries ({} memory, {} durable)",
                removed, from_memory, from_durable
            );
        }
        Ok(removed)
    }

    /// Periodically purge expired entries until the returned handle is aborted
    #[inline]
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let cache = Arc::clone(self);

        tokio::spawn(async move {
            #[expect(
                clippy::infinite_loop,
                reason = "intended to run until handle is aborted"
            )]
            loop {
                sleep(interval).await;
                if let Err(e) = cache.purge_expired().await {
                    error!("Cache sweep failed: {}", e);
                }
            }
        })
    }

    #[inline]
    pub async fn stats(&self) -> CacheStats {
        let memory_entries = self.memory.lock().await.entries.len();
        let durable_entries = match self.database.count_cache_entries().await {
            Ok(count) => u64::try_from(count).unwrap_or_default(),
            Err(e) => {
                warn!("Failed to count durable cache entries: {:#}", e);
                0
            }
        };

        CacheStats {
            memory_entries,
            durable_entries,
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
            expirations: self.counters.expirations.load(Ordering::Relaxed),
            corruptions: self.counters.corruptions.load(Ordering::Relaxed),
        }
    }

    /// Whether the memory tier currently holds the key, without touching its recency
    #[inline]
    pub async fn memory_contains(&self, key: &str) -> bool {
        self.memory.lock().await.entries.contains_key(&hash_key(key))
    }

    #[inline]
    pub async fn memory_len(&self) -> usize {
        self.memory.lock().await.entries.len()
    }

    fn record_miss(&self, key: &str) {
        self.counters.misses.fetch_add(1, Ordering::Relaxed);
        debug!("Cache miss for {}", key);
    }

    /// Drop an expired or corrupt row unless a newer write already replaced it
    async fn delete_stale(&self, row: &CacheRow) {
        if let Err(e) = self.database.delete_cache_entry_version(row).await {
            warn!("Failed to delete durable cache entry {}: {:#}", row.key, e);
        }
    }
}

/// Fixed-length key used by both tiers: the first 16 hex chars of SHA-256
#[inline]
pub fn hash_key(key: &str) -> String {
    let digest = Sha256::digest(key.as_bytes());
    hex::encode(digest.get(..8).unwrap_or_default())
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}
