use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Persisted form of a cache entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct CacheRow {
    /// Fixed-length hash of the caller key
    pub key: String,
    /// JSON-encoded value
    pub value: String,
    pub created_at: i64,
    pub expires_at: i64,
    pub ttl_ms: i64,
}

impl CacheRow {
    #[inline]
    pub fn is_expired_at(&self, now_ms: i64) -> bool {
        self.expires_at <= now_ms
    }

    #[inline]
    pub fn created_at_utc(&self) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(self.created_at)
            .single()
            .unwrap_or_default()
    }

    #[inline]
    pub fn expires_at_utc(&self) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(self.expires_at)
            .single()
            .unwrap_or_default()
    }
}
