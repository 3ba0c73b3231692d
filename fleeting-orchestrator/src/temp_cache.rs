//! Short-lived overlay for state transitions the provider listing does not show yet.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fleeting_common::InstanceRecord;
use redis::AsyncCommands;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::settings::{CacheBackend, Settings};

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("redis: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("cache entry codec: {0}")]
    Codec(#[from] serde_json::Error),
}

/// TTL-bounded key/value store. Entries past their expiry are never returned.
#[async_trait]
pub trait TempCache: Send + Sync {
    /// Store `value` under `key` until now + TTL, replacing any previous entry.
    async fn put(&self, key: &str, value: &InstanceRecord) -> Result<(), CacheError>;

    /// Every live value whose key starts with `prefix`, in no particular order.
    async fn find(&self, prefix: &str) -> Result<Vec<InstanceRecord>, CacheError>;
}

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to.
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    fn guard(&self) -> MutexGuard<'_, DateTime<Utc>> {
        self.now.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.guard();
        *now += to_chrono(by);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.guard()
    }
}

fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::weeks(52 * 100))
}

struct Entry {
    value: InstanceRecord,
    expiry: DateTime<Utc>,
}

/// In-process variant: one mutex around the map, values cloned in and out.
pub struct MemoryTempCache {
    ttl: chrono::Duration,
    clock: Arc<dyn Clock>,
    entries: Mutex<HashMap<String, Entry>>,
}

impl MemoryTempCache {
    pub fn new(ttl: Duration) -> Self {
        Self::with_clock(ttl, Arc::new(SystemClock))
    }

    pub fn with_clock(ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            ttl: to_chrono(ttl),
            clock,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Lock the map and drop everything that expired.
    fn live_entries(&self) -> (MutexGuard<'_, HashMap<String, Entry>>, DateTime<Utc>) {
        let now = self.clock.now();
        let mut entries = self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        entries.retain(|_, e| now < e.expiry);
        (entries, now)
    }
}

#[async_trait]
impl TempCache for MemoryTempCache {
    async fn put(&self, key: &str, value: &InstanceRecord) -> Result<(), CacheError> {
        let (mut entries, now) = self.live_entries();
        entries.insert(
            key.to_string(),
            Entry {
                value: value.clone(),
                expiry: now + self.ttl,
            },
        );
        Ok(())
    }

    async fn find(&self, prefix: &str) -> Result<Vec<InstanceRecord>, CacheError> {
        let (entries, _) = self.live_entries();
        Ok(entries
            .iter()
            .filter(|(key, _)| key.starts_with(prefix))
            .map(|(_, e)| e.value.clone())
            .collect())
    }
}

/// Shared-store variant: one Redis string per key, expiry handled by Redis itself.
pub struct RedisTempCache {
    client: redis::Client,
    ttl_secs: u64,
}

impl RedisTempCache {
    pub fn new(redis_url: &str, ttl: Duration) -> Result<Self, CacheError> {
        Ok(Self {
            client: redis::Client::open(redis_url)?,
            ttl_secs: ttl.as_secs().max(1),
        })
    }
}

/// Escape glob metacharacters so a key prefix matches literally in SCAN/KEYS.
pub fn glob_escape(prefix: &str) -> String {
    let mut out = String::with_capacity(prefix.len());
    for c in prefix.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

#[async_trait]
impl TempCache for RedisTempCache {
    async fn put(&self, key: &str, value: &InstanceRecord) -> Result<(), CacheError> {
        let payload = serde_json::to_string(value)?;
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        conn.set_ex::<_, _, ()>(key, payload, self.ttl_secs).await?;
        Ok(())
    }

    async fn find(&self, prefix: &str) -> Result<Vec<InstanceRecord>, CacheError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let pattern = format!("{}*", glob_escape(prefix));
        let keys: Vec<String> = {
            let mut iter = conn.scan_match::<_, String>(pattern).await?;
            let mut keys = Vec::new();
            while let Some(key) = iter.next_item().await {
                keys.push(key);
            }
            keys
        };
        if keys.is_empty() {
            return Ok(Vec::new());
        }

        // Keys can expire between SCAN and MGET; those come back as nil.
        let values: Vec<Option<String>> = redis::cmd("MGET")
            .arg(&keys)
            .query_async(&mut conn)
            .await?;
        let mut out = Vec::new();
        for raw in values.into_iter().flatten() {
            match serde_json::from_str::<InstanceRecord>(&raw) {
                Ok(record) => out.push(record),
                Err(e) => tracing::warn!(error = %e, "skipping undecodable cache entry"),
            }
        }
        Ok(out)
    }
}

/// Build the cache variant selected in settings. Called once at startup.
pub fn build_cache(settings: &Settings) -> Result<Arc<dyn TempCache>, CacheError> {
    match &settings.cache {
        CacheBackend::Memory => Ok(Arc::new(MemoryTempCache::new(settings.cache_ttl))),
        CacheBackend::Redis { url } => Ok(Arc::new(RedisTempCache::new(url, settings.cache_ttl)?)),
    }
}
