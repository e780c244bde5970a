//! InMemoryCache - 開発・テスト用の ResultCache
//!
//! # 実装詳細
//! - DashMap<ImageId, CacheEntry> で key ごとにシャードロック
//!   （key をまたぐグローバルロックはない）
//! - 1 回の操作は 1 エントリのロック内で完結し、await を跨がない
//! - TTL はエントリ作成時に設定（Redis の HSET + EXPIRE と同じ）、
//!   期限切れは読み出し時に不在として扱い、その場で削除

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use crate::domain::{CacheError, ImageId};
use crate::ports::ResultCache;

#[derive(Debug)]
struct CacheEntry {
    fields: HashMap<String, String>,
    expires_at: Option<Instant>,
}

impl CacheEntry {
    fn new(ttl: Option<Duration>) -> Self {
        Self {
            fields: HashMap::new(),
            expires_at: ttl.map(|ttl| Instant::now() + ttl),
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

pub struct InMemoryCache {
    entries: DashMap<ImageId, CacheEntry>,
    ttl: Option<Duration>,
    offline: AtomicBool,
}

impl InMemoryCache {
    pub fn new() -> Self {
        Self::with_ttl(None)
    }

    pub fn with_ttl(ttl: Option<Duration>) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
            offline: AtomicBool::new(false),
        }
    }

    /// Simulate the backend going away; every call fails with `Unavailable`.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Number of keys currently held (expired ones included until touched).
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn check_online(&self) -> Result<(), CacheError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(CacheError::Unavailable("in-memory cache is offline".to_string()));
        }
        Ok(())
    }

    /// Read one field, dropping the entry first if it has expired.
    fn read_field(&self, key: &ImageId, field: &str) -> Option<String> {
        let now = Instant::now();
        self.entries.remove_if(key, |_, entry| entry.is_expired(now));
        self.entries
            .get(key)
            .and_then(|entry| entry.fields.get(field).cloned())
    }
}

impl Default for InMemoryCache {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ResultCache for InMemoryCache {
    async fn field_exists(&self, key: &ImageId, field: &str) -> Result<bool, CacheError> {
        self.check_online()?;
        Ok(self.read_field(key, field).is_some())
    }

    async fn field_get(&self, key: &ImageId, field: &str) -> Result<Option<String>, CacheError> {
        self.check_online()?;
        Ok(self.read_field(key, field))
    }

    async fn field_set(&self, key: &ImageId, field: &str, value: String) -> Result<(), CacheError> {
        self.check_online()?;
        let now = Instant::now();
        match self.entries.entry(*key) {
            Entry::Occupied(mut occupied) => {
                let entry = occupied.get_mut();
                if entry.is_expired(now) {
                    *entry = CacheEntry::new(self.ttl);
                }
                entry.fields.insert(field.to_string(), value);
            }
            Entry::Vacant(vacant) => {
                let mut entry = CacheEntry::new(self.ttl);
                entry.fields.insert(field.to_string(), value);
                vacant.insert(entry);
            }
        }
        Ok(())
    }

    async fn fields(&self, key: &ImageId) -> Result<HashMap<String, String>, CacheError> {
        self.check_online()?;
        let now = Instant::now();
        self.entries.remove_if(key, |_, entry| entry.is_expired(now));
        Ok(self
            .entries
            .get(key)
            .map(|entry| entry.fields.clone())
            .unwrap_or_default())
    }
}
