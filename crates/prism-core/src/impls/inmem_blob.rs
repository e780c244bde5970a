//! InMemoryBlobStore - 開発・テスト用の BlobStore
//!
//! bytes とメタ情報を 1 つの StoredBlob にまとめ、DashMap の entry API で
//! 「無ければ挿入」を 1 回のロックで行います。

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use crate::domain::{BlobMeta, ContentHash, StoreError};
use crate::ports::BlobStore;

#[derive(Debug, Clone)]
struct StoredBlob {
    bytes: Arc<[u8]>,
    meta: BlobMeta,
}

pub struct InMemoryBlobStore {
    blobs: DashMap<ContentHash, StoredBlob>,
    writes: AtomicUsize,
    offline: AtomicBool,
}

impl InMemoryBlobStore {
    pub fn new() -> Self {
        Self {
            blobs: DashMap::new(),
            writes: AtomicUsize::new(0),
            offline: AtomicBool::new(false),
        }
    }

    /// Simulate the backend going away; every call fails with `Unavailable`.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Number of distinct blobs held.
    pub fn len(&self) -> usize {
        self.blobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.is_empty()
    }

    /// Number of physical writes performed since creation.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    fn check_online(&self) -> Result<(), StoreError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("in-memory blob store is offline".to_string()));
        }
        Ok(())
    }
}

impl Default for InMemoryBlobStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BlobStore for InMemoryBlobStore {
    async fn put_if_absent(
        &self,
        hash: &ContentHash,
        bytes: Arc<[u8]>,
        meta: BlobMeta,
    ) -> Result<bool, StoreError> {
        self.check_online()?;
        match self.blobs.entry(hash.clone()) {
            Entry::Occupied(_) => Ok(false),
            Entry::Vacant(vacant) => {
                vacant.insert(StoredBlob { bytes, meta });
                self.writes.fetch_add(1, Ordering::SeqCst);
                Ok(true)
            }
        }
    }

    async fn exists(&self, hash: &ContentHash) -> Result<bool, StoreError> {
        self.check_online()?;
        Ok(self.blobs.contains_key(hash))
    }

    async fn get(&self, hash: &ContentHash) -> Result<Option<Arc<[u8]>>, StoreError> {
        self.check_online()?;
        Ok(self.blobs.get(hash).map(|b| Arc::clone(&b.bytes)))
    }

    async fn meta(&self, hash: &ContentHash) -> Result<Option<BlobMeta>, StoreError> {
        self.check_online()?;
        Ok(self.blobs.get(hash).map(|b| b.meta.clone()))
    }
}
