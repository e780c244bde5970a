//! InMemoryRecordStore - 開発・テスト用の RecordStore
//!
//! compare-and-set は DashMap の entry ロック内で「比較 → 1 field 更新」を行う。
//! 他の field には触らないので、face と agender の更新が同時に来ても
//! どちらも失われない。

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use crate::domain::{AggregateRecord, ContentHash, ImageId, StageField, StageName, StoreError};
use crate::ports::{CasOutcome, RecordStore};

pub struct InMemoryRecordStore {
    records: DashMap<ImageId, AggregateRecord>,
    offline: AtomicBool,
}

impl InMemoryRecordStore {
    pub fn new() -> Self {
        Self {
            records: DashMap::new(),
            offline: AtomicBool::new(false),
        }
    }

    /// Simulate the backend going away; every call fails with `Unavailable`.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn check_online(&self) -> Result<(), StoreError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("in-memory record store is offline".to_string()));
        }
        Ok(())
    }
}

impl Default for InMemoryRecordStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RecordStore for InMemoryRecordStore {
    async fn get(&self, image_id: &ImageId) -> Result<Option<AggregateRecord>, StoreError> {
        self.check_online()?;
        Ok(self.records.get(image_id).map(|r| r.clone()))
    }

    async fn get_field(
        &self,
        image_id: &ImageId,
        stage: StageName,
    ) -> Result<Option<StageField>, StoreError> {
        self.check_online()?;
        Ok(self
            .records
            .get(image_id)
            .and_then(|r| r.field(stage).cloned()))
    }

    async fn compare_and_set_field(
        &self,
        image_id: &ImageId,
        content_hash: &ContentHash,
        stage: StageName,
        expected: Option<&StageField>,
        new: StageField,
        stored_at: DateTime<Utc>,
    ) -> Result<CasOutcome, StoreError> {
        self.check_online()?;
        match self.records.entry(*image_id) {
            Entry::Vacant(vacant) => {
                if expected.is_some() {
                    return Ok(CasOutcome::Mismatch { current: None });
                }
                let mut record = AggregateRecord::new(*image_id, content_hash.clone(), stored_at);
                *record.field_mut(stage) = Some(new);
                vacant.insert(record);
                Ok(CasOutcome::Applied)
            }
            Entry::Occupied(mut occupied) => {
                let record = occupied.get_mut();
                if record.content_hash != *content_hash {
                    return Ok(CasOutcome::HashMismatch {
                        existing: record.content_hash.clone(),
                    });
                }
                let slot = record.field_mut(stage);
                if slot.as_ref() != expected {
                    return Ok(CasOutcome::Mismatch {
                        current: slot.clone(),
                    });
                }
                *slot = Some(new);
                Ok(CasOutcome::Applied)
            }
        }
    }

    async fn images_for_hash(&self, content_hash: &ContentHash) -> Result<Vec<ImageId>, StoreError> {
        self.check_online()?;
        let mut ids: Vec<ImageId> = self
            .records
            .iter()
            .filter(|r| r.content_hash == *content_hash)
            .map(|r| r.image_id)
            .collect();
        ids.sort();
        Ok(ids)
    }
}
