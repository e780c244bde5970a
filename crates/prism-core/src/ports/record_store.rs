//! RecordStore port - AggregateRecord の正本（source of truth）
//!
//! MongoDB の `$set: {"face": ...}` のような field 単位の更新を前提にします。

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::{AggregateRecord, ContentHash, ImageId, StageField, StageName, StoreError};

/// Result of a single-field compare-and-set.
#[derive(Debug, Clone, PartialEq)]
pub enum CasOutcome {
    /// The field matched `expected` and now holds the new value.
    Applied,

    /// The field no longer matched `expected`; `current` is what it holds now.
    Mismatch { current: Option<StageField> },

    /// A record for this image exists but references different bytes.
    HashMismatch { existing: ContentHash },
}

/// RecordStore は per-image の AggregateRecord を保存
///
/// # 設計原則
/// - 更新は常に 1 field 単位の compare-and-set
///   （ドキュメント全体の read → mutate → write はしない）
/// - face field の更新が同時に走る agender field の更新を上書きすることはない
/// - record が無ければ CAS と同時に作成（content_hash, stored_at を設定）
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn get(&self, image_id: &ImageId) -> Result<Option<AggregateRecord>, StoreError>;

    async fn get_field(
        &self,
        image_id: &ImageId,
        stage: StageName,
    ) -> Result<Option<StageField>, StoreError>;

    /// Atomically replace the `stage` field if it still equals `expected`.
    ///
    /// Creates the record (with `content_hash` and `stored_at`) when absent.
    async fn compare_and_set_field(
        &self,
        image_id: &ImageId,
        content_hash: &ContentHash,
        stage: StageName,
        expected: Option<&StageField>,
        new: StageField,
        stored_at: DateTime<Utc>,
    ) -> Result<CasOutcome, StoreError>;

    /// Every image whose record references `content_hash`.
    async fn images_for_hash(&self, content_hash: &ContentHash) -> Result<Vec<ImageId>, StoreError>;
}
