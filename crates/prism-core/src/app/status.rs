//! Status - 画像ごとの処理状況クエリ
//!
//! cache の `<stage>_status` を先に見て、全 stage が終わっていればそれで答える。
//! そうでなければ RecordStore（正本）を読む。cache が落ちていても答えられる。

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;
use tracing::warn;

use crate::domain::{AggregateRecord, BlobMeta, ContentHash, ImageId, OutcomeKind, PrismError, StageName};
use crate::ports::{BlobStore, RecordStore, ResultCache};

/// Where an `ImageStatus` was answered from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusSource {
    Cache,
    Store,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImageStatus {
    pub image_id: ImageId,
    /// `None` while a stage has not reported yet.
    pub stages: BTreeMap<StageName, Option<OutcomeKind>>,
    /// Every stage reached a terminal outcome.
    pub fully_processed: bool,
    pub source: StatusSource,
}

impl ImageStatus {
    fn new(image_id: ImageId, stages: BTreeMap<StageName, Option<OutcomeKind>>, source: StatusSource) -> Self {
        let fully_processed = stages.values().all(|s| s.is_some_and(OutcomeKind::is_terminal));
        Self {
            image_id,
            stages,
            fully_processed,
            source,
        }
    }

    pub fn stage(&self, stage: StageName) -> Option<OutcomeKind> {
        self.stages.get(&stage).copied().flatten()
    }
}

pub struct StatusQuery {
    cache: Arc<dyn ResultCache>,
    records: Arc<dyn RecordStore>,
    blobs: Arc<dyn BlobStore>,
    stages: Vec<StageName>,
}

impl StatusQuery {
    pub fn new(
        cache: Arc<dyn ResultCache>,
        records: Arc<dyn RecordStore>,
        blobs: Arc<dyn BlobStore>,
        stages: Vec<StageName>,
    ) -> Self {
        Self {
            cache,
            records,
            blobs,
            stages,
        }
    }

    pub async fn status(&self, image_id: ImageId) -> Result<ImageStatus, PrismError> {
        if let Some(status) = self.from_cache(&image_id).await {
            return Ok(status);
        }

        let record = self.records.get(&image_id).await?;
        let stages = self
            .stages
            .iter()
            .map(|&stage| {
                let status = record.as_ref().and_then(|r| r.field(stage)).map(|f| f.status);
                (stage, status)
            })
            .collect();
        Ok(ImageStatus::new(image_id, stages, StatusSource::Store))
    }

    /// The full aggregate record, if any stage has reported.
    pub async fn record(&self, image_id: ImageId) -> Result<Option<AggregateRecord>, PrismError> {
        Ok(self.records.get(&image_id).await?)
    }

    /// Metadata of the stored copy of `content_hash`.
    pub async fn blob(&self, content_hash: &ContentHash) -> Result<Option<BlobMeta>, PrismError> {
        Ok(self.blobs.meta(content_hash).await?)
    }

    /// Every image whose record points at `content_hash`, in id order.
    pub async fn images_sharing(&self, content_hash: &ContentHash) -> Result<Vec<ImageId>, PrismError> {
        Ok(self.records.images_for_hash(content_hash).await?)
    }

    /// Answer from cache only when it shows every stage finished.
    async fn from_cache(&self, image_id: &ImageId) -> Option<ImageStatus> {
        let fields = match self.cache.fields(image_id).await {
            Ok(fields) => fields,
            Err(e) => {
                warn!(%image_id, error = %e, "cache unavailable, reading status from store");
                return None;
            }
        };
        let stages: BTreeMap<_, _> = self
            .stages
            .iter()
            .map(|&stage| {
                let status = fields
                    .get(stage.status_field())
                    .and_then(|raw| raw.parse::<OutcomeKind>().ok());
                (stage, status)
            })
            .collect();
        let status = ImageStatus::new(*image_id, stages, StatusSource::Cache);
        status.fully_processed.then_some(status)
    }
}
