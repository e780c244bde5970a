//! Aggregator - 結果の保存と集約
//!
//! # 責務
//! - bytes を content hash 単位で 1 度だけ BlobStore に保存
//! - stage の結果を AggregateRecord の該当 field にだけ CAS でマージ
//! - マージ後に cache の `<stage>_status` を更新（失敗しても致命的ではない）
//!
//! # マージ規則
//! 優先度は MISSING < ERROR < {SUCCESS, EMPTY}。
//! 低い優先度の結果が高い優先度の結果を上書きすることはない。
//! 同じ優先度で中身が違う具体的な結果同士は ConflictPolicy で解決する。

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{Mutex, mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::app::retry::{RetryPolicy, retry_transient};
use crate::config::{AggregatorConfig, ConflictPolicy};
use crate::domain::{
    BlobMeta, ContentHash, ImageFormat, ImageId, OutcomeKind, PrismError, StageField, StageName,
};
use crate::ports::{
    BlobStore, CasOutcome, Clock, MergeOutcome, RecordStore, ResultCache, ResultSink, StorageAck,
    StoreRequest,
};
use crate::worker::WorkerGroup;

/// CAS をやり直す上限（in-memory でも外部 DB でも通常は数回で収束する）
const MAX_CAS_ROUNDS: usize = 32;

/// Result of `Aggregator::store_blob`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobReceipt {
    pub content_hash: ContentHash,
    /// This call performed the physical write.
    pub written: bool,
}

pub struct Aggregator {
    blobs: Arc<dyn BlobStore>,
    records: Arc<dyn RecordStore>,
    cache: Arc<dyn ResultCache>,
    clock: Arc<dyn Clock>,
    policy: ConflictPolicy,
    max_payload_bytes: usize,
    retry: RetryPolicy,
    /// 同じ image+stage のマージは直列化する（CAS と cache の status 書き込みの順序を揃える）
    merge_locks: DashMap<(ImageId, StageName), Arc<Mutex<()>>>,
}

impl Aggregator {
    pub fn new(
        blobs: Arc<dyn BlobStore>,
        records: Arc<dyn RecordStore>,
        cache: Arc<dyn ResultCache>,
        clock: Arc<dyn Clock>,
        config: &AggregatorConfig,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            blobs,
            records,
            cache,
            clock,
            policy: config.conflict_policy,
            max_payload_bytes: config.max_payload_bytes,
            retry,
            merge_locks: DashMap::new(),
        }
    }

    /// Store `bytes` under their content hash unless a copy already exists.
    pub async fn store_blob(&self, bytes: Arc<[u8]>) -> Result<BlobReceipt, PrismError> {
        let content_hash = ContentHash::of(&bytes);
        self.store_hashed_blob(&content_hash, bytes).await
    }

    async fn store_hashed_blob(
        &self,
        content_hash: &ContentHash,
        bytes: Arc<[u8]>,
    ) -> Result<BlobReceipt, PrismError> {
        if self.blobs.exists(content_hash).await? {
            debug!(hash = content_hash.short(), "blob already stored");
            return Ok(BlobReceipt {
                content_hash: content_hash.clone(),
                written: false,
            });
        }

        let meta = BlobMeta {
            content_hash: content_hash.clone(),
            size: bytes.len(),
            format: ImageFormat::detect(&bytes),
            stored_at: self.clock.now(),
        };
        // exists() との間に別リクエストが書いた場合は put_if_absent が false を返す
        let written = self.blobs.put_if_absent(content_hash, bytes, meta).await?;
        if written {
            info!(hash = content_hash.short(), "blob stored");
        }
        Ok(BlobReceipt {
            content_hash: content_hash.clone(),
            written,
        })
    }

    /// Merge one stage's field into the image's aggregate record.
    ///
    /// Only the `stage` field is touched. Fails with `BlobNotFound` when no
    /// blob exists for `content_hash`, and with `Conflict` when the record
    /// already belongs to other bytes or the conflict policy refuses the value.
    pub async fn merge_result(
        &self,
        image_id: ImageId,
        content_hash: &ContentHash,
        stage: StageName,
        incoming: StageField,
    ) -> Result<MergeOutcome, PrismError> {
        let key = (image_id, stage);
        let lock = Arc::clone(self.merge_locks.entry(key).or_default().value());
        let merged = {
            let _serial = lock.lock().await;
            self.merge_serialized(image_id, content_hash, stage, incoming).await
        };
        drop(lock);
        self.merge_locks.remove_if(&key, |_, lock| Arc::strong_count(lock) == 1);
        merged
    }

    async fn merge_serialized(
        &self,
        image_id: ImageId,
        content_hash: &ContentHash,
        stage: StageName,
        incoming: StageField,
    ) -> Result<MergeOutcome, PrismError> {
        if !self.blobs.exists(content_hash).await? {
            return Err(PrismError::BlobNotFound(content_hash.clone()));
        }

        let mut current = self.records.get_field(&image_id, stage).await?;
        for _ in 0..MAX_CAS_ROUNDS {
            let outcome = match resolve(self.policy, current.as_ref(), &incoming) {
                Resolution::Write(outcome) => outcome,
                Resolution::Keep => {
                    debug!(%image_id, %stage, status = %incoming.status.as_str(), "merge is a no-op");
                    return Ok(MergeOutcome::Unchanged);
                }
                Resolution::KeepDivergent => {
                    warn!(%image_id, %stage, "divergent result dropped, keeping the first one");
                    return Ok(MergeOutcome::Unchanged);
                }
                Resolution::Reject => {
                    warn!(%image_id, %stage, "divergent result rejected");
                    return Err(PrismError::Conflict {
                        image_id,
                        stage,
                        detail: "a different result is already stored".to_string(),
                    });
                }
            };

            let cas = self
                .records
                .compare_and_set_field(
                    &image_id,
                    content_hash,
                    stage,
                    current.as_ref(),
                    incoming.clone(),
                    self.clock.now(),
                )
                .await?;

            match cas {
                CasOutcome::Applied => {
                    if outcome == MergeOutcome::Overwritten {
                        warn!(%image_id, %stage, "divergent result overwrote the stored one");
                    }
                    info!(%image_id, %stage, status = incoming.status.as_str(), merge = ?outcome, "result merged");
                    self.mark_status(&image_id, stage, incoming.status).await;
                    return Ok(outcome);
                }
                CasOutcome::Mismatch { current: latest } => {
                    debug!(%image_id, %stage, "concurrent update, retrying merge");
                    current = latest;
                }
                CasOutcome::HashMismatch { existing } => {
                    warn!(%image_id, %stage, existing = existing.short(), incoming = content_hash.short(), "image id reused for different bytes");
                    return Err(PrismError::Conflict {
                        image_id,
                        stage,
                        detail: format!("record already refers to content hash {existing}"),
                    });
                }
            }
        }

        Err(PrismError::Internal(format!(
            "merge of {stage} for {image_id} did not settle after {MAX_CAS_ROUNDS} rounds"
        )))
    }

    async fn mark_status(&self, image_id: &ImageId, stage: StageName, status: OutcomeKind) {
        let written = self
            .cache
            .field_set(image_id, stage.status_field(), status.as_str().to_string())
            .await;
        if let Err(e) = written {
            warn!(%image_id, %stage, error = %e, "could not update cache status, proceeding");
        }
    }

    /// Validate, store the blob, then merge the result.
    pub async fn handle(&self, request: StoreRequest) -> Result<StorageAck, PrismError> {
        let StoreRequest { result, bytes } = request;
        if bytes.is_empty() {
            return Err(PrismError::EmptyPayload);
        }
        if bytes.len() > self.max_payload_bytes {
            return Err(PrismError::PayloadTooLarge {
                size: bytes.len(),
                max: self.max_payload_bytes,
            });
        }
        let actual = ContentHash::of(&bytes);
        if actual != result.content_hash {
            return Err(PrismError::HashMismatch {
                claimed: result.content_hash,
                actual,
            });
        }

        let content_hash = &actual;
        let receipt = retry_transient(&self.retry, "store blob", || {
            self.store_hashed_blob(content_hash, Arc::clone(&bytes))
        })
        .await?;

        let image_id = result.image_id;
        let stage = result.stage;
        let field = StageField::from_result(&result, self.clock.now());
        let merge = retry_transient(&self.retry, "merge result", || {
            self.merge_result(image_id, content_hash, stage, field.clone())
        })
        .await?;

        Ok(StorageAck {
            image_id,
            stage,
            content_hash: actual.clone(),
            blob_written: receipt.written,
            merge,
        })
    }

    /// Start the request loop and return a sink feeding it.
    pub fn spawn(self: Arc<Self>, config: &AggregatorConfig) -> (AggregatorHandle, WorkerGroup) {
        let (tx, rx) = mpsc::channel(config.queue_capacity);
        let group = WorkerGroup::spawn(
            "aggregator",
            rx,
            config.max_concurrent_merges,
            move |command: AggregatorCommand| {
                let this = Arc::clone(&self);
                async move {
                    let image_id = command.request.result.image_id;
                    let stage = command.request.result.stage;
                    let result = this.handle(command.request).await;
                    if let Err(e) = &result {
                        warn!(%image_id, %stage, error = %e, "store request failed");
                    }
                    // 呼び出し元が既に諦めていても問題ない
                    let _ = command.reply.send(result);
                }
            },
        );
        (AggregatorHandle { tx }, group)
    }
}

enum Resolution {
    Write(MergeOutcome),
    Keep,
    KeepDivergent,
    Reject,
}

fn resolve(policy: ConflictPolicy, current: Option<&StageField>, incoming: &StageField) -> Resolution {
    let Some(current) = current else {
        return Resolution::Write(MergeOutcome::Inserted);
    };
    if current.same_content(incoming) {
        return Resolution::Keep;
    }

    let (have, got) = (current.status.rank(), incoming.status.rank());
    if got < have {
        return Resolution::Keep;
    }
    if got > have {
        return Resolution::Write(MergeOutcome::Upgraded);
    }

    // 同順位: ERROR / MISSING 同士は新しい理由で置き換えるだけ
    if !incoming.status.has_payload() {
        return Resolution::Write(MergeOutcome::Overwritten);
    }
    match policy {
        ConflictPolicy::Overwrite => Resolution::Write(MergeOutcome::Overwritten),
        ConflictPolicy::KeepFirst => Resolution::KeepDivergent,
        ConflictPolicy::Reject => Resolution::Reject,
    }
}

struct AggregatorCommand {
    request: StoreRequest,
    reply: oneshot::Sender<Result<StorageAck, PrismError>>,
}

/// Channel front of a spawned `Aggregator`.
#[derive(Clone)]
pub struct AggregatorHandle {
    tx: mpsc::Sender<AggregatorCommand>,
}

#[async_trait]
impl ResultSink for AggregatorHandle {
    async fn store_result(&self, request: StoreRequest) -> Result<StorageAck, PrismError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(AggregatorCommand { request, reply })
            .await
            .map_err(|_| PrismError::ShuttingDown)?;
        rx.await.map_err(|_| PrismError::ShuttingDown)?
    }
}
