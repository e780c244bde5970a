//! AnalysisStage - 1 種類の解析（face / agender）を担当するステージ
//!
//! # フロー
//! 1. cache の `<stage>_results` を確認（hit なら推論しない）
//! 2. miss なら timeout 付きで Inference を呼ぶ
//! 3. Success / Empty のみ cache に書き戻す（Error / Missing は書かない）
//! 4. 結果と bytes を ResultSink（Aggregator）へ転送
//!
//! # 並行性
//! spawn() で bounded queue + WorkerGroup を起動し、StageHandle を返す。
//! StageHandle が StageClient を実装し、Router からはそれだけが見える。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::SendTimeoutError;
use tracing::{debug, info, warn};

use crate::app::retry::{RetryPolicy, retry_transient};
use crate::config::StageConfig;
use crate::domain::{AnalysisResult, ContentHash, ImageId, PrismError, StageName, StagePayload};
use crate::ports::{Inference, ResultCache, ResultSink, StageClient, StageJob, StorageAck, StoreRequest};
use crate::worker::WorkerGroup;

pub struct AnalysisStage {
    stage: StageName,
    inference: Arc<dyn Inference>,
    cache: Arc<dyn ResultCache>,
    sink: Arc<dyn ResultSink>,
    inference_timeout: Duration,
    retry: RetryPolicy,
}

impl AnalysisStage {
    pub fn new(
        stage: StageName,
        inference: Arc<dyn Inference>,
        cache: Arc<dyn ResultCache>,
        sink: Arc<dyn ResultSink>,
        inference_timeout: Duration,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            stage,
            inference,
            cache,
            sink,
            inference_timeout,
            retry,
        }
    }

    pub fn stage(&self) -> StageName {
        self.stage
    }

    /// Analyze one image, reusing a cached payload when there is one.
    ///
    /// Never fails: inference errors come back as an `ERROR` result and
    /// timeouts as `MISSING`. Cache trouble only costs a recomputation.
    pub async fn analyze(&self, image_id: ImageId, bytes: &[u8]) -> AnalysisResult {
        let content_hash = ContentHash::of(bytes);
        self.analyze_hashed(image_id, &content_hash, bytes).await
    }

    async fn analyze_hashed(
        &self,
        image_id: ImageId,
        content_hash: &ContentHash,
        bytes: &[u8],
    ) -> AnalysisResult {
        if let Some(payload) = self.cached_payload(&image_id).await {
            debug!(stage = %self.stage, %image_id, "cache hit, skipping inference");
            return AnalysisResult::from_payload(image_id, content_hash.clone(), payload);
        }

        let payload = match tokio::time::timeout(self.inference_timeout, self.inference.analyze(bytes)).await {
            Ok(Ok(payload)) if payload.stage() == self.stage => payload,
            Ok(Ok(payload)) => {
                warn!(stage = %self.stage, %image_id, returned = %payload.stage(), "engine returned a payload for another stage");
                return AnalysisResult::failed(
                    image_id,
                    content_hash.clone(),
                    self.stage,
                    format!("engine returned a {} payload", payload.stage()),
                );
            }
            Ok(Err(e)) => {
                let error = PrismError::Analysis {
                    stage: self.stage,
                    reason: e.to_string(),
                };
                warn!(stage = %self.stage, %image_id, kind = ?error.kind(), error = %error, "inference failed");
                return AnalysisResult::failed(image_id, content_hash.clone(), self.stage, error.to_string());
            }
            Err(_) => {
                warn!(
                    stage = %self.stage,
                    %image_id,
                    timeout_ms = self.inference_timeout.as_millis() as u64,
                    "inference timed out"
                );
                return AnalysisResult::missing(
                    image_id,
                    content_hash.clone(),
                    self.stage,
                    PrismError::Timeout { operation: "inference" }.to_string(),
                );
            }
        };

        self.write_back(&image_id, &payload).await;
        info!(stage = %self.stage, %image_id, detections = payload.len(), "analysis complete");
        AnalysisResult::from_payload(image_id, content_hash.clone(), payload)
    }

    /// Look the payload up in the cache. Unreadable or undecodable entries count as a miss.
    async fn cached_payload(&self, image_id: &ImageId) -> Option<StagePayload> {
        let field = self.stage.results_field();
        let raw = match self.cache.field_get(image_id, field).await {
            Ok(raw) => raw?,
            Err(e) => {
                warn!(stage = %self.stage, %image_id, error = %e, "cache read failed, recomputing");
                return None;
            }
        };
        match StagePayload::from_json(&raw) {
            Ok(payload) if payload.stage() == self.stage => Some(payload),
            Ok(_) | Err(_) => {
                warn!(stage = %self.stage, %image_id, cache_field = field, "undecodable cache entry, recomputing");
                None
            }
        }
    }

    async fn write_back(&self, image_id: &ImageId, payload: &StagePayload) {
        let value = match payload.to_json() {
            Ok(value) => value,
            Err(e) => {
                warn!(stage = %self.stage, %image_id, error = %e, "could not serialize payload for cache");
                return;
            }
        };
        let cache = self.cache.as_ref();
        let field = self.stage.results_field();
        let written = retry_transient(&self.retry, "cache write", move || {
            let value = value.clone();
            async move { cache.field_set(image_id, field, value).await.map_err(PrismError::from) }
        })
        .await;
        if let Err(e) = written {
            warn!(stage = %self.stage, %image_id, error = %e, "cache write failed, continuing without cache");
        }
    }

    /// Analyze a job and forward the result to the sink.
    pub async fn process(&self, job: StageJob) -> Result<StorageAck, PrismError> {
        let result = self.analyze_hashed(job.image_id, &job.content_hash, &job.bytes).await;
        let request = StoreRequest {
            result,
            bytes: job.bytes,
        };
        let sink = self.sink.as_ref();
        retry_transient(&self.retry, "store result", move || sink.store_result(request.clone())).await
    }

    /// Start `config.workers` concurrent workers behind a bounded queue.
    ///
    /// `dispatch_timeout` bounds how long `StageHandle::dispatch` waits for
    /// queue space before reporting the stage as busy.
    pub fn spawn(self: Arc<Self>, config: &StageConfig, dispatch_timeout: Duration) -> (StageHandle, WorkerGroup) {
        let (tx, rx) = mpsc::channel(config.queue_capacity);
        let stage = self.stage;
        let group = WorkerGroup::spawn(stage.as_str(), rx, config.workers, move |job: StageJob| {
            let this = Arc::clone(&self);
            async move {
                let image_id = job.image_id;
                match this.process(job).await {
                    Ok(ack) => debug!(stage = %this.stage, %image_id, merge = ?ack.merge, "result stored"),
                    Err(e) => warn!(stage = %this.stage, %image_id, error = %e, "could not store result"),
                }
            }
        });
        let handle = StageHandle {
            stage,
            tx,
            dispatch_timeout,
        };
        (handle, group)
    }
}

/// In-process client for a spawned stage.
#[derive(Clone)]
pub struct StageHandle {
    stage: StageName,
    tx: mpsc::Sender<StageJob>,
    dispatch_timeout: Duration,
}

#[async_trait]
impl StageClient for StageHandle {
    fn stage(&self) -> StageName {
        self.stage
    }

    async fn dispatch(&self, job: StageJob) -> Result<(), PrismError> {
        match self.tx.send_timeout(job, self.dispatch_timeout).await {
            Ok(()) => Ok(()),
            Err(SendTimeoutError::Timeout(_)) => Err(PrismError::StageBusy(self.stage)),
            Err(SendTimeoutError::Closed(_)) => Err(PrismError::StageUnreachable(self.stage)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::testing::{FakeInference, RecordingSink};
    use crate::domain::{AgenderResult, FaceResult, Gender, OutcomeKind};
    use crate::impls::InMemoryCache;
    use ulid::Ulid;

    fn agender_payload() -> StagePayload {
        StagePayload::Agender(vec![AgenderResult::new(34, Gender::Male)])
    }

    fn face_payload() -> StagePayload {
        StagePayload::Face(vec![FaceResult {
            bbox: [1.0, 2.0, 3.0, 4.0],
            landmark_2d_106: vec![],
            landmark_3d_68: vec![],
            age: None,
            gender: None,
        }])
    }

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 2,
            base_delay: Duration::from_millis(1),
            multiplier: 1.0,
            max_delay: Duration::from_millis(1),
        }
    }

    fn stage_with(
        stage: StageName,
        engine: Arc<FakeInference>,
        cache: Arc<InMemoryCache>,
        timeout: Duration,
    ) -> (AnalysisStage, tokio::sync::mpsc::UnboundedReceiver<StoreRequest>) {
        let (sink, rx) = RecordingSink::new();
        let stage = AnalysisStage::new(stage, engine, cache, Arc::new(sink), timeout, fast_retry());
        (stage, rx)
    }

    fn id() -> ImageId {
        ImageId::from_ulid(Ulid::new())
    }

    #[tokio::test]
    async fn warm_cache_skips_inference() {
        let engine = Arc::new(FakeInference::answering(agender_payload()));
        let cache = Arc::new(InMemoryCache::new());
        let (stage, _rx) = stage_with(StageName::Agender, engine.clone(), cache.clone(), Duration::from_secs(1));
        let image_id = id();

        let first = stage.analyze(image_id, b"bytes").await;
        let second = stage.analyze(image_id, b"bytes").await;

        assert_eq!(engine.calls(), 1);
        assert_eq!(first.outcome, OutcomeKind::Success);
        assert_eq!(first, second);
        assert!(cache.field_exists(&image_id, "agender_results").await.unwrap());
    }

    #[tokio::test]
    async fn prepopulated_cache_is_used_as_is() {
        let engine = Arc::new(FakeInference::answering(face_payload()));
        let cache = Arc::new(InMemoryCache::new());
        let image_id = id();
        cache
            .field_set(&image_id, "face_results", StagePayload::Face(vec![]).to_json().unwrap())
            .await
            .unwrap();
        let (stage, _rx) = stage_with(StageName::Face, engine.clone(), cache, Duration::from_secs(1));

        let result = stage.analyze(image_id, b"bytes").await;

        assert_eq!(engine.calls(), 0);
        assert_eq!(result.outcome, OutcomeKind::Empty);
        assert_eq!(result.payload, Some(StagePayload::Face(vec![])));
    }

    #[tokio::test]
    async fn undecodable_cache_entry_is_a_miss() {
        let engine = Arc::new(FakeInference::answering(face_payload()));
        let cache = Arc::new(InMemoryCache::new());
        let image_id = id();
        cache.field_set(&image_id, "face_results", "not json".into()).await.unwrap();
        let (stage, _rx) = stage_with(StageName::Face, engine.clone(), cache.clone(), Duration::from_secs(1));

        let result = stage.analyze(image_id, b"bytes").await;

        assert_eq!(engine.calls(), 1);
        assert_eq!(result.outcome, OutcomeKind::Success);
        let cached = cache.field_get(&image_id, "face_results").await.unwrap().unwrap();
        assert_eq!(StagePayload::from_json(&cached).unwrap(), face_payload());
    }

    #[tokio::test]
    async fn empty_payload_is_cached_as_empty() {
        let engine = Arc::new(FakeInference::answering(StagePayload::Face(vec![])));
        let cache = Arc::new(InMemoryCache::new());
        let (stage, _rx) = stage_with(StageName::Face, engine.clone(), cache.clone(), Duration::from_secs(1));
        let image_id = id();

        let result = stage.analyze(image_id, b"bytes").await;

        assert_eq!(result.outcome, OutcomeKind::Empty);
        assert!(cache.field_exists(&image_id, "face_results").await.unwrap());
    }

    #[tokio::test]
    async fn inference_errors_are_not_cached() {
        let engine = Arc::new(FakeInference::failing("model crashed"));
        let cache = Arc::new(InMemoryCache::new());
        let (stage, _rx) = stage_with(StageName::Face, engine.clone(), cache.clone(), Duration::from_secs(1));
        let image_id = id();

        let first = stage.analyze(image_id, b"bytes").await;
        let _ = stage.analyze(image_id, b"bytes").await;

        assert_eq!(first.outcome, OutcomeKind::Error);
        let reason = first.reason.unwrap();
        assert!(reason.contains("model crashed"));
        assert!(reason.starts_with("analysis failed in stage face"));
        assert_eq!(engine.calls(), 2);
        assert!(!cache.field_exists(&image_id, "face_results").await.unwrap());
    }

    #[tokio::test]
    async fn inference_timeout_yields_missing() {
        let engine = Arc::new(FakeInference::slow(Duration::from_millis(500), face_payload()));
        let cache = Arc::new(InMemoryCache::new());
        let (stage, _rx) = stage_with(StageName::Face, engine, cache.clone(), Duration::from_millis(20));
        let image_id = id();

        let result = stage.analyze(image_id, b"bytes").await;

        assert_eq!(result.outcome, OutcomeKind::Missing);
        assert_eq!(result.reason.as_deref(), Some("inference timed out"));
        assert!(result.payload.is_none());
        assert!(!cache.field_exists(&image_id, "face_results").await.unwrap());
    }

    #[tokio::test]
    async fn offline_cache_only_costs_recomputation() {
        let engine = Arc::new(FakeInference::answering(agender_payload()));
        let cache = Arc::new(InMemoryCache::new());
        cache.set_offline(true);
        let (stage, _rx) = stage_with(StageName::Agender, engine.clone(), cache, Duration::from_secs(1));
        let image_id = id();

        let first = stage.analyze(image_id, b"bytes").await;
        let second = stage.analyze(image_id, b"bytes").await;

        assert_eq!(first.outcome, OutcomeKind::Success);
        assert_eq!(second.outcome, OutcomeKind::Success);
        assert_eq!(engine.calls(), 2);
    }

    #[tokio::test]
    async fn process_forwards_result_with_bytes() {
        let engine = Arc::new(FakeInference::answering(agender_payload()));
        let cache = Arc::new(InMemoryCache::new());
        let (stage, mut rx) = stage_with(StageName::Agender, engine, cache, Duration::from_secs(1));
        let bytes: Arc<[u8]> = Arc::from(&b"image bytes"[..]);
        let job = StageJob {
            image_id: id(),
            content_hash: ContentHash::of(&bytes),
            bytes: bytes.clone(),
        };

        let ack = stage.process(job.clone()).await.unwrap();
        let forwarded = rx.recv().await.unwrap();

        assert_eq!(ack.image_id, job.image_id);
        assert_eq!(forwarded.result.content_hash, job.content_hash);
        assert_eq!(forwarded.result.payload, Some(agender_payload()));
        assert_eq!(&forwarded.bytes[..], &bytes[..]);
    }

    #[tokio::test]
    async fn spawned_stage_processes_dispatched_jobs() {
        let engine = Arc::new(FakeInference::answering(face_payload()));
        let cache = Arc::new(InMemoryCache::new());
        let (stage, mut rx) = stage_with(StageName::Face, engine.clone(), cache, Duration::from_secs(1));
        let config = StageConfig {
            workers: 2,
            queue_capacity: 4,
            inference_timeout_ms: 1_000,
        };
        let (handle, group) = Arc::new(stage).spawn(&config, Duration::from_millis(100));
        assert_eq!(handle.stage(), StageName::Face);

        for _ in 0..3 {
            let bytes: Arc<[u8]> = Arc::from(&b"img"[..]);
            let job = StageJob {
                image_id: id(),
                content_hash: ContentHash::of(&bytes),
                bytes,
            };
            handle.dispatch(job).await.unwrap();
        }
        group.shutdown_and_join().await;

        let mut received = 0;
        while rx.try_recv().is_ok() {
            received += 1;
        }
        assert_eq!(received, 3);
        assert_eq!(engine.calls(), 3);
    }

    #[tokio::test]
    async fn stopped_stage_is_unreachable() {
        let engine = Arc::new(FakeInference::answering(face_payload()));
        let (stage, _rx) = stage_with(StageName::Face, engine, Arc::new(InMemoryCache::new()), Duration::from_secs(1));
        let (handle, group) = Arc::new(stage).spawn(&StageConfig::default(), Duration::from_millis(50));
        group.shutdown_and_join().await;

        let job = StageJob {
            image_id: id(),
            content_hash: ContentHash::of(b"x"),
            bytes: Arc::from(&b"x"[..]),
        };
        let err = handle.dispatch(job).await.unwrap_err();
        assert!(matches!(err, PrismError::StageUnreachable(StageName::Face)));
    }

    #[tokio::test]
    async fn saturated_stage_reports_busy() {
        let engine = Arc::new(FakeInference::slow(Duration::from_secs(30), face_payload()));
        let (stage, _rx) = stage_with(StageName::Face, engine, Arc::new(InMemoryCache::new()), Duration::from_secs(60));
        let config = StageConfig {
            workers: 1,
            queue_capacity: 1,
            inference_timeout_ms: 60_000,
        };
        let (handle, _group) = Arc::new(stage).spawn(&config, Duration::from_millis(20));

        let mut busy = None;
        for attempt in 0..8 {
            let job = StageJob {
                image_id: id(),
                content_hash: ContentHash::of(b"x"),
                bytes: Arc::from(&b"x"[..]),
            };
            if let Err(e) = handle.dispatch(job).await {
                busy = Some((attempt, e));
                break;
            }
        }

        // 1 件実行中 + 1 件 permit 待ち + 1 件キュー = 3 件で満杯
        let (attempt, err) = busy.expect("stage never reported busy");
        assert!(attempt <= 3);
        assert!(matches!(err, PrismError::StageBusy(StageName::Face)));
    }
}
