//! RequestRouter - 受付（admission）と fan-out
//!
//! # フロー
//! 1. submit(): サイズ・形式を検証し ImageId を割り当て、bounded queue に try_send
//!    （満杯なら即 Overloaded。待たない）
//! 2. Dispatcher: queue から取り出し、stage ごとの lane に積む
//!    （lane ごとに worker と上限を持つので、詰まった stage は自分の lane しか止めない）
//! 3. lane が満杯 / dispatch に失敗した stage については MISSING を Aggregator へ送る
//!
//! Ack は「受け付けた」ことだけを意味する。解析結果は StatusQuery で確認する。

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, info, warn};

use crate::app::retry::{RetryPolicy, retry_transient};
use crate::config::RouterConfig;
use crate::domain::{
    AnalysisResult, ContentHash, ImageFormat, ImageId, ImageSubmission, PrismError, StageName,
};
use crate::ports::{Clock, IdGenerator, ResultSink, StageClient, StageJob, StoreRequest};
use crate::worker::WorkerGroup;

/// Admission receipt returned to the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubmissionAck {
    pub image_id: ImageId,
    pub content_hash: ContentHash,
    pub format: ImageFormat,
    /// Stages the image will be fanned out to.
    pub stages: Vec<StageName>,
    pub accepted_at: DateTime<Utc>,
}

pub struct RequestRouter {
    tx: mpsc::Sender<ImageSubmission>,
    ids: Arc<dyn IdGenerator>,
    clock: Arc<dyn Clock>,
    stages: Vec<StageName>,
    max_payload_bytes: usize,
}

impl RequestRouter {
    pub fn new(
        tx: mpsc::Sender<ImageSubmission>,
        ids: Arc<dyn IdGenerator>,
        clock: Arc<dyn Clock>,
        stages: Vec<StageName>,
        max_payload_bytes: usize,
    ) -> Self {
        Self {
            tx,
            ids,
            clock,
            stages,
            max_payload_bytes,
        }
    }

    /// Admit an image under a freshly generated id.
    pub fn submit(&self, bytes: impl Into<Arc<[u8]>>) -> Result<SubmissionAck, PrismError> {
        self.submit_as(self.ids.generate_image_id(), bytes)
    }

    /// Admit an image under a caller-chosen id.
    ///
    /// Returns without waiting: a full queue is reported as `Overloaded`.
    pub fn submit_as(&self, image_id: ImageId, bytes: impl Into<Arc<[u8]>>) -> Result<SubmissionAck, PrismError> {
        let bytes: Arc<[u8]> = bytes.into();
        if bytes.is_empty() {
            return Err(PrismError::EmptyPayload);
        }
        if bytes.len() > self.max_payload_bytes {
            return Err(PrismError::PayloadTooLarge {
                size: bytes.len(),
                max: self.max_payload_bytes,
            });
        }
        let format = ImageFormat::detect(&bytes).ok_or_else(|| {
            PrismError::InvalidFormat(format!("unrecognized image header ({} bytes)", bytes.len()))
        })?;

        let submission = ImageSubmission::new(image_id, bytes, format, self.clock.now());
        let ack = SubmissionAck {
            image_id,
            content_hash: submission.content_hash.clone(),
            format,
            stages: self.stages.clone(),
            accepted_at: submission.submitted_at,
        };
        let size = submission.bytes.len();

        match self.tx.try_send(submission) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                warn!(%image_id, "admission queue full, rejecting");
                return Err(PrismError::Overloaded);
            }
            Err(TrySendError::Closed(_)) => return Err(PrismError::ShuttingDown),
        }

        info!(%image_id, hash = ack.content_hash.short(), %format, size, "image admitted");
        Ok(ack)
    }
}

/// Pops admitted submissions and forwards each one into every stage's lane.
///
/// Each stage has its own bounded lane and its own hand-off workers, so a
/// stage that stops taking jobs only backs up its own lane.
pub struct Dispatcher {
    lanes: Vec<Lane>,
}

struct Lane {
    stage: StageName,
    tx: mpsc::Sender<ImageSubmission>,
    handoff: Arc<Handoff>,
}

/// Hands one stage its jobs and records MISSING when it will not take one.
struct Handoff {
    client: Arc<dyn StageClient>,
    sink: Arc<dyn ResultSink>,
    dispatch_timeout: Duration,
    retry: RetryPolicy,
}

/// A running dispatcher: the intake loop plus one hand-off group per stage.
pub struct DispatcherGroup {
    intake: WorkerGroup,
    lanes: Vec<WorkerGroup>,
}

impl DispatcherGroup {
    /// Drain the intake into the lanes, then drain every lane.
    pub async fn shutdown_and_join(self) {
        self.intake.shutdown_and_join().await;
        for lane in self.lanes {
            lane.shutdown_and_join().await;
        }
    }
}

impl Dispatcher {
    /// Start one lane per stage and the intake loop over `rx`.
    pub fn spawn(
        stages: Vec<Arc<dyn StageClient>>,
        sink: Arc<dyn ResultSink>,
        config: &RouterConfig,
        retry: RetryPolicy,
        rx: mpsc::Receiver<ImageSubmission>,
    ) -> DispatcherGroup {
        let mut lanes = Vec::with_capacity(stages.len());
        let mut lane_groups = Vec::with_capacity(stages.len());
        for client in stages {
            let stage = client.stage();
            let handoff = Arc::new(Handoff {
                client,
                sink: Arc::clone(&sink),
                dispatch_timeout: config.dispatch_timeout(),
                retry: retry.clone(),
            });
            let (tx, lane_rx) = mpsc::channel(config.lane_capacity);
            let worker = Arc::clone(&handoff);
            lane_groups.push(WorkerGroup::spawn(
                lane_name(stage),
                lane_rx,
                config.max_inflight_dispatches,
                move |submission: ImageSubmission| {
                    let worker = Arc::clone(&worker);
                    async move { worker.run(submission).await }
                },
            ));
            lanes.push(Lane { stage, tx, handoff });
        }

        let this = Arc::new(Self { lanes });
        let intake = WorkerGroup::spawn("dispatcher", rx, config.max_inflight_dispatches, move |submission: ImageSubmission| {
            let this = Arc::clone(&this);
            async move { this.dispatch(submission).await }
        });
        DispatcherGroup {
            intake,
            lanes: lane_groups,
        }
    }

    /// Queue one submission on every lane without waiting for any stage.
    async fn dispatch(&self, submission: ImageSubmission) {
        for lane in &self.lanes {
            let reason = match lane.tx.try_send(submission.clone()) {
                Ok(()) => continue,
                Err(TrySendError::Full(_)) => PrismError::StageBusy(lane.stage),
                Err(TrySendError::Closed(_)) => PrismError::StageUnreachable(lane.stage),
            };
            warn!(image_id = %submission.image_id, stage = %lane.stage, reason = %reason, "dispatch lane refused the job");
            lane.handoff.record_missing(submission.clone(), reason.to_string()).await;
        }
    }
}

fn lane_name(stage: StageName) -> &'static str {
    match stage {
        StageName::Face => "dispatch-face",
        StageName::Agender => "dispatch-agender",
    }
}

impl Handoff {
    async fn run(&self, submission: ImageSubmission) {
        let stage = self.client.stage();
        let image_id = submission.image_id;
        let job = StageJob {
            image_id,
            content_hash: submission.content_hash.clone(),
            bytes: Arc::clone(&submission.bytes),
        };
        let reason = match tokio::time::timeout(self.dispatch_timeout, self.client.dispatch(job)).await {
            Ok(Ok(())) => {
                debug!(%image_id, %stage, "dispatched");
                return;
            }
            Ok(Err(e)) => e.to_string(),
            Err(_) => PrismError::Timeout { operation: "dispatch" }.to_string(),
        };
        warn!(%image_id, %stage, reason = %reason, "stage did not take the job");
        self.record_missing(submission, reason).await;
    }

    async fn record_missing(&self, submission: ImageSubmission, reason: String) {
        let stage = self.client.stage();
        let image_id = submission.image_id;
        let request = StoreRequest {
            result: AnalysisResult::missing(image_id, submission.content_hash, stage, reason),
            bytes: submission.bytes,
        };
        let sink = self.sink.as_ref();
        let stored = retry_transient(&self.retry, "store missing", move || sink.store_result(request.clone())).await;
        if let Err(e) = stored {
            warn!(%image_id, %stage, error = %e, "could not record MISSING result");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::testing::{FakeStageClient, RecordingSink};
    use crate::domain::OutcomeKind;
    use crate::domain::image::fixtures::{jpeg, png};
    use crate::ports::{FixedClock, UlidGenerator};
    use rstest::rstest;
    use ulid::Ulid;

    fn router(capacity: usize, max_payload_bytes: usize) -> (RequestRouter, mpsc::Receiver<ImageSubmission>) {
        let (tx, rx) = mpsc::channel(capacity);
        let clock = Arc::new(FixedClock::new(Utc::now()));
        let ids = Arc::new(UlidGenerator::new(clock.clone()));
        let router = RequestRouter::new(tx, ids, clock, StageName::ALL.to_vec(), max_payload_bytes);
        (router, rx)
    }

    #[test]
    fn admitted_image_is_queued_with_its_hash() {
        let (router, mut rx) = router(4, 1024);
        let bytes = png(b"pixels");

        let ack = router.submit(bytes.clone()).unwrap();
        let queued = rx.try_recv().unwrap();

        assert_eq!(ack.format, ImageFormat::Png);
        assert_eq!(ack.stages, vec![StageName::Face, StageName::Agender]);
        assert_eq!(ack.content_hash, ContentHash::of(&bytes));
        assert_eq!(queued.image_id, ack.image_id);
        assert_eq!(&queued.bytes[..], &bytes[..]);
    }

    #[test]
    fn submit_as_keeps_the_callers_id() {
        let (router, _rx) = router(4, 1024);
        let image_id = ImageId::from_ulid(Ulid::new());

        let ack = router.submit_as(image_id, jpeg(b"x")).unwrap();

        assert_eq!(ack.image_id, image_id);
        assert_eq!(ack.format, ImageFormat::Jpeg);
    }

    #[rstest]
    #[case::text(b"hello world".to_vec())]
    #[case::truncated_png(vec![0x89, b'P', b'N'])]
    fn unrecognized_bytes_are_invalid_format(#[case] bytes: Vec<u8>) {
        let (router, mut rx) = router(4, 1024);
        let err = router.submit(bytes).unwrap_err();
        assert!(matches!(err, PrismError::InvalidFormat(_)));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn empty_payload_is_rejected() {
        let (router, _rx) = router(4, 1024);
        assert!(matches!(router.submit(Vec::new()), Err(PrismError::EmptyPayload)));
    }

    #[test]
    fn oversized_payload_is_rejected() {
        let (router, _rx) = router(4, 16);
        let err = router.submit(png(&[0u8; 64])).unwrap_err();
        assert!(matches!(err, PrismError::PayloadTooLarge { size: 72, max: 16 }));
    }

    #[test]
    fn full_queue_reports_overloaded_immediately() {
        let (router, _rx) = router(2, 1024);
        router.submit(png(b"1")).unwrap();
        router.submit(png(b"2")).unwrap();

        let started = std::time::Instant::now();
        let err = router.submit(png(b"3")).unwrap_err();

        assert!(matches!(err, PrismError::Overloaded));
        assert!(started.elapsed() < Duration::from_millis(100));
    }

    #[test]
    fn closed_queue_reports_shutting_down() {
        let (router, rx) = router(2, 1024);
        drop(rx);
        assert!(matches!(router.submit(png(b"1")), Err(PrismError::ShuttingDown)));
    }

    fn spawn_dispatcher(
        stages: Vec<Arc<dyn StageClient>>,
        config: RouterConfig,
    ) -> (RequestRouter, DispatcherGroup, mpsc::UnboundedReceiver<StoreRequest>) {
        let (sink, stored) = RecordingSink::new();
        let (router, rx) = router(64, 1024);
        let group = Dispatcher::spawn(stages, Arc::new(sink), &config, RetryPolicy::none(), rx);
        (router, group, stored)
    }

    fn drain(stored: &mut mpsc::UnboundedReceiver<StoreRequest>) -> Vec<StoreRequest> {
        std::iter::from_fn(|| stored.try_recv().ok()).collect()
    }

    #[tokio::test]
    async fn dispatch_reaches_every_stage() {
        let face = Arc::new(FakeStageClient::up(StageName::Face));
        let agender = Arc::new(FakeStageClient::up(StageName::Agender));
        let (router, group, mut stored) = spawn_dispatcher(
            vec![face.clone() as Arc<dyn StageClient>, agender.clone() as Arc<dyn StageClient>],
            RouterConfig::default(),
        );

        let ack = router.submit(png(b"img")).unwrap();
        group.shutdown_and_join().await;

        assert_eq!(face.jobs().len(), 1);
        assert_eq!(agender.jobs().len(), 1);
        assert_eq!(face.jobs()[0].content_hash, ack.content_hash);
        assert!(drain(&mut stored).is_empty());
    }

    #[tokio::test]
    async fn unreachable_stage_does_not_block_the_other() {
        let face = Arc::new(FakeStageClient::down(StageName::Face));
        let agender = Arc::new(FakeStageClient::up(StageName::Agender));
        let (router, group, mut stored) = spawn_dispatcher(
            vec![face.clone() as Arc<dyn StageClient>, agender.clone() as Arc<dyn StageClient>],
            RouterConfig::default(),
        );
        let bytes = png(b"img");

        let ack = router.submit(bytes.clone()).unwrap();
        group.shutdown_and_join().await;

        assert_eq!(agender.jobs().len(), 1);
        let missing = drain(&mut stored);
        assert_eq!(missing.len(), 1);
        assert_eq!(missing[0].result.stage, StageName::Face);
        assert_eq!(missing[0].result.outcome, OutcomeKind::Missing);
        assert_eq!(missing[0].result.image_id, ack.image_id);
        assert_eq!(&missing[0].bytes[..], &bytes[..]);
    }

    #[tokio::test]
    async fn stuck_stage_does_not_hold_back_the_other() {
        let face = Arc::new(FakeStageClient::stuck(StageName::Face));
        let agender = Arc::new(FakeStageClient::up(StageName::Agender));
        let config = RouterConfig {
            max_inflight_dispatches: 4,
            dispatch_timeout_ms: 300,
            ..RouterConfig::default()
        };
        let (router, group, mut stored) = spawn_dispatcher(
            vec![face.clone() as Arc<dyn StageClient>, agender.clone() as Arc<dyn StageClient>],
            config,
        );

        for i in 0..20u8 {
            router.submit(png(&[i])).unwrap();
        }
        // well inside one dispatch timeout of the stuck stage
        let deadline = std::time::Instant::now() + Duration::from_millis(150);
        while agender.jobs().len() < 20 && std::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(agender.jobs().len(), 20);

        group.shutdown_and_join().await;
        let missing = drain(&mut stored);
        assert_eq!(missing.len(), 20);
        assert!(missing.iter().all(|r| r.result.stage == StageName::Face));
        assert!(missing.iter().all(|r| r.result.outcome == OutcomeKind::Missing));
    }

    #[tokio::test]
    async fn full_lane_records_missing_without_waiting() {
        let face = Arc::new(FakeStageClient::stuck(StageName::Face));
        let config = RouterConfig {
            max_inflight_dispatches: 1,
            lane_capacity: 1,
            dispatch_timeout_ms: 300,
            ..RouterConfig::default()
        };
        let (router, group, mut stored) = spawn_dispatcher(vec![face.clone() as Arc<dyn StageClient>], config);

        for i in 0..5u8 {
            router.submit(png(&[i])).unwrap();
        }
        tokio::time::sleep(Duration::from_millis(100)).await;

        let busy = drain(&mut stored);
        assert!(!busy.is_empty());
        assert!(busy.iter().all(|r| r.result.reason.as_deref().is_some_and(|m| m.contains("busy"))));

        group.shutdown_and_join().await;
        assert_eq!(busy.len() + drain(&mut stored).len(), 5);
    }

    #[tokio::test]
    async fn spawned_dispatcher_drains_on_shutdown() {
        let face = Arc::new(FakeStageClient::up(StageName::Face));
        let (router, group, _stored) = spawn_dispatcher(
            vec![face.clone() as Arc<dyn StageClient>],
            RouterConfig {
                max_inflight_dispatches: 2,
                ..RouterConfig::default()
            },
        );

        for i in 0..5u8 {
            router.submit(png(&[i])).unwrap();
        }
        group.shutdown_and_join().await;

        assert_eq!(face.jobs().len(), 5);
        assert!(matches!(router.submit(png(b"late")), Err(PrismError::ShuttingDown)));
    }
}
