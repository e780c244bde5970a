//! Test doubles shared by the app-layer tests.

use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::domain::{InferenceError, PrismError, StageName, StagePayload};
use crate::ports::{Inference, MergeOutcome, ResultSink, StageClient, StageJob, StorageAck, StoreRequest};

pub(crate) enum Behavior {
    Answer(StagePayload),
    Fail(String),
    /// Sleep this long, then answer.
    Slow(Duration, StagePayload),
}

/// Inference engine with a fixed answer that counts its calls.
pub(crate) struct FakeInference {
    behavior: Behavior,
    calls: AtomicUsize,
}

impl FakeInference {
    pub fn answering(payload: StagePayload) -> Self {
        Self::new(Behavior::Answer(payload))
    }

    pub fn failing(reason: &str) -> Self {
        Self::new(Behavior::Fail(reason.to_string()))
    }

    pub fn slow(delay: Duration, payload: StagePayload) -> Self {
        Self::new(Behavior::Slow(delay, payload))
    }

    fn new(behavior: Behavior) -> Self {
        Self {
            behavior,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Inference for FakeInference {
    async fn analyze(&self, _image: &[u8]) -> Result<StagePayload, InferenceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match &self.behavior {
            Behavior::Answer(payload) => Ok(payload.clone()),
            Behavior::Fail(reason) => Err(InferenceError::Failed(reason.clone())),
            Behavior::Slow(delay, payload) => {
                tokio::time::sleep(*delay).await;
                Ok(payload.clone())
            }
        }
    }
}

/// Sink that records every request and acknowledges it as inserted.
pub(crate) struct RecordingSink {
    tx: mpsc::UnboundedSender<StoreRequest>,
}

impl RecordingSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<StoreRequest>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl ResultSink for RecordingSink {
    async fn store_result(&self, request: StoreRequest) -> Result<StorageAck, PrismError> {
        let ack = StorageAck {
            image_id: request.result.image_id,
            stage: request.result.stage,
            content_hash: request.result.content_hash.clone(),
            blob_written: true,
            merge: MergeOutcome::Inserted,
        };
        let _ = self.tx.send(request);
        Ok(ack)
    }
}

enum Reachability {
    Up,
    Down,
    Stuck,
}

/// Stage client that records jobs, fails every dispatch when `down`, or
/// never answers when `stuck`.
pub(crate) struct FakeStageClient {
    stage: StageName,
    reachability: Reachability,
    jobs: Mutex<Vec<StageJob>>,
}

impl FakeStageClient {
    pub fn up(stage: StageName) -> Self {
        Self::new(stage, Reachability::Up)
    }

    pub fn down(stage: StageName) -> Self {
        Self::new(stage, Reachability::Down)
    }

    pub fn stuck(stage: StageName) -> Self {
        Self::new(stage, Reachability::Stuck)
    }

    fn new(stage: StageName, reachability: Reachability) -> Self {
        Self {
            stage,
            reachability,
            jobs: Mutex::new(Vec::new()),
        }
    }

    pub fn jobs(&self) -> Vec<StageJob> {
        self.jobs.lock().unwrap().clone()
    }
}

#[async_trait]
impl StageClient for FakeStageClient {
    fn stage(&self) -> StageName {
        self.stage
    }

    async fn dispatch(&self, job: StageJob) -> Result<(), PrismError> {
        match self.reachability {
            Reachability::Up => {
                self.jobs.lock().unwrap().push(job);
                Ok(())
            }
            Reachability::Down => Err(PrismError::StageUnreachable(self.stage)),
            Reachability::Stuck => std::future::pending().await,
        }
    }
}
