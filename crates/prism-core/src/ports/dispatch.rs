//! Dispatch ports - Router → Stage と Stage → Aggregator の境界
//!
//! 論理 RPC の `AnalyzeFace` / `AnalyzeAgender` は `StageClient::dispatch`、
//! `StoreResult` は `ResultSink::store_result` に対応します。
//! in-process 実装は channel、リモート実装は gRPC などに差し替え可能です。

use std::sync::Arc;

use async_trait::async_trait;

use crate::domain::{AnalysisResult, ContentHash, ImageId, PrismError, StageName};

/// One image handed to a stage.
#[derive(Debug, Clone)]
pub struct StageJob {
    pub image_id: ImageId,
    pub content_hash: ContentHash,
    pub bytes: Arc<[u8]>,
}

/// StageClient は 1 つの Analysis Stage への配送口
///
/// dispatch は「受け付けた」ことだけを保証し、解析完了は待たない。
#[async_trait]
pub trait StageClient: Send + Sync {
    fn stage(&self) -> StageName;

    async fn dispatch(&self, job: StageJob) -> Result<(), PrismError>;
}

/// A stage result plus the bytes the aggregator needs for dedup.
#[derive(Debug, Clone)]
pub struct StoreRequest {
    pub result: AnalysisResult,
    pub bytes: Arc<[u8]>,
}

/// How a merge changed the aggregate record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    /// The field was empty and is now set.
    Inserted,
    /// The field held an equal value (or a higher-ranked one); nothing changed.
    Unchanged,
    /// A lower-ranked outcome (missing / error) was upgraded.
    Upgraded,
    /// A divergent value was replaced under the overwrite policy.
    Overwritten,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageAck {
    pub image_id: ImageId,
    pub stage: StageName,
    pub content_hash: ContentHash,
    /// This request performed the blob write (first time these bytes were seen).
    pub blob_written: bool,
    pub merge: MergeOutcome,
}

/// ResultSink は stage の結果を受け取る Aggregator 側の口
#[async_trait]
pub trait ResultSink: Send + Sync {
    async fn store_result(&self, request: StoreRequest) -> Result<StorageAck, PrismError>;
}
