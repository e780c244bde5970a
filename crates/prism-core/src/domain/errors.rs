//! Errors - エラー型と分類
//!
//! Ports return their own narrow error types (`StoreError`, `CacheError`,
//! `InferenceError`); the app layer lifts them into `PrismError`, whose
//! `ErrorKind` decides what happens next (reject, retry, record, resolve).

use thiserror::Error;

use super::analysis::StageName;
use super::ids::{ImageId, ParseIdError};
use super::image::ContentHash;

/// ErrorKind は実行エラーの分類
///
/// - Validation: 入力不正（リトライ無意味、即座に呼び出し元へ）
/// - Overloaded: 受付キュー満杯（呼び出し元が後で再送）
/// - Transient: store/cache/stage の一時障害（発行元でバックオフ付きリトライ）
/// - Analysis: 推論失敗（障害ではなく結果として記録）
/// - Conflict: 同一 image+stage の不一致（ポリシーで解決）
/// - NotFound: 前提となる blob が存在しない
/// - Permanent: シャットダウン中など
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    Overloaded,
    Transient,
    Analysis,
    Conflict,
    NotFound,
    Permanent,
}

#[derive(Debug, Error)]
pub enum PrismError {
    #[error("invalid image format: {0}")]
    InvalidFormat(String),

    #[error("payload of {size} bytes exceeds limit of {max} bytes")]
    PayloadTooLarge { size: usize, max: usize },

    #[error("empty image payload")]
    EmptyPayload,

    #[error(transparent)]
    InvalidId(#[from] ParseIdError),

    #[error("content hash {claimed} does not match the submitted bytes ({actual})")]
    HashMismatch {
        claimed: ContentHash,
        actual: ContentHash,
    },

    #[error("admission queue is full")]
    Overloaded,

    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("cache unavailable: {0}")]
    CacheUnavailable(String),

    #[error("stage {0} is busy")]
    StageBusy(StageName),

    #[error("stage {0} is unreachable")]
    StageUnreachable(StageName),

    #[error("{operation} timed out")]
    Timeout { operation: &'static str },

    #[error("analysis failed in stage {stage}: {reason}")]
    Analysis { stage: StageName, reason: String },

    #[error("conflicting {stage} result for {image_id}: {detail}")]
    Conflict {
        image_id: ImageId,
        stage: StageName,
        detail: String,
    },

    #[error("no blob stored for content hash {0}")]
    BlobNotFound(ContentHash),

    #[error("pipeline is shutting down")]
    ShuttingDown,

    #[error("internal error: {0}")]
    Internal(String),
}

impl PrismError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidFormat(_)
            | Self::PayloadTooLarge { .. }
            | Self::EmptyPayload
            | Self::InvalidId(_)
            | Self::HashMismatch { .. } => ErrorKind::Validation,
            Self::Overloaded => ErrorKind::Overloaded,
            Self::StoreUnavailable(_)
            | Self::CacheUnavailable(_)
            | Self::StageBusy(_)
            | Self::StageUnreachable(_)
            | Self::Timeout { .. } => ErrorKind::Transient,
            Self::Analysis { .. } => ErrorKind::Analysis,
            Self::Conflict { .. } => ErrorKind::Conflict,
            Self::BlobNotFound(_) => ErrorKind::NotFound,
            Self::ShuttingDown | Self::Internal(_) => ErrorKind::Permanent,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }
}

/// Errors raised by blob and record store backends.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("store backend unavailable: {0}")]
    Unavailable(String),

    #[error("store backend error: {0}")]
    Backend(String),
}

impl From<StoreError> for PrismError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Unavailable(msg) => PrismError::StoreUnavailable(msg),
            StoreError::Backend(msg) => PrismError::Internal(msg),
        }
    }
}

/// Errors raised by cache backends.
#[derive(Debug, Clone, Error)]
pub enum CacheError {
    #[error("cache backend unavailable: {0}")]
    Unavailable(String),
}

impl From<CacheError> for PrismError {
    fn from(e: CacheError) -> Self {
        match e {
            CacheError::Unavailable(msg) => PrismError::CacheUnavailable(msg),
        }
    }
}

/// Errors raised by an inference engine.
#[derive(Debug, Clone, Error)]
pub enum InferenceError {
    /// The engine could not decode the image.
    #[error("could not decode image: {0}")]
    Decode(String),

    /// The model ran but failed.
    #[error("inference failed: {0}")]
    Failed(String),
}
