//! Inference port - 顔検出 / 年齢・性別推定エンジンの境界
//!
//! アルゴリズム本体は外部コラボレータです。同じ bytes には同じ結果を返す
//! （決定的）ことだけを前提にしています。

use async_trait::async_trait;

use crate::domain::{InferenceError, StagePayload};

#[async_trait]
pub trait Inference: Send + Sync {
    /// Analyze one encoded image. An empty payload is a valid result.
    async fn analyze(&self, image: &[u8]) -> Result<StagePayload, InferenceError>;
}
