//! App - アプリケーション層
//!
//! このモジュールは、ports を組み合わせてパイプラインを実装します。
//!
//! # 主要コンポーネント
//! - **RequestRouter / Dispatcher**: 受付と stage への fan-out
//! - **AnalysisStage**: cache 付きの解析ステージ（face / agender）
//! - **Aggregator**: blob の重複排除と field 単位のマージ
//! - **StatusQuery**: 画像ごとの処理状況
//! - **PipelineBuilder**: ワイヤリングと起動時検証

pub mod aggregator;
pub mod builder;
pub mod retry;
pub mod router;
pub mod stage;
pub mod status;

#[cfg(test)]
pub(crate) mod testing;

// 主要な型を再エクスポート
pub use self::aggregator::{Aggregator, AggregatorHandle, BlobReceipt};
pub use self::builder::{BuildError, Pipeline, PipelineBuilder};
pub use self::retry::{RetryPolicy, retry_transient};
pub use self::router::{Dispatcher, DispatcherGroup, RequestRouter, SubmissionAck};
pub use self::stage::{AnalysisStage, StageHandle};
pub use self::status::{ImageStatus, StatusQuery, StatusSource};
