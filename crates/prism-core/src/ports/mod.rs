//! Ports - 抽象化レイヤー
//!
//! このモジュールは Hexagonal Architecture の「ポート」を定義します。
//! 各 trait は外部システム（Redis, MongoDB/GridFS, 推論サーバ, RPC）への
//! インターフェースを提供し、実装の詳細を隠蔽します。
//!
//! # 設計原則
//! - RecordStore が正本（source of truth）
//! - BlobStore は content hash 単位で 1 コピー
//! - ResultCache は再計算を避けるための per-image ハッシュ
//! - どの port も自前で同期を持つ（app 層は共有状態を直接持たない）

pub mod blob_store;
pub mod cache;
pub mod clock;
pub mod dispatch;
pub mod id_generator;
pub mod inference;
pub mod record_store;

// 主要な trait を再エクスポート
pub use self::blob_store::BlobStore;
pub use self::cache::ResultCache;
pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::dispatch::{MergeOutcome, ResultSink, StageClient, StageJob, StorageAck, StoreRequest};
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::inference::Inference;
pub use self::record_store::{CasOutcome, RecordStore};
