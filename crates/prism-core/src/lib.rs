//! prism-core
//!
//! Core building blocks for the Prism image analysis pipeline: images are
//! admitted by a router, fanned out to independent analysis stages (face,
//! age/gender), and their results merged into one record per image, with
//! identical bytes stored once.
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ids, image, analysis, record, errors）
//! - **ports**: 抽象化レイヤー（ResultCache, BlobStore, RecordStore, Inference, StageClient, ResultSink, Clock, IdGenerator）
//! - **app**: アプリケーションロジック（router, stage, aggregator, status, builder, retry）
//! - **impls**: 実装（InMemoryCache など開発・テスト用）
//! - **config**: PipelineConfig（TOML）
//! - **worker**: bounded channel + 並行数制限つきの WorkerGroup

pub mod app;
pub mod config;
pub mod domain;
pub mod impls;
pub mod ports;
pub mod worker;

pub use crate::app::{Pipeline, PipelineBuilder};
pub use crate::config::PipelineConfig;
pub use crate::domain::{ImageId, PrismError, StageName};
