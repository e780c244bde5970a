//! Impls - 実装（開発用・テスト用）
//!
//! このモジュールには ports の in-memory 実装を含めます。
//!
//! # 含まれる実装
//! - **InMemoryCache**: Redis hash 相当の ResultCache（TTL 付き）
//! - **InMemoryBlobStore**: GridFS 相当の content-addressed BlobStore
//! - **InMemoryRecordStore**: field 単位 CAS を持つ RecordStore
//!
//! # 本番用実装
//! 本番用の実装は別クレートに配置する想定です（Redis / MongoDB + GridFS など）。

pub mod inmem_blob;
pub mod inmem_cache;
pub mod inmem_records;

// 主要な型を再エクスポート
pub use self::inmem_blob::InMemoryBlobStore;
pub use self::inmem_cache::InMemoryCache;
pub use self::inmem_records::InMemoryRecordStore;
