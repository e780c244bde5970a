//! BlobStore port - content-addressable な画像 bytes の保存先（GridFS/S3/Local）
//!
//! key は ContentHash。同じ bytes は何度保存しても 1 コピーだけ残ります。

use std::sync::Arc;

use async_trait::async_trait;

use crate::domain::{BlobMeta, ContentHash, StoreError};

/// BlobStore は bytes + メタ情報を hash 単位で保存
///
/// # 設計原則
/// - `put_if_absent` は「存在確認 → 書き込み」を 1 操作で行う
///   （2 つの呼び出し元が同時に来ても書き込みは 1 回）
/// - bytes とメタ情報は同時に見える（片方だけ見える瞬間はない）
/// - 削除はこのスコープでは扱わない
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Store `bytes` under `hash` unless already present.
    ///
    /// Returns `true` when this call performed the write.
    async fn put_if_absent(
        &self,
        hash: &ContentHash,
        bytes: Arc<[u8]>,
        meta: BlobMeta,
    ) -> Result<bool, StoreError>;

    async fn exists(&self, hash: &ContentHash) -> Result<bool, StoreError>;

    async fn get(&self, hash: &ContentHash) -> Result<Option<Arc<[u8]>>, StoreError>;

    async fn meta(&self, hash: &ContentHash) -> Result<Option<BlobMeta>, StoreError>;
}
