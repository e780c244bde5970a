//! ResultCache port - 画像ごとの multi-field ハッシュ（Redis HSET 相当）
//!
//! key は ImageId、field は `face_results` / `agender_status` などの名前です。

use std::collections::HashMap;

use async_trait::async_trait;

use crate::domain::{CacheError, ImageId};

/// ResultCache は per-image の multi-field ストア
///
/// # 設計原則
/// - field_exists / field_get / field_set はそれぞれ atomic
/// - 同じ key の別 field とは独立（field 間ロックなし）
/// - key をまたぐグローバルロックなし
/// - 同じ field への並行書き込みは last-write-wins で構わない
///   （値は入力 bytes の純関数なので、どちらが勝っても同じ値）
#[async_trait]
pub trait ResultCache: Send + Sync {
    async fn field_exists(&self, key: &ImageId, field: &str) -> Result<bool, CacheError>;

    async fn field_get(&self, key: &ImageId, field: &str) -> Result<Option<String>, CacheError>;

    async fn field_set(&self, key: &ImageId, field: &str, value: String) -> Result<(), CacheError>;

    /// Snapshot of every live field for `key` (empty when absent or expired).
    async fn fields(&self, key: &ImageId) -> Result<HashMap<String, String>, CacheError>;
}
