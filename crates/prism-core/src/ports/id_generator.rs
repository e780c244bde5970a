//! IdGenerator port - ID 生成の抽象化
//!
//! Router が受け付けた画像に ImageId を振るためのインターフェースです。
//!
//! # 実装
//! - **UlidGenerator**: ULID ベース（本番用）

use crate::domain::ids::ImageId;
use crate::ports::Clock;
use ulid::Ulid;

/// IdGenerator は分散環境で衝突しない ID を生成
///
/// # Thread Safety
/// - `Send + Sync` を要求（Router は複数タスクから submit される）
pub trait IdGenerator: Send + Sync {
    fn generate_image_id(&self) -> ImageId;
}

/// UlidGenerator は Clock の時刻を timestamp 部分に使う ULID 生成器
pub struct UlidGenerator<C> {
    clock: C,
}

impl<C: Clock> UlidGenerator<C> {
    pub fn new(clock: C) -> Self {
        Self { clock }
    }
}

impl<C: Clock> IdGenerator for UlidGenerator<C> {
    fn generate_image_id(&self) -> ImageId {
        let timestamp_ms = self.clock.now().timestamp_millis() as u64;
        let ulid = Ulid::from_parts(timestamp_ms, rand::random());
        ImageId::from(ulid)
    }
}
