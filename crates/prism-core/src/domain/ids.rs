//! Domain identifiers (strongly-typed IDs).
//!
//! # ULID ベースの ID
//! ImageId は ULID を使います。生成順にソートでき、ノード間の調整なしに
//! 発行できるため、Router を複数台並べても衝突しません。
//!
//! ## Phantom Type パターン
//! `Id<T>` が共通実装を持ち、`T` はコンパイル時だけ使うマーカー型です。
//! 将来 ID の種類が増えても混同はコンパイルエラーになります。

use serde::{Deserialize, Serialize};
use std::fmt;
use std::marker::PhantomData;
use std::str::FromStr;
use ulid::Ulid;

/// IdMarker は各 ID 型のマーカー trait
///
/// Display / FromStr で使うプレフィックス（"img-" など）を提供します。
pub trait IdMarker: Send + Sync + 'static {
    fn prefix() -> &'static str;
}

/// ジェネリック ID 型
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Id<T: IdMarker> {
    ulid: Ulid,
    #[serde(skip)]
    _marker: PhantomData<T>,
}

impl<T: IdMarker> Id<T> {
    pub fn from_ulid(ulid: Ulid) -> Self {
        Self {
            ulid,
            _marker: PhantomData,
        }
    }

    pub fn as_ulid(&self) -> Ulid {
        self.ulid
    }
}

impl<T: IdMarker> From<Ulid> for Id<T> {
    fn from(ulid: Ulid) -> Self {
        Self::from_ulid(ulid)
    }
}

impl<T: IdMarker> fmt::Display for Id<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", T::prefix(), self.ulid)
    }
}

/// Error returned when a string is not a valid `<prefix><ULID>` identifier.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid identifier '{value}': expected '{prefix}<ULID>'")]
pub struct ParseIdError {
    pub value: String,
    pub prefix: &'static str,
}

impl<T: IdMarker> FromStr for Id<T> {
    type Err = ParseIdError;

    /// Accepts both the prefixed form (`img-01H...`) and a bare ULID.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = s.strip_prefix(T::prefix()).unwrap_or(s);
        Ulid::from_string(raw)
            .map(Self::from_ulid)
            .map_err(|_| ParseIdError {
                value: s.to_string(),
                prefix: T::prefix(),
            })
    }
}

// ========================================
// マーカー型の定義
// ========================================

/// Image のマーカー型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Image {}

impl IdMarker for Image {
    fn prefix() -> &'static str {
        "img-"
    }
}

/// Identifier of a submitted image (the unit every stage and record is keyed by).
pub type ImageId = Id<Image>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn image_id_display_has_prefix() {
        let ulid = Ulid::new();
        let id = ImageId::from_ulid(ulid);
        assert_eq!(id.as_ulid(), ulid);
        assert!(id.to_string().starts_with("img-"));
    }

    #[test]
    fn image_id_parses_back_from_display() {
        let id = ImageId::from_ulid(Ulid::new());
        let parsed: ImageId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);

        // bare ULID も受け付ける
        let bare: ImageId = id.as_ulid().to_string().parse().unwrap();
        assert_eq!(bare, id);
    }

    #[test]
    fn image_id_rejects_garbage() {
        let err = "img-not-a-ulid".parse::<ImageId>().unwrap_err();
        assert_eq!(err.prefix, "img-");
        assert!(err.to_string().contains("img-not-a-ulid"));
    }

    #[test]
    fn ulid_ids_are_sortable() {
        let id1 = ImageId::from_ulid(Ulid::new());
        std::thread::sleep(std::time::Duration::from_millis(2));
        let id2 = ImageId::from_ulid(Ulid::new());
        assert!(id1 < id2);
    }

    #[test]
    fn phantom_data_does_not_consume_memory() {
        use std::mem::size_of;
        assert_eq!(size_of::<ImageId>(), size_of::<Ulid>());
    }
}
