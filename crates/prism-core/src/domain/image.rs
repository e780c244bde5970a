//! Image submission model: raw bytes, content hash and detected format.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::ids::ImageId;

/// Lowercase hex SHA-256 digest of an image's raw bytes.
///
/// This is the deduplication key for blob storage: identical bytes always
/// produce the same hash, no matter which `ImageId` they were submitted under.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentHash(String);

impl ContentHash {
    pub fn of(bytes: &[u8]) -> Self {
        let digest = Sha256::digest(bytes);
        Self(format!("{:x}", digest))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short form for log lines.
    pub fn short(&self) -> &str {
        &self.0[..self.0.len().min(12)]
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Image encodings the pipeline accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageFormat {
    Jpeg,
    Png,
    Gif,
    WebP,
    Bmp,
    Tiff,
}

impl ImageFormat {
    /// Sniff the format from the leading magic bytes.
    ///
    /// Returns `None` for anything that is not one of the recognized encodings.
    pub fn detect(bytes: &[u8]) -> Option<Self> {
        let format = image::guess_format(bytes).ok()?;
        match format {
            image::ImageFormat::Jpeg => Some(Self::Jpeg),
            image::ImageFormat::Png => Some(Self::Png),
            image::ImageFormat::Gif => Some(Self::Gif),
            image::ImageFormat::WebP => Some(Self::WebP),
            image::ImageFormat::Bmp => Some(Self::Bmp),
            image::ImageFormat::Tiff => Some(Self::Tiff),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Jpeg => "jpeg",
            Self::Png => "png",
            Self::Gif => "gif",
            Self::WebP => "webp",
            Self::Bmp => "bmp",
            Self::Tiff => "tiff",
        }
    }
}

impl fmt::Display for ImageFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An admitted image, owned by the Router until it is dispatched.
///
/// `bytes` is reference-counted so fan-out to several stages does not copy
/// the image per stage.
#[derive(Debug, Clone)]
pub struct ImageSubmission {
    pub image_id: ImageId,
    pub bytes: Arc<[u8]>,
    pub content_hash: ContentHash,
    pub format: ImageFormat,
    pub submitted_at: DateTime<Utc>,
}

impl ImageSubmission {
    pub fn new(
        image_id: ImageId,
        bytes: Arc<[u8]>,
        format: ImageFormat,
        submitted_at: DateTime<Utc>,
    ) -> Self {
        let content_hash = ContentHash::of(&bytes);
        Self {
            image_id,
            bytes,
            content_hash,
            format,
            submitted_at,
        }
    }
}
