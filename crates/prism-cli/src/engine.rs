//! デモ用の推論エンジン
//!
//! 本物のモデルは持たないので、画像 bytes の SHA-256 から決定的に結果を作る。
//! 同じ bytes なら何度呼んでも同じ結果になる（Inference port の前提どおり）。

use async_trait::async_trait;
use sha2::{Digest, Sha256};

use prism_core::domain::{AgenderResult, FaceResult, Gender, ImageFormat, InferenceError, StagePayload};
use prism_core::ports::Inference;

/// Digest of a recognizable image; anything else cannot be decoded.
fn digest(image: &[u8]) -> Result<[u8; 32], InferenceError> {
    if ImageFormat::detect(image).is_none() {
        return Err(InferenceError::Decode(format!("unrecognized image header ({} bytes)", image.len())));
    }
    Ok(Sha256::digest(image).into())
}

/// 0..=2 faces, boxes placed from the digest.
#[derive(Debug, Default)]
pub struct DigestFaceEngine;

#[async_trait]
impl Inference for DigestFaceEngine {
    async fn analyze(&self, image: &[u8]) -> Result<StagePayload, InferenceError> {
        let d = digest(image)?;
        let faces = (0..usize::from(d[0] % 3))
            .map(|i| {
                let at = 1 + i * 4;
                let x1 = f32::from(d[at]);
                let y1 = f32::from(d[at + 1]);
                FaceResult {
                    bbox: [x1, y1, x1 + 32.0 + f32::from(d[at + 2] % 64), y1 + 32.0 + f32::from(d[at + 3] % 64)],
                    landmark_2d_106: Vec::new(),
                    landmark_3d_68: Vec::new(),
                    age: None,
                    gender: None,
                }
            })
            .collect();
        Ok(StagePayload::Face(faces))
    }
}

/// Exactly one age/gender estimate per image.
#[derive(Debug, Default)]
pub struct DigestAgenderEngine;

#[async_trait]
impl Inference for DigestAgenderEngine {
    async fn analyze(&self, image: &[u8]) -> Result<StagePayload, InferenceError> {
        let d = digest(image)?;
        let age = 18 + u32::from(d[16] % 63);
        let gender = if d[17] % 2 == 0 { Gender::Male } else { Gender::Female };
        Ok(StagePayload::Agender(vec![AgenderResult::new(age, gender)]))
    }
}
