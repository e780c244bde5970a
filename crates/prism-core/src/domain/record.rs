//! Aggregate record: the per-image document merging every stage's outcome.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::analysis::{AnalysisResult, OutcomeKind, StageName, StagePayload};
use super::ids::ImageId;
use super::image::{ContentHash, ImageFormat};

/// One stage's contribution to an `AggregateRecord`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageField {
    pub status: OutcomeKind,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<StagePayload>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    pub merged_at: DateTime<Utc>,
}

impl StageField {
    pub fn from_result(result: &AnalysisResult, merged_at: DateTime<Utc>) -> Self {
        Self {
            status: result.outcome,
            payload: result.payload.clone(),
            reason: result.reason.clone(),
            merged_at,
        }
    }

    /// Compare what the stage said, ignoring when it was merged.
    pub fn same_content(&self, other: &StageField) -> bool {
        self.status == other.status && self.payload == other.payload && self.reason == other.reason
    }
}

/// Per-image document. `face` and `agender` are set independently; `None`
/// means that stage has not (yet) reported for this image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateRecord {
    pub image_id: ImageId,
    pub content_hash: ContentHash,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub face: Option<StageField>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agender: Option<StageField>,

    pub stored_at: DateTime<Utc>,
}

impl AggregateRecord {
    pub fn new(image_id: ImageId, content_hash: ContentHash, stored_at: DateTime<Utc>) -> Self {
        Self {
            image_id,
            content_hash,
            face: None,
            agender: None,
            stored_at,
        }
    }

    pub fn field(&self, stage: StageName) -> Option<&StageField> {
        match stage {
            StageName::Face => self.face.as_ref(),
            StageName::Agender => self.agender.as_ref(),
        }
    }

    pub fn field_mut(&mut self, stage: StageName) -> &mut Option<StageField> {
        match stage {
            StageName::Face => &mut self.face,
            StageName::Agender => &mut self.agender,
        }
    }

    /// Every stage has reached a terminal outcome.
    pub fn is_complete(&self) -> bool {
        StageName::ALL
            .iter()
            .all(|s| self.field(*s).is_some_and(|f| f.status.is_terminal()))
    }
}

/// Metadata stored alongside a blob, written in the same step as the bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobMeta {
    pub content_hash: ContentHash,
    pub size: usize,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<ImageFormat>,

    pub stored_at: DateTime<Utc>,
}
