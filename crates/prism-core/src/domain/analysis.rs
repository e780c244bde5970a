//! Analysis model: what a stage produces for one image.
//!
//! The inference engines themselves are external; this module only fixes the
//! shape of their output so it can be cached, forwarded and merged.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::ids::ImageId;
use super::image::ContentHash;

/// The analysis stages an image is fanned out to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageName {
    Face,
    Agender,
}

impl StageName {
    pub const ALL: [StageName; 2] = [StageName::Face, StageName::Agender];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Face => "face",
            Self::Agender => "agender",
        }
    }

    /// Cache field holding the serialized payload for this stage.
    pub fn results_field(self) -> &'static str {
        match self {
            Self::Face => "face_results",
            Self::Agender => "agender_results",
        }
    }

    /// Cache field holding the aggregator's completion status for this stage.
    pub fn status_field(self) -> &'static str {
        match self {
            Self::Face => "face_status",
            Self::Agender => "agender_status",
        }
    }
}

impl fmt::Display for StageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StageName {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "face" => Ok(Self::Face),
            "agender" => Ok(Self::Agender),
            other => Err(format!("unknown stage '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Gender {
    #[serde(rename = "M")]
    Male,
    #[serde(rename = "F")]
    Female,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point2D {
    pub x: f32,
    pub y: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point3D {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

/// One detected face.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaceResult {
    /// `[x1, y1, x2, y2]`
    pub bbox: [f32; 4],
    #[serde(default)]
    pub landmark_2d_106: Vec<Point2D>,
    #[serde(default)]
    pub landmark_3d_68: Vec<Point3D>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub age: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gender: Option<Gender>,
}

/// Age/gender estimate for one person.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgenderResult {
    pub age: u32,
    pub gender: Gender,
}

impl AgenderResult {
    pub fn new(age: u32, gender: Gender) -> Self {
        Self { age, gender }
    }
}

/// Stage output. An empty vector is a valid answer ("no faces").
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "stage", content = "results", rename_all = "snake_case")]
pub enum StagePayload {
    Face(Vec<FaceResult>),
    Agender(Vec<AgenderResult>),
}

impl StagePayload {
    pub fn stage(&self) -> StageName {
        match self {
            Self::Face(_) => StageName::Face,
            Self::Agender(_) => StageName::Agender,
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Self::Face(v) => v.is_empty(),
            Self::Agender(v) => v.is_empty(),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Self::Face(v) => v.len(),
            Self::Agender(v) => v.len(),
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }
}

/// Classification of a stage result.
///
/// - `SUCCESS`: payload with at least one entry.
/// - `EMPTY`: valid payload with no entries.
/// - `ERROR`: inference failed; recorded, never cached.
/// - `MISSING`: the stage never answered (unreachable or timed out).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutcomeKind {
    Success,
    Empty,
    Error,
    Missing,
}

impl OutcomeKind {
    /// Merge precedence. A field is never replaced by a lower rank.
    pub fn rank(self) -> u8 {
        match self {
            Self::Missing => 0,
            Self::Error => 1,
            Self::Success | Self::Empty => 2,
        }
    }

    /// Does this outcome carry a concrete payload?
    pub fn has_payload(self) -> bool {
        matches!(self, Self::Success | Self::Empty)
    }

    /// Has the stage finished with this image (successfully or not)?
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Missing)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "SUCCESS",
            Self::Empty => "EMPTY",
            Self::Error => "ERROR",
            Self::Missing => "MISSING",
        }
    }
}

impl FromStr for OutcomeKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "SUCCESS" => Ok(Self::Success),
            "EMPTY" => Ok(Self::Empty),
            "ERROR" => Ok(Self::Error),
            "MISSING" => Ok(Self::Missing),
            other => Err(format!("unknown outcome '{other}'")),
        }
    }
}

/// What one stage produced for one image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisResult {
    pub image_id: ImageId,
    pub content_hash: ContentHash,
    pub stage: StageName,
    pub outcome: OutcomeKind,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<StagePayload>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl AnalysisResult {
    /// Wrap a payload; the outcome is `Success` or `Empty` depending on its length.
    pub fn from_payload(image_id: ImageId, content_hash: ContentHash, payload: StagePayload) -> Self {
        let outcome = if payload.is_empty() {
            OutcomeKind::Empty
        } else {
            OutcomeKind::Success
        };
        Self {
            image_id,
            content_hash,
            stage: payload.stage(),
            outcome,
            payload: Some(payload),
            reason: None,
        }
    }

    pub fn failed(
        image_id: ImageId,
        content_hash: ContentHash,
        stage: StageName,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            image_id,
            content_hash,
            stage,
            outcome: OutcomeKind::Error,
            payload: None,
            reason: Some(reason.into()),
        }
    }

    pub fn missing(
        image_id: ImageId,
        content_hash: ContentHash,
        stage: StageName,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            image_id,
            content_hash,
            stage,
            outcome: OutcomeKind::Missing,
            payload: None,
            reason: Some(reason.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn some_id() -> ImageId {
        ImageId::from_ulid(ulid::Ulid::new())
    }

    #[test]
    fn gender_serializes_as_single_letter() {
        let r = AgenderResult::new(34, Gender::Male);
        let v = serde_json::to_value(r).unwrap();
        assert_eq!(v, serde_json::json!({"age": 34, "gender": "M"}));
    }

    #[test]
    fn payload_is_tagged_by_stage() {
        let p = StagePayload::Agender(vec![AgenderResult::new(34, Gender::Male)]);
        let v: serde_json::Value = serde_json::from_str(&p.to_json().unwrap()).unwrap();
        assert_eq!(v["stage"], "agender");
        assert_eq!(v["results"][0]["age"], 34);
        assert_eq!(StagePayload::from_json(&p.to_json().unwrap()).unwrap(), p);
    }

    #[test]
    fn empty_payload_yields_empty_outcome() {
        let r = AnalysisResult::from_payload(some_id(), ContentHash::of(b"x"), StagePayload::Face(vec![]));
        assert_eq!(r.outcome, OutcomeKind::Empty);
        assert_eq!(r.stage, StageName::Face);
        assert_eq!(r.payload, Some(StagePayload::Face(vec![])));
    }

    #[test]
    fn failed_result_has_no_payload() {
        let r = AnalysisResult::failed(some_id(), ContentHash::of(b"x"), StageName::Agender, "boom");
        assert_eq!(r.outcome, OutcomeKind::Error);
        assert!(r.payload.is_none());
        assert_eq!(r.reason.as_deref(), Some("boom"));
    }

    #[rstest]
    #[case(OutcomeKind::Missing, OutcomeKind::Error)]
    #[case(OutcomeKind::Error, OutcomeKind::Success)]
    #[case(OutcomeKind::Missing, OutcomeKind::Empty)]
    fn rank_orders_outcomes(#[case] lower: OutcomeKind, #[case] higher: OutcomeKind) {
        assert!(lower.rank() < higher.rank());
    }

    #[test]
    fn stage_names_round_trip_through_str() {
        for stage in StageName::ALL {
            assert_eq!(stage.as_str().parse::<StageName>().unwrap(), stage);
        }
        assert!("landmarks".parse::<StageName>().is_err());
    }
}
