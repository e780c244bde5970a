//! Domain model (IDs, images, analysis results, aggregate records, errors).

pub mod analysis;
pub mod errors;
pub mod ids;
pub mod image;
pub mod record;

pub use self::analysis::{
    AgenderResult, AnalysisResult, FaceResult, Gender, OutcomeKind, Point2D, Point3D, StageName,
    StagePayload,
};
pub use self::errors::{CacheError, ErrorKind, InferenceError, PrismError, StoreError};
pub use self::ids::{ImageId, ParseIdError};
pub use self::image::{ContentHash, ImageFormat, ImageSubmission};
pub use self::record::{AggregateRecord, BlobMeta, StageField};
