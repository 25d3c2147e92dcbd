//! facegate-core: enrollment gallery and face matching engine.
//!
//! Holds the session gallery of enrolled embeddings, matches queries by
//! Euclidean distance, and wraps the ONNX detection and embedding models.

pub mod alignment;
pub mod detector;
pub mod gallery;
pub mod matcher;
pub mod recognizer;
pub mod store;
pub mod types;

pub use detector::{gray_image, DetectorError, FaceDetector};
pub use gallery::{EnrollError, Gallery, GalleryStore, ReloadError, ValidationError};
pub use matcher::{EuclideanMatcher, Matcher, DEFAULT_MATCH_THRESHOLD};
pub use recognizer::{FaceRecognizer, RecognizerError};
pub use store::{EnrollmentStore, MemoryStore, PersistError};
pub use types::{
    DetectedFace, Descriptor, Embedding, EnrollmentRecord, FaceBox, Identity, MatchResult,
    StoredDescriptor,
};
