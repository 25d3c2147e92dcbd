use serde::{Deserialize, Serialize};
use std::fmt;

/// Label shown for a query that matched no enrolled identity.
pub const UNKNOWN_LABEL: &str = "unknown";

/// Face embedding vector (128-dimensional for the default model).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self { values }
    }

    /// Number of dimensions.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// True when no component is NaN or infinite.
    pub fn is_finite(&self) -> bool {
        self.values.iter().all(|v| v.is_finite())
    }

    /// Compute Euclidean distance between two embeddings.
    ///
    /// Callers must have checked that both sides have the same length;
    /// extra trailing dimensions on either side are ignored.
    pub fn euclidean_distance(&self, other: &Embedding) -> f32 {
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt()
    }
}

impl From<Vec<f32>> for Embedding {
    fn from(values: Vec<f32>) -> Self {
        Self { values }
    }
}

/// Identity key of an enrolled person.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Identity(pub String);

impl Identity {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Identity {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for Identity {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// All embeddings enrolled for one identity, in enrollment order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrollmentRecord {
    pub identity: Identity,
    pub embeddings: Vec<Embedding>,
}

impl EnrollmentRecord {
    pub fn new(identity: impl Into<Identity>, embeddings: Vec<Embedding>) -> Self {
        Self {
            identity: identity.into(),
            embeddings,
        }
    }
}

/// Wire form of a single enrolled embedding: `{"descriptor": [number, ...]}`.
///
/// Values are kept at double precision so a registered descriptor lists
/// back exactly as it was sent; matching narrows them to `f32`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Descriptor {
    pub descriptor: Vec<f64>,
}

impl From<&Descriptor> for Embedding {
    fn from(d: &Descriptor) -> Self {
        Embedding::new(d.descriptor.iter().map(|&v| v as f32).collect())
    }
}

impl From<Descriptor> for Embedding {
    fn from(d: Descriptor) -> Self {
        Embedding::from(&d)
    }
}

impl From<&Embedding> for Descriptor {
    fn from(e: &Embedding) -> Self {
        Self {
            descriptor: e.values.iter().map(|&v| f64::from(v)).collect(),
        }
    }
}

impl From<Embedding> for Descriptor {
    fn from(e: Embedding) -> Self {
        Descriptor::from(&e)
    }
}

/// Face location in frame pixel coordinates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaceBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    /// Detector score in [0, 1].
    pub score: f32,
    /// Eyes, nose tip and mouth corners, left to right.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub landmarks: Option<[(f32, f32); 5]>,
}

impl FaceBox {
    pub fn area(&self) -> f32 {
        self.width.max(0.0) * self.height.max(0.0)
    }

    /// Intersection over union with `other`.
    pub fn iou(&self, other: &FaceBox) -> f32 {
        let left = self.x.max(other.x);
        let top = self.y.max(other.y);
        let right = (self.x + self.width).min(other.x + other.width);
        let bottom = (self.y + self.height).min(other.y + other.height);
        let overlap = (right - left).max(0.0) * (bottom - top).max(0.0);
        let union = self.area() + other.area() - overlap;
        if union > 0.0 {
            overlap / union
        } else {
            0.0
        }
    }
}

/// A detected face and the embedding extracted from its aligned crop.
#[derive(Debug, Clone, PartialEq)]
pub struct DetectedFace {
    pub bbox: FaceBox,
    pub embedding: Embedding,
}

/// A stored descriptor together with the identity it belongs to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredDescriptor {
    pub id: i64,
    pub identity: Identity,
    #[serde(flatten)]
    pub descriptor: Descriptor,
    pub created_at: String,
}

/// Result of matching a query embedding against a gallery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchResult {
    /// Matched identity, `None` when the query is unknown.
    pub identity: Option<Identity>,
    /// Euclidean distance to the nearest enrolled embedding
    /// (`f32::INFINITY` when the gallery is empty).
    pub distance: f32,
    /// UI-facing score in [0, 100]; never used for the accept decision.
    pub confidence: f32,
}

impl MatchResult {
    pub fn new(identity: Option<Identity>, distance: f32) -> Self {
        Self {
            identity,
            distance,
            confidence: confidence_from_distance(distance),
        }
    }

    /// Result for a query compared against an empty gallery.
    pub fn unknown() -> Self {
        Self::new(None, f32::INFINITY)
    }

    pub fn is_match(&self) -> bool {
        self.identity.is_some()
    }

    /// Overlay label: the identity, or `"unknown"`.
    pub fn label(&self) -> &str {
        self.identity
            .as_ref()
            .map(Identity::as_str)
            .unwrap_or(UNKNOWN_LABEL)
    }
}

impl fmt::Display for MatchResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}%)", self.label(), self.confidence)
    }
}

/// Map a distance to a percentage: `round((1 - d) * 100)` clamped to [0, 100].
pub fn confidence_from_distance(distance: f32) -> f32 {
    if !distance.is_finite() {
        return 0.0;
    }
    ((1.0 - distance) * 100.0).round().clamp(0.0, 100.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_euclidean_distance_identical() {
        let a = Embedding::new(vec![1.0, 0.0, 0.0]);
        assert_eq!(a.euclidean_distance(&a), 0.0);
    }

    #[test]
    fn test_euclidean_distance_orthogonal() {
        let a = Embedding::new(vec![1.0, 0.0]);
        let b = Embedding::new(vec![0.0, 1.0]);
        assert!((a.euclidean_distance(&b) - 2.0f32.sqrt()).abs() < 1e-6);
    }

    #[test]
    fn test_confidence_exact_and_rounded() {
        assert_eq!(confidence_from_distance(0.0), 100.0);
        assert_eq!(confidence_from_distance(0.1414), 86.0);
        assert_eq!(confidence_from_distance(1.0), 0.0);
    }

    #[test]
    fn test_confidence_clamped_for_large_distance() {
        // Unclamped this would be -40%.
        assert_eq!(confidence_from_distance(1.4), 0.0);
        assert_eq!(confidence_from_distance(f32::INFINITY), 0.0);
        assert_eq!(confidence_from_distance(f32::NAN), 0.0);
    }

    #[test]
    fn test_match_result_label() {
        let known = MatchResult::new(Some("alice".into()), 0.2);
        assert_eq!(known.label(), "alice");
        assert_eq!(known.to_string(), "alice (80%)");

        let unknown = MatchResult::unknown();
        assert_eq!(unknown.label(), UNKNOWN_LABEL);
        assert!(!unknown.is_match());
        assert_eq!(unknown.confidence, 0.0);
    }

    #[test]
    fn test_descriptor_keeps_double_precision() {
        let json = r#"{"descriptor":[0.1234567891,-0.9876543219]}"#;
        let d: Descriptor = serde_json::from_str(json).unwrap();
        assert_eq!(serde_json::to_string(&d).unwrap(), json);

        let embedding = Embedding::from(&d);
        assert_eq!(embedding.values[0], 0.1234567891f64 as f32);
    }

    #[test]
    fn test_embedding_is_finite() {
        assert!(Embedding::new(vec![0.0, 1.0]).is_finite());
        assert!(!Embedding::new(vec![0.0, f32::NAN]).is_finite());
        assert!(!Embedding::new(vec![f32::INFINITY]).is_finite());
    }

    #[test]
    fn test_face_box_iou() {
        let a = FaceBox { x: 0.0, y: 0.0, width: 10.0, height: 10.0, score: 0.9, landmarks: None };
        let b = FaceBox { x: 5.0, ..a.clone() };
        let far = FaceBox { x: 50.0, y: 50.0, ..a.clone() };
        assert!((a.iou(&a) - 1.0).abs() < 1e-6);
        assert!((a.iou(&b) - 50.0 / 150.0).abs() < 1e-6);
        assert_eq!(a.iou(&far), 0.0);
    }

    #[test]
    fn test_descriptor_wire_shape() {
        let json = r#"{"descriptor":[0.25,-1.5,3.0]}"#;
        let d: Descriptor = serde_json::from_str(json).unwrap();
        let embedding = Embedding::from(d);
        assert_eq!(embedding.values, vec![0.25, -1.5, 3.0]);
        assert_eq!(serde_json::to_string(&Descriptor::from(&embedding)).unwrap(), json);
    }

    #[test]
    fn test_stored_descriptor_flattens_wire_record() {
        let stored = StoredDescriptor {
            id: 7,
            identity: "bob".into(),
            descriptor: Descriptor { descriptor: vec![1.0, 2.0] },
            created_at: "2024-01-01T00:00:00Z".into(),
        };
        let value = serde_json::to_value(&stored).unwrap();
        assert_eq!(value["identity"], "bob");
        assert_eq!(value["descriptor"], serde_json::json!([1.0, 2.0]));
    }
}
