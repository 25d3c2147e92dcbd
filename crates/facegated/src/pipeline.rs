//! Per-frame detection capabilities: embedding extraction and QR decoding.

use async_trait::async_trait;
use facegate_core::{
    gray_image, DetectedFace, DetectorError, FaceBox, FaceDetector, FaceRecognizer, MatchResult,
    RecognizerError,
};
use facegate_hw::Frame;
use serde::Serialize;
use std::sync::{Arc, Mutex};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ExtractError {
    #[error("detector: {0}")]
    Detector(#[from] DetectorError),
    #[error("recognizer: {0}")]
    Recognizer(#[from] RecognizerError),
    #[error("extraction task failed: {0}")]
    Task(String),
}

/// Transient QR decode failure. Retried on the next tick, never fatal.
#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("QR symbol unreadable: {0}")]
    Unreadable(String),
    #[error("decode task failed: {0}")]
    Task(String),
}

/// A result published to presentation.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Detection {
    /// One identified (or unknown) face and where it sits in the frame.
    Face {
        #[serde(flatten)]
        result: MatchResult,
        bbox: FaceBox,
    },
    Qr { text: String },
}

/// Produces face embeddings from a frame.
#[async_trait]
pub trait EmbeddingExtractor: Send + Sync {
    /// One entry per detected face, best detection score first.
    /// Empty when the frame holds no face.
    async fn extract(&self, frame: Arc<Frame>) -> Result<Vec<DetectedFace>, ExtractError>;
}

/// Decodes QR symbol text from a frame.
#[async_trait]
pub trait QrDecoder: Send + Sync {
    /// `Ok(None)` means no symbol in the frame.
    async fn decode(&self, frame: Arc<Frame>) -> Result<Option<String>, DecodeError>;
}

/// Detector and recognizer sessions, used together on one thread.
pub struct FaceModels {
    pub detector: FaceDetector,
    pub recognizer: FaceRecognizer,
}

impl FaceModels {
    /// Detect every face in the frame and embed each aligned crop.
    pub fn process(&mut self, frame: &Frame) -> Result<Vec<DetectedFace>, ExtractError> {
        let gray = gray_image(&frame.data, frame.width, frame.height)?;
        let faces = self.detector.detect(&gray)?;
        tracing::trace!(count = faces.len(), "faces detected");

        faces
            .into_iter()
            .map(|bbox| {
                let embedding = self.recognizer.extract(&gray, &bbox)?;
                Ok(DetectedFace { bbox, embedding })
            })
            .collect()
    }
}

/// SCRFD detection plus embedding, run on the blocking pool.
pub struct OnnxExtractor {
    models: Arc<Mutex<FaceModels>>,
}

impl OnnxExtractor {
    pub fn new(detector: FaceDetector, recognizer: FaceRecognizer) -> Self {
        Self {
            models: Arc::new(Mutex::new(FaceModels { detector, recognizer })),
        }
    }
}

#[async_trait]
impl EmbeddingExtractor for OnnxExtractor {
    async fn extract(&self, frame: Arc<Frame>) -> Result<Vec<DetectedFace>, ExtractError> {
        let models = self.models.clone();
        tokio::task::spawn_blocking(move || {
            let mut models = models.lock().unwrap_or_else(|e| e.into_inner());
            models.process(&frame)
        })
        .await
        .map_err(|e| ExtractError::Task(e.to_string()))?
    }
}

/// QR decoder backed by `rqrr`.
#[derive(Debug, Default, Clone, Copy)]
pub struct RqrrDecoder;

impl RqrrDecoder {
    /// Decode the first readable symbol in a grayscale frame.
    pub fn decode_gray(data: &[u8], width: u32, height: u32) -> Result<Option<String>, DecodeError> {
        let (w, h) = (width as usize, height as usize);
        if data.len() < w * h {
            return Err(DecodeError::Unreadable(format!(
                "frame is {} bytes, expected {}",
                data.len(),
                w * h
            )));
        }
        let mut prepared = rqrr::PreparedImage::prepare_from_greyscale(w, h, |x, y| data[y * w + x]);
        let grids = prepared.detect_grids();
        if grids.is_empty() {
            return Ok(None);
        }

        let mut last_error = None;
        for grid in grids {
            match grid.decode() {
                Ok((_, text)) => return Ok(Some(text)),
                Err(e) => last_error = Some(e.to_string()),
            }
        }
        Err(DecodeError::Unreadable(last_error.unwrap_or_default()))
    }
}

#[async_trait]
impl QrDecoder for RqrrDecoder {
    async fn decode(&self, frame: Arc<Frame>) -> Result<Option<String>, DecodeError> {
        tokio::task::spawn_blocking(move || Self::decode_gray(&frame.data, frame.width, frame.height))
            .await
            .map_err(|e| DecodeError::Task(e.to_string()))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rqrr_blank_frame_has_no_symbol() {
        let frame = vec![255u8; 64 * 64];
        assert_eq!(RqrrDecoder::decode_gray(&frame, 64, 64).unwrap(), None);
    }

    #[test]
    fn test_rqrr_short_frame_is_error() {
        let err = RqrrDecoder::decode_gray(&[0u8; 10], 64, 64).unwrap_err();
        assert!(matches!(err, DecodeError::Unreadable(_)));
    }

    #[test]
    fn test_detection_json_shape() {
        let face = Detection::Face {
            result: MatchResult::new(Some("alice".into()), 0.25),
            bbox: FaceBox {
                x: 10.0,
                y: 20.0,
                width: 30.0,
                height: 40.0,
                score: 0.5,
                landmarks: None,
            },
        };
        let value = serde_json::to_value(&face).unwrap();
        assert_eq!(value["kind"], "face");
        assert_eq!(value["identity"], "alice");
        assert_eq!(value["confidence"], 75.0);
        assert_eq!(value["bbox"]["x"], 10.0);
        assert_eq!(value["bbox"]["height"], 40.0);
        assert!(value["bbox"].get("landmarks").is_none());

        let qr = Detection::Qr { text: "hello".into() };
        let value = serde_json::to_value(&qr).unwrap();
        assert_eq!(value["kind"], "qr");
        assert_eq!(value["text"], "hello");
    }
}
