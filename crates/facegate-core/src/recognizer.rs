//! Face embedding model via ONNX Runtime.
//!
//! Takes one detected face, aligns it to the model's canonical crop and
//! returns a 128-dimensional, L2-normalized descriptor.

use crate::alignment::align_face;
use crate::types::{Embedding, FaceBox};
use image::GrayImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

const RECOGNIZER_INPUT_SIZE: u32 = 150;
const RECOGNIZER_MEAN: f32 = 127.5;
const RECOGNIZER_STD: f32 = 127.5;
pub const EMBEDDING_DIM: usize = 128;

#[derive(Error, Debug)]
pub enum RecognizerError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// ONNX-backed face embedding extractor.
pub struct FaceRecognizer {
    session: Session,
}

impl FaceRecognizer {
    /// Load the embedding model from the given path.
    pub fn load(model_path: &str) -> Result<Self, RecognizerError> {
        if !Path::new(model_path).exists() {
            return Err(RecognizerError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)
            .map_err(ort::Error::from)?
            .commit_from_file(model_path)?;

        tracing::info!(
            path = model_path,
            inputs = ?session.inputs().iter().map(|i| (i.name(), i.dtype())).collect::<Vec<_>>(),
            outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
            "loaded face embedding model"
        );

        Ok(Self { session })
    }

    /// Embedding length produced by this model.
    pub fn dimension(&self) -> usize {
        EMBEDDING_DIM
    }

    /// Extract the embedding of `face` within `frame`.
    pub fn extract(&mut self, frame: &GrayImage, face: &FaceBox) -> Result<Embedding, RecognizerError> {
        let aligned = align_face(frame, face, RECOGNIZER_INPUT_SIZE);
        let input = Self::preprocess(&aligned);

        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (_, raw_data) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| RecognizerError::InferenceFailed(format!("embedding extraction: {e}")))?;

        let raw: Vec<f32> = raw_data.to_vec();

        if raw.len() != EMBEDDING_DIM {
            return Err(RecognizerError::InferenceFailed(format!(
                "expected {EMBEDDING_DIM}-dim embedding, got {}",
                raw.len()
            )));
        }

        Ok(Embedding::new(l2_normalize(raw)))
    }

    /// Build a NCHW tensor from an aligned crop.
    fn preprocess(aligned: &GrayImage) -> Array4<f32> {
        let (w, h) = aligned.dimensions();
        let mut tensor = Array4::<f32>::zeros((1, 3, h as usize, w as usize));
        for (x, y, pixel) in aligned.enumerate_pixels() {
            let normalized = (pixel.0[0] as f32 - RECOGNIZER_MEAN) / RECOGNIZER_STD;
            let (x, y) = (x as usize, y as usize);
            // Grayscale → 3-channel
            tensor[[0, 0, y, x]] = normalized;
            tensor[[0, 1, y, x]] = normalized;
            tensor[[0, 2, y, x]] = normalized;
        }
        tensor
    }
}

fn l2_normalize(raw: Vec<f32>) -> Vec<f32> {
    let norm: f32 = raw.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        raw.iter().map(|x| x / norm).collect()
    } else {
        raw
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;

    fn face_without_landmarks() -> FaceBox {
        FaceBox {
            x: 8.0,
            y: 8.0,
            width: 32.0,
            height: 32.0,
            score: 0.9,
            landmarks: None,
        }
    }

    #[test]
    fn test_aligned_crop_matches_model_input() {
        let frame = GrayImage::from_pixel(64, 48, Luma([128]));
        let aligned = align_face(&frame, &face_without_landmarks(), RECOGNIZER_INPUT_SIZE);
        let tensor = FaceRecognizer::preprocess(&aligned);
        let size = RECOGNIZER_INPUT_SIZE as usize;
        assert_eq!(tensor.shape(), &[1, 3, size, size]);
    }

    #[test]
    fn test_preprocess_uniform_crop_normalization() {
        let crop = GrayImage::from_pixel(32, 32, Luma([200]));
        let tensor = FaceRecognizer::preprocess(&crop);
        let expected = (200.0 - RECOGNIZER_MEAN) / RECOGNIZER_STD;
        let val = tensor[[0, 2, 10, 10]];
        assert!((val - expected).abs() < 1e-5, "got {val}, expected {expected}");
        assert_eq!(tensor[[0, 0, 10, 10]], tensor[[0, 1, 10, 10]]);
    }

    #[test]
    fn test_l2_normalize() {
        let v = l2_normalize(vec![3.0, 4.0]);
        assert!((v[0] - 0.6).abs() < 1e-6);
        assert!((v[1] - 0.8).abs() < 1e-6);
        assert_eq!(l2_normalize(vec![0.0, 0.0]), vec![0.0, 0.0]);
    }

    #[test]
    fn test_load_missing_model() {
        let err = FaceRecognizer::load("/nonexistent/face_embedding.onnx").err().unwrap();
        assert!(matches!(err, RecognizerError::ModelNotFound(_)));
    }
}
