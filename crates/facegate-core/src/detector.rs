//! SCRFD face detector via ONNX Runtime.
//!
//! Letterboxes a grayscale frame into the 640x640 network input, decodes the
//! three anchor-free stride heads (score, box distances, five landmarks) and
//! suppresses overlapping boxes.

use crate::types::FaceBox;
use image::imageops::FilterType;
use image::GrayImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

const DETECTOR_INPUT_SIZE: u32 = 640;
const DETECTOR_MEAN: f32 = 127.5;
const DETECTOR_STD: f32 = 128.0;
const DEFAULT_SCORE_THRESHOLD: f32 = 0.5;
const NMS_IOU_THRESHOLD: f32 = 0.4;
const STRIDES: [usize; 3] = [8, 16, 32];
const ANCHORS_PER_CELL: usize = 2;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("detector needs 9 outputs (score/bbox/kps per stride), model has {0}")]
    UnexpectedOutputs(usize),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("frame is {actual} bytes, expected {expected} for {width}x{height} grayscale")]
    InvalidFrame {
        width: u32,
        height: u32,
        expected: usize,
        actual: usize,
    },
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Output tensor positions for one stride level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Head {
    stride: usize,
    score: usize,
    bbox: usize,
    kps: usize,
}

/// Mapping between frame pixels and the padded network input.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Letterbox {
    scale: f32,
    pad_x: f32,
    pad_y: f32,
    width: u32,
    height: u32,
}

impl Letterbox {
    fn fit(width: u32, height: u32, size: u32) -> Self {
        let scale = (size as f32 / width as f32).min(size as f32 / height as f32);
        let scaled_w = ((width as f32 * scale).round() as u32).clamp(1, size);
        let scaled_h = ((height as f32 * scale).round() as u32).clamp(1, size);
        Self {
            scale,
            pad_x: ((size - scaled_w) / 2) as f32,
            pad_y: ((size - scaled_h) / 2) as f32,
            width: scaled_w,
            height: scaled_h,
        }
    }

    /// Network-input coordinates back to frame coordinates.
    fn to_frame(&self, x: f32, y: f32) -> (f32, f32) {
        ((x - self.pad_x) / self.scale, (y - self.pad_y) / self.scale)
    }
}

/// SCRFD-based multi-face detector.
pub struct FaceDetector {
    session: Session,
    heads: [Head; 3],
    score_threshold: f32,
}

impl FaceDetector {
    /// Load the SCRFD ONNX model from the given path.
    pub fn load(model_path: &str) -> Result<Self, DetectorError> {
        if !Path::new(model_path).exists() {
            return Err(DetectorError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)
            .map_err(ort::Error::from)?
            .commit_from_file(model_path)?;

        let names: Vec<String> = session.outputs().iter().map(|o| o.name().to_string()).collect();
        if names.len() < 9 {
            return Err(DetectorError::UnexpectedOutputs(names.len()));
        }
        let heads = locate_heads(&names);

        tracing::info!(
            path = model_path,
            outputs = ?names,
            heads = ?heads,
            "loaded face detector"
        );

        Ok(Self {
            session,
            heads,
            score_threshold: DEFAULT_SCORE_THRESHOLD,
        })
    }

    /// Detect every face in a grayscale frame, best score first.
    pub fn detect(&mut self, frame: &GrayImage) -> Result<Vec<FaceBox>, DetectorError> {
        let (input, letterbox) = letterbox_tensor(frame, DETECTOR_INPUT_SIZE);
        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let mut candidates = Vec::new();
        for head in self.heads {
            let tensor = |idx: usize, what: &str| {
                outputs[idx]
                    .try_extract_tensor::<f32>()
                    .map(|(_, data)| data)
                    .map_err(|e| {
                        DetectorError::InferenceFailed(format!("{what} stride {}: {e}", head.stride))
                    })
            };
            let scores = tensor(head.score, "scores")?;
            let bboxes = tensor(head.bbox, "boxes")?;
            let kps = tensor(head.kps, "landmarks")?;
            candidates.extend(decode_head(
                head.stride,
                scores,
                bboxes,
                kps,
                &letterbox,
                self.score_threshold,
            ));
        }

        let faces = suppress_overlaps(candidates, NMS_IOU_THRESHOLD);
        tracing::trace!(faces = faces.len(), "detection pass");
        Ok(faces)
    }
}

/// Wrap raw grayscale bytes as an image, checking the buffer length.
pub fn gray_image(frame: &[u8], width: u32, height: u32) -> Result<GrayImage, DetectorError> {
    let expected = width as usize * height as usize;
    let invalid = || DetectorError::InvalidFrame {
        width,
        height,
        expected,
        actual: frame.len(),
    };
    if expected == 0 || frame.len() < expected {
        return Err(invalid());
    }
    GrayImage::from_raw(width, height, frame[..expected].to_vec()).ok_or_else(invalid)
}

/// Find score/bbox/kps outputs per stride by name (`score_8`, `bbox_16`, ...),
/// falling back to the common positional export order.
fn locate_heads(names: &[String]) -> [Head; 3] {
    let position = |prefix: &str, stride: usize| {
        let wanted = format!("{prefix}_{stride}");
        names.iter().position(|n| *n == wanted)
    };
    let named = |stride: usize| -> Option<Head> {
        Some(Head {
            stride,
            score: position("score", stride)?,
            bbox: position("bbox", stride)?,
            kps: position("kps", stride)?,
        })
    };

    match (named(STRIDES[0]), named(STRIDES[1]), named(STRIDES[2])) {
        (Some(a), Some(b), Some(c)) => [a, b, c],
        _ => {
            tracing::debug!(?names, "output names not recognized; using positional heads");
            std::array::from_fn(|i| Head {
                stride: STRIDES[i],
                score: i,
                bbox: i + 3,
                kps: i + 6,
            })
        }
    }
}

/// Resize into the letterboxed NCHW input. Padding sits at the mean, so it
/// normalizes to zero.
fn letterbox_tensor(frame: &GrayImage, size: u32) -> (Array4<f32>, Letterbox) {
    let letterbox = Letterbox::fit(frame.width(), frame.height(), size);
    let resized = image::imageops::resize(frame, letterbox.width, letterbox.height, FilterType::Triangle);

    let side = size as usize;
    let mut tensor = Array4::<f32>::zeros((1, 3, side, side));
    let (off_x, off_y) = (letterbox.pad_x as usize, letterbox.pad_y as usize);
    for (x, y, pixel) in resized.enumerate_pixels() {
        let value = (pixel.0[0] as f32 - DETECTOR_MEAN) / DETECTOR_STD;
        let (tx, ty) = (x as usize + off_x, y as usize + off_y);
        for channel in 0..3 {
            tensor[[0, channel, ty, tx]] = value;
        }
    }
    (tensor, letterbox)
}

/// Decode one stride head into frame-space boxes scoring above `threshold`.
fn decode_head(
    stride: usize,
    scores: &[f32],
    bboxes: &[f32],
    kps: &[f32],
    letterbox: &Letterbox,
    threshold: f32,
) -> Vec<FaceBox> {
    let cells_x = DETECTOR_INPUT_SIZE as usize / stride;
    let step = stride as f32;

    scores
        .iter()
        .enumerate()
        .filter(|&(_, &score)| score > threshold)
        .filter_map(|(idx, &score)| {
            let cell = idx / ANCHORS_PER_CELL;
            let cx = (cell % cells_x) as f32 * step;
            let cy = (cell / cells_x) as f32 * step;

            let d = bboxes.get(idx * 4..idx * 4 + 4)?;
            let (x1, y1) = letterbox.to_frame(cx - d[0] * step, cy - d[1] * step);
            let (x2, y2) = letterbox.to_frame(cx + d[2] * step, cy + d[3] * step);

            let landmarks = kps.get(idx * 10..idx * 10 + 10).map(|p| {
                std::array::from_fn(|i| letterbox.to_frame(cx + p[2 * i] * step, cy + p[2 * i + 1] * step))
            });

            Some(FaceBox {
                x: x1,
                y: y1,
                width: x2 - x1,
                height: y2 - y1,
                score,
                landmarks,
            })
        })
        .collect()
}

/// Greedy non-maximum suppression; returns survivors best score first.
fn suppress_overlaps(mut candidates: Vec<FaceBox>, iou_threshold: f32) -> Vec<FaceBox> {
    candidates.sort_by(|a, b| b.score.total_cmp(&a.score));
    let mut kept: Vec<FaceBox> = Vec::with_capacity(candidates.len());
    for candidate in candidates {
        if kept.iter().all(|k| k.iou(&candidate) <= iou_threshold) {
            kept.push(candidate);
        }
    }
    kept
}
