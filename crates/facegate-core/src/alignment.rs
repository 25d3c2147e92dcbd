//! Face alignment to the recognizer's canonical crop.
//!
//! Five detected landmarks are mapped onto reference positions with a
//! least-squares similarity transform (uniform scale, rotation,
//! translation); the crop is then resampled bilinearly. Faces without
//! landmarks fall back to a square crop around the detection box.

use crate::types::FaceBox;
use image::imageops::FilterType;
use image::{GrayImage, Luma};

/// Reference landmarks on a 112x112 canvas: eyes, nose tip, mouth corners.
const REFERENCE_LANDMARKS_112: [(f32, f32); 5] = [
    (38.2946, 51.6963),
    (73.5318, 51.5014),
    (56.0252, 71.7366),
    (41.5493, 92.3655),
    (70.7299, 92.2041),
];
const REFERENCE_CANVAS: f32 = 112.0;

/// `dst = [a -b; b a] * src + (tx, ty)`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Similarity {
    pub a: f32,
    pub b: f32,
    pub tx: f32,
    pub ty: f32,
}

impl Similarity {
    /// Closed-form least-squares fit. `None` when all source points coincide.
    pub fn estimate(src: &[(f32, f32); 5], dst: &[(f32, f32); 5]) -> Option<Self> {
        let n = src.len() as f32;
        let mean = |pts: &[(f32, f32); 5]| {
            let (sx, sy) = pts.iter().fold((0.0, 0.0), |(ax, ay), &(x, y)| (ax + x, ay + y));
            (sx / n, sy / n)
        };
        let (sx, sy) = mean(src);
        let (dx, dy) = mean(dst);

        let (mut dot, mut cross, mut spread) = (0.0f32, 0.0f32, 0.0f32);
        for (&(x, y), &(u, v)) in src.iter().zip(dst.iter()) {
            let (x, y, u, v) = (x - sx, y - sy, u - dx, v - dy);
            dot += x * u + y * v;
            cross += x * v - y * u;
            spread += x * x + y * y;
        }
        if spread < 1e-9 {
            return None;
        }

        let a = dot / spread;
        let b = cross / spread;
        Some(Self {
            a,
            b,
            tx: dx - (a * sx - b * sy),
            ty: dy - (b * sx + a * sy),
        })
    }

    pub fn apply(&self, (x, y): (f32, f32)) -> (f32, f32) {
        (
            self.a * x - self.b * y + self.tx,
            self.b * x + self.a * y + self.ty,
        )
    }

    /// Inverse mapping, `None` for a degenerate (zero-scale) transform.
    pub fn inverse(&self) -> Option<Self> {
        let det = self.a * self.a + self.b * self.b;
        if det < 1e-12 {
            return None;
        }
        let (a, b) = (self.a / det, -self.b / det);
        Some(Self {
            a,
            b,
            tx: -(a * self.tx - b * self.ty),
            ty: -(b * self.tx + a * self.ty),
        })
    }
}

/// Produce a `size`x`size` aligned crop for `face`.
pub fn align_face(frame: &GrayImage, face: &FaceBox, size: u32) -> GrayImage {
    let transform = face.landmarks.as_ref().and_then(|landmarks| {
        let scale = size as f32 / REFERENCE_CANVAS;
        let reference = REFERENCE_LANDMARKS_112.map(|(x, y)| (x * scale, y * scale));
        Similarity::estimate(landmarks, &reference)?.inverse()
    });

    match transform {
        Some(to_frame) => GrayImage::from_fn(size, size, |x, y| {
            Luma([sample(frame, to_frame.apply((x as f32, y as f32)))])
        }),
        None => crop_box(frame, face, size),
    }
}

/// Square crop centered on the box, resized to `size`.
fn crop_box(frame: &GrayImage, face: &FaceBox, size: u32) -> GrayImage {
    let (fw, fh) = frame.dimensions();
    let side = face.width.max(face.height).max(1.0);
    let cx = face.x + face.width / 2.0;
    let cy = face.y + face.height / 2.0;

    let left = (cx - side / 2.0).clamp(0.0, fw.saturating_sub(1) as f32) as u32;
    let top = (cy - side / 2.0).clamp(0.0, fh.saturating_sub(1) as f32) as u32;
    let width = (side as u32).min(fw - left).max(1);
    let height = (side as u32).min(fh - top).max(1);

    let crop = image::imageops::crop_imm(frame, left, top, width, height).to_image();
    image::imageops::resize(&crop, size, size, FilterType::Triangle)
}

/// Bilinear sample; outside the frame reads as black.
fn sample(frame: &GrayImage, (x, y): (f32, f32)) -> u8 {
    let (w, h) = (frame.width() as i64, frame.height() as i64);
    let (x0, y0) = (x.floor(), y.floor());
    let (fx, fy) = (x - x0, y - y0);
    let (x0, y0) = (x0 as i64, y0 as i64);

    let at = |px: i64, py: i64| -> f32 {
        if px < 0 || py < 0 || px >= w || py >= h {
            0.0
        } else {
            frame.get_pixel(px as u32, py as u32).0[0] as f32
        }
    };

    let top = at(x0, y0) * (1.0 - fx) + at(x0 + 1, y0) * fx;
    let bottom = at(x0, y0 + 1) * (1.0 - fx) + at(x0 + 1, y0 + 1) * fx;
    (top * (1.0 - fy) + bottom * fy).round().clamp(0.0, 255.0) as u8
}
