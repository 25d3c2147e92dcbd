//! Nearest-neighbour matching of a query embedding against a gallery.

use crate::gallery::{Gallery, ValidationError};
use crate::types::{Embedding, MatchResult};

/// Default maximum Euclidean distance for a positive identification.
pub const DEFAULT_MATCH_THRESHOLD: f32 = 0.6;

/// Strategy for comparing a query embedding against a gallery of enrolled faces.
pub trait Matcher: Send + Sync {
    fn find_best_match(
        &self,
        query: &Embedding,
        gallery: &Gallery,
    ) -> Result<MatchResult, ValidationError>;
}

/// Euclidean-distance matcher with a best-of-multiple-shots policy.
///
/// Each identity is scored by the minimum distance over its embeddings.
/// The identity with the smallest score wins; on equal scores the one
/// enrolled first wins. Scores above `threshold` are reported as unknown.
#[derive(Debug, Clone, Copy)]
pub struct EuclideanMatcher {
    pub threshold: f32,
}

impl Default for EuclideanMatcher {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_MATCH_THRESHOLD,
        }
    }
}

impl EuclideanMatcher {
    pub fn new(threshold: f32) -> Self {
        Self { threshold }
    }
}

impl Matcher for EuclideanMatcher {
    fn find_best_match(
        &self,
        query: &Embedding,
        gallery: &Gallery,
    ) -> Result<MatchResult, ValidationError> {
        if query.is_empty() {
            return Err(ValidationError::EmptyEmbedding);
        }
        if !query.is_finite() {
            return Err(ValidationError::NonFinite);
        }
        if let Some(expected) = gallery.dimension() {
            if expected != query.len() {
                return Err(ValidationError::DimensionMismatch {
                    expected,
                    actual: query.len(),
                });
            }
        }

        let mut best_distance = f32::INFINITY;
        let mut best_idx: Option<usize> = None;

        // Always iterate every entry, no early exit.
        for (i, record) in gallery.records().iter().enumerate() {
            let score = record
                .embeddings
                .iter()
                .map(|e| query.euclidean_distance(e))
                .fold(f32::INFINITY, f32::min);
            // Strict `<` keeps the earliest record on ties.
            if score < best_distance {
                best_distance = score;
                best_idx = Some(i);
            }
        }

        let result = match best_idx {
            Some(idx) if best_distance <= self.threshold => MatchResult::new(
                Some(gallery.records()[idx].identity.clone()),
                best_distance,
            ),
            Some(_) => MatchResult::new(None, best_distance),
            None => MatchResult::unknown(),
        };

        tracing::trace!(
            label = result.label(),
            distance = result.distance,
            threshold = self.threshold,
            "match computed"
        );
        Ok(result)
    }
}
