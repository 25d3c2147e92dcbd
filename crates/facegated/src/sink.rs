//! Delivery of detections to presentation.

use crate::pipeline::Detection;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

/// Receives published detections. Must not block the caller.
pub trait ResultSink: Send + Sync {
    fn publish(&self, detection: Detection);
}

/// Forwards detections over an unbounded channel.
#[derive(Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<Detection>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Detection>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl ResultSink for ChannelSink {
    fn publish(&self, detection: Detection) {
        if self.tx.send(detection).is_err() {
            tracing::debug!("result receiver closed; dropping detection");
        }
    }
}

/// Most recent detection, shared with the status endpoint.
pub type LatestDetection = Arc<Mutex<Option<Detection>>>;

/// Drain published detections: log each one and remember the latest.
pub async fn run_presenter(mut rx: mpsc::UnboundedReceiver<Detection>, latest: LatestDetection) {
    while let Some(detection) = rx.recv().await {
        match &detection {
            Detection::Face { result, bbox } if result.is_match() => tracing::info!(
                label = result.label(),
                confidence = result.confidence,
                distance = result.distance,
                x = bbox.x,
                y = bbox.y,
                width = bbox.width,
                height = bbox.height,
                "face: {result}"
            ),
            Detection::Face { result, bbox } => tracing::debug!(
                distance = result.distance,
                x = bbox.x,
                y = bbox.y,
                width = bbox.width,
                height = bbox.height,
                "unknown face"
            ),
            Detection::Qr { text } => tracing::info!(text = %text, "qr decoded"),
        }
        *latest.lock().unwrap_or_else(|e| e.into_inner()) = Some(detection);
    }
    tracing::debug!("presenter exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use facegate_core::{FaceBox, MatchResult};

    fn face(identity: &str) -> Detection {
        Detection::Face {
            result: MatchResult::new(Some(identity.into()), 0.1),
            bbox: FaceBox {
                x: 0.0,
                y: 0.0,
                width: 10.0,
                height: 10.0,
                score: 0.9,
                landmarks: None,
            },
        }
    }

    #[tokio::test]
    async fn test_presenter_keeps_latest() {
        let (sink, rx) = ChannelSink::new();
        let latest: LatestDetection = Arc::default();
        let task = tokio::spawn(run_presenter(rx, latest.clone()));

        sink.publish(Detection::Qr { text: "first".into() });
        sink.publish(face("alice"));
        drop(sink);
        task.await.unwrap();

        let latest = latest.lock().unwrap().clone();
        assert!(matches!(latest, Some(Detection::Face { ref result, .. }) if result.label() == "alice"));
    }

    #[test]
    fn test_publish_after_receiver_dropped_does_not_panic() {
        let (sink, rx) = ChannelSink::new();
        drop(rx);
        sink.publish(Detection::Qr { text: "lost".into() });
    }
}
