//! Capture scheduler: owns the camera stream and the polling timer.
//!
//! One scheduler drives both modes. Each tick pulls a frame and runs the
//! mode's pipeline; results are published only if the session is still
//! on the generation that spawned the detection. `stop()` bumps the
//! generation, aborts the timer and releases the stream, so nothing started
//! by an older generation can publish or keep the camera open. A capture
//! blocked on the device never holds up `stop()`: the stream is stopped as
//! soon as that capture returns.

use crate::mode::{Mode, ModeController, ModeRequest};
use crate::pipeline::{Detection, EmbeddingExtractor, ExtractError, QrDecoder};
use crate::sink::ResultSink;
use facegate_core::{EnrollError, Embedding, GalleryStore, Matcher};
use facegate_hw::{CameraSource, CameraStream, CaptureError, Frame};
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, TryLockError, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

#[derive(Error, Debug)]
pub enum StartError {
    #[error("gallery is not loaded; reload enrollments first")]
    GalleryUnavailable,
    #[error("camera: {0}")]
    Capture(#[from] CaptureError),
}

#[derive(Error, Debug)]
pub enum CaptureEnrollError {
    #[error("no active camera stream")]
    NotStreaming,
    #[error("capture interrupted by a stop or mode switch")]
    Interrupted,
    #[error("enrollment capture requires face mode (active: {0})")]
    WrongMode(Mode),
    #[error("camera: {0}")]
    Capture(#[from] CaptureError),
    #[error("extract: {0}")]
    Extract(#[from] ExtractError),
    #[error("enroll: {0}")]
    Enroll(#[from] EnrollError),
}

/// Lifecycle status of the capture session.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", content = "message", rename_all = "lowercase")]
pub enum SessionStatus {
    /// Gallery not yet loaded.
    Loading,
    /// No stream held.
    Idle,
    Ready,
    Detecting,
    Error(String),
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionStatus::Loading => f.write_str("loading"),
            SessionStatus::Idle => f.write_str("idle"),
            SessionStatus::Ready => f.write_str("ready"),
            SessionStatus::Detecting => f.write_str("detecting"),
            SessionStatus::Error(msg) => write!(f, "error: {msg}"),
        }
    }
}

/// Collaborators the scheduler dispatches frames to.
#[derive(Clone)]
pub struct Pipeline {
    pub extractor: Arc<dyn EmbeddingExtractor>,
    pub decoder: Arc<dyn QrDecoder>,
    pub gallery: Arc<GalleryStore>,
    pub matcher: Arc<dyn Matcher>,
    pub sink: Arc<dyn ResultSink>,
}

/// The open stream plus a release flag checked before every capture.
struct StreamSlot {
    stream: Mutex<Box<dyn CameraStream>>,
    released: AtomicBool,
}

impl StreamSlot {
    fn new(stream: Box<dyn CameraStream>) -> Self {
        Self {
            stream: Mutex::new(stream),
            released: AtomicBool::new(false),
        }
    }

    fn capture(&self) -> Result<Frame, CaptureError> {
        if self.released.load(Ordering::SeqCst) {
            return Err(CaptureError::Stopped);
        }
        let mut stream = self.stream.lock().unwrap_or_else(|e| e.into_inner());
        if self.released.load(Ordering::SeqCst) {
            return Err(CaptureError::Stopped);
        }
        stream.capture()
    }

    /// Stop the stream without waiting on a capture in progress.
    fn release(self: Arc<Self>) {
        self.released.store(true, Ordering::SeqCst);
        let busy = match self.stream.try_lock() {
            Ok(mut stream) => {
                stream.stop();
                false
            }
            Err(TryLockError::Poisoned(e)) => {
                e.into_inner().stop();
                false
            }
            Err(TryLockError::WouldBlock) => true,
        };
        if busy {
            tracing::debug!("capture in progress; stream stops when it returns");
            std::thread::spawn(move || {
                self.stream.lock().unwrap_or_else(|e| e.into_inner()).stop();
            });
        }
    }
}

struct SessionState {
    controller: ModeController,
    status: SessionStatus,
    stream: Option<Arc<StreamSlot>>,
    timer: Option<JoinHandle<()>>,
    generation: u64,
    /// Set by `loaded()`, cleared by `fail()`.
    gallery_loaded: bool,
}

struct Shared {
    camera: Arc<dyn CameraSource>,
    pipeline: Pipeline,
    interval: Duration,
    state: Mutex<SessionState>,
}

/// Drives periodic detection over a single camera stream.
pub struct CaptureScheduler {
    shared: Arc<Shared>,
    /// Serializes start / switch so only one stream is ever being acquired.
    control: tokio::sync::Mutex<()>,
}

impl CaptureScheduler {
    pub fn new(
        camera: Arc<dyn CameraSource>,
        pipeline: Pipeline,
        initial_mode: Mode,
        interval: Duration,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                camera,
                pipeline,
                interval,
                state: Mutex::new(SessionState {
                    controller: ModeController::new(initial_mode),
                    status: SessionStatus::Loading,
                    stream: None,
                    timer: None,
                    generation: 0,
                    gallery_loaded: false,
                }),
            }),
            control: tokio::sync::Mutex::new(()),
        }
    }

    pub fn status(&self) -> SessionStatus {
        self.shared.lock().status.clone()
    }

    pub fn mode(&self) -> Mode {
        self.shared.lock().controller.active()
    }

    pub fn generation(&self) -> u64 {
        self.shared.lock().generation
    }

    /// True while a stream is held and the polling timer is armed.
    pub fn is_streaming(&self) -> bool {
        let state = self.shared.lock();
        state.stream.is_some() && state.timer.is_some()
    }

    /// Mark the gallery as loaded; the session may now be started.
    /// Clears a previous error once nothing is streaming.
    pub fn loaded(&self) {
        let mut state = self.shared.lock();
        state.gallery_loaded = true;
        let recoverable = matches!(state.status, SessionStatus::Loading | SessionStatus::Error(_));
        if recoverable && state.stream.is_none() {
            state.status = SessionStatus::Idle;
        }
    }

    /// Tear down and put the session into the error state.
    /// Starting is refused until the gallery is loaded again.
    pub fn fail(&self, message: impl Into<String>) {
        self.shared.stop();
        let message = message.into();
        tracing::error!(%message, "capture session failed");
        let mut state = self.shared.lock();
        state.gallery_loaded = false;
        state.status = SessionStatus::Error(message);
    }

    /// Acquire a stream for `mode` and start polling.
    pub async fn start(&self, mode: Mode) -> Result<(), StartError> {
        let _control = self.control.lock().await;
        self.start_locked(mode).await
    }

    /// Switch to `mode`, tearing down the current pipeline first.
    ///
    /// A detection in flight is cancelled: its result is discarded.
    pub async fn switch_mode(&self, mode: Mode) -> Result<ModeRequest, StartError> {
        let _control = self.control.lock().await;
        self.shared.ensure_loaded()?;

        let request = {
            let mut state = self.shared.lock();
            let detecting = state.status == SessionStatus::Detecting;
            match state.controller.request(mode, detecting) {
                ModeRequest::Deferred(_) => {
                    state.generation += 1;
                    state.status = SessionStatus::Ready;
                    tracing::debug!(
                        generation = state.generation,
                        "in-flight detection cancelled by mode switch"
                    );
                    state.controller.settle().unwrap_or(ModeRequest::Unchanged)
                }
                other => other,
            }
        };

        match request {
            ModeRequest::Unchanged if self.is_streaming() => {}
            ModeRequest::Switch { from, to } => {
                tracing::info!(from = %from, to = %to, "switching mode");
                self.start_locked(to).await?;
            }
            _ => self.start_locked(mode).await?,
        }
        Ok(request)
    }

    /// Stop polling and release the camera. Idempotent, callable from any state.
    pub fn stop(&self) {
        self.shared.stop();
    }

    /// Pull one frame from the active stream and extract the embedding of
    /// its best-scoring face.
    pub async fn capture_embedding(&self) -> Result<Embedding, CaptureEnrollError> {
        let (stream, generation) = {
            let state = self.shared.lock();
            let mode = state.controller.active();
            if mode != Mode::Face {
                return Err(CaptureEnrollError::WrongMode(mode));
            }
            let stream = state.stream.clone().ok_or(CaptureEnrollError::NotStreaming)?;
            (stream, state.generation)
        };

        let frame = capture_frame(stream).await?;
        let faces = self
            .shared
            .pipeline
            .extractor
            .extract(Arc::new(frame))
            .await?;

        let current = self.shared.lock().generation;
        if current != generation {
            tracing::debug!(generation, current, "discarding interrupted capture");
            return Err(CaptureEnrollError::Interrupted);
        }
        faces
            .into_iter()
            .next()
            .map(|face| face.embedding)
            .ok_or(CaptureEnrollError::Enroll(EnrollError::EmptyEmbedding))
    }

    async fn start_locked(&self, mode: Mode) -> Result<(), StartError> {
        self.shared.ensure_loaded()?;
        self.shared.stop();

        let expected_generation = {
            let mut state = self.shared.lock();
            state.controller.request(mode, false);
            state.generation
        };

        let camera = self.shared.camera.clone();
        let facing = mode.facing();
        let opened = tokio::task::spawn_blocking(move || camera.open(facing))
            .await
            .unwrap_or_else(|e| Err(CaptureError::CaptureFailed(format!("open task: {e}"))));

        let mut stream = match opened {
            Ok(stream) => stream,
            Err(e) => {
                tracing::error!(mode = %mode, facing = %facing, error = %e, "camera unavailable");
                self.shared.lock().status = SessionStatus::Error(e.to_string());
                return Err(e.into());
            }
        };

        let mut state = self.shared.lock();
        if state.generation != expected_generation {
            // stop() ran while the camera was opening.
            stream.stop();
            return Err(CaptureError::Stopped.into());
        }

        state.generation += 1;
        let generation = state.generation;
        state.stream = Some(Arc::new(StreamSlot::new(stream)));
        state.status = SessionStatus::Ready;
        state.timer = Some(tokio::spawn(poll_loop(
            Arc::downgrade(&self.shared),
            generation,
            self.shared.interval,
        )));

        tracing::info!(
            mode = %mode,
            facing = %facing,
            generation,
            interval_ms = self.shared.interval.as_millis() as u64,
            "capture started"
        );
        Ok(())
    }
}

impl Drop for CaptureScheduler {
    fn drop(&mut self) {
        self.shared.stop();
    }
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn ensure_loaded(&self) -> Result<(), StartError> {
        if self.lock().gallery_loaded {
            Ok(())
        } else {
            Err(StartError::GalleryUnavailable)
        }
    }

    fn stop(&self) {
        let mut state = self.lock();
        state.generation += 1;

        let had_timer = state.timer.take().map(|timer| timer.abort()).is_some();
        let stream = state.stream.take();

        if !matches!(state.status, SessionStatus::Error(_) | SessionStatus::Loading) {
            state.status = SessionStatus::Idle;
        }
        let generation = state.generation;
        drop(state);

        let had_stream = stream.map(StreamSlot::release).is_some();
        if had_timer || had_stream {
            tracing::info!(generation, "capture stopped");
        }
    }

    /// Handle one timer tick. Returns false once this generation is over.
    fn on_tick(self: &Arc<Self>, generation: u64) -> bool {
        let mut state = self.lock();
        if state.generation != generation {
            return false;
        }
        if state.status == SessionStatus::Detecting {
            tracing::debug!(generation, "tick dropped: detection in flight");
            return true;
        }
        let Some(stream) = state.stream.clone() else {
            return false;
        };
        let mode = state.controller.active();
        state.status = SessionStatus::Detecting;
        drop(state);

        let shared = self.clone();
        tokio::spawn(async move {
            let outcome = shared.detect(stream, mode).await;
            shared.complete(generation, mode, outcome);
        });
        true
    }

    /// Run one frame through the mode's pipeline. Face mode yields one
    /// detection per face, best detection score first.
    async fn detect(&self, stream: Arc<StreamSlot>, mode: Mode) -> Vec<Detection> {
        let frame = match capture_frame(stream).await {
            Ok(frame) => frame,
            Err(CaptureError::Stopped) => return Vec::new(),
            Err(e) => {
                tracing::warn!(error = %e, "frame capture failed; skipping tick");
                return Vec::new();
            }
        };
        if frame.is_dark {
            tracing::trace!(seq = frame.sequence, "dark frame skipped");
            return Vec::new();
        }
        let frame = Arc::new(frame);

        match mode {
            Mode::Face => {
                let faces = match self.pipeline.extractor.extract(frame).await {
                    Ok(faces) => faces,
                    Err(e) => {
                        tracing::warn!(error = %e, "embedding extraction failed");
                        return Vec::new();
                    }
                };
                if faces.is_empty() {
                    tracing::trace!("no face in frame");
                    return Vec::new();
                }
                let gallery = self.pipeline.gallery.snapshot();
                faces
                    .into_iter()
                    .filter_map(|face| {
                        match self.pipeline.matcher.find_best_match(&face.embedding, &gallery) {
                            Ok(result) => Some(Detection::Face {
                                result,
                                bbox: face.bbox,
                            }),
                            Err(e) => {
                                tracing::warn!(error = %e, "face embedding rejected");
                                None
                            }
                        }
                    })
                    .collect()
            }
            Mode::Qr => match self.pipeline.decoder.decode(frame).await {
                Ok(Some(text)) => vec![Detection::Qr { text }],
                Ok(None) => Vec::new(),
                Err(e) => {
                    tracing::trace!(error = %e, "qr decode failed");
                    Vec::new()
                }
            },
        }
    }

    /// Publish finished detections if their generation is still current.
    fn complete(&self, generation: u64, mode: Mode, outcome: Vec<Detection>) {
        let mut state = self.lock();
        if state.generation != generation {
            tracing::debug!(
                generation,
                current = state.generation,
                mode = %mode,
                "discarding stale detection"
            );
            return;
        }
        for detection in outcome {
            self.pipeline.sink.publish(detection);
        }
        state.status = SessionStatus::Ready;
    }
}

async fn capture_frame(stream: Arc<StreamSlot>) -> Result<Frame, CaptureError> {
    tokio::task::spawn_blocking(move || stream.capture())
        .await
        .unwrap_or_else(|e| Err(CaptureError::CaptureFailed(format!("capture task: {e}"))))
}

async fn poll_loop(shared: Weak<Shared>, generation: u64, period: Duration) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        ticker.tick().await;
        let Some(shared) = shared.upgrade() else {
            break;
        };
        if !shared.on_tick(generation) {
            break;
        }
    }
    tracing::debug!(generation, "poll loop exited");
}
