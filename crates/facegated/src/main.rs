use anyhow::{Context, Result};
use facegate_core::{EnrollmentStore, EuclideanMatcher, FaceDetector, FaceRecognizer, GalleryStore};
use facegate_hw::V4l2Source;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

mod config;
mod dbus_interface;
mod mode;
mod pipeline;
mod scheduler;
mod sink;
mod store;

use config::Config;
use dbus_interface::SessionService;
use pipeline::{OnnxExtractor, RqrrDecoder};
use scheduler::{CaptureScheduler, Pipeline};
use sink::{ChannelSink, LatestDetection};
use store::SqliteStore;

const BUS_NAME: &str = "org.facegate.Session1";
const OBJECT_PATH: &str = "/org/facegate/Session1";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = Config::load().context("loading configuration")?;
    tracing::info!(
        user_camera = %config.user_camera,
        environment_camera = %config.environment_camera,
        db = %config.db_path.display(),
        threshold = config.match_threshold,
        interval_ms = config.poll_interval_ms,
        "facegated starting"
    );

    let detector_path = config.detector_model_path.to_string_lossy().into_owned();
    let detector = FaceDetector::load(&detector_path).context("loading face detection model")?;
    let model_path = config.model_path.to_string_lossy().into_owned();
    let recognizer = FaceRecognizer::load(&model_path).context("loading embedding model")?;
    let gallery = Arc::new(GalleryStore::with_dimension(recognizer.dimension()));

    let store: Arc<dyn EnrollmentStore> = Arc::new(
        SqliteStore::open(&config.db_path)
            .await
            .context("opening enrollment database")?,
    );

    let (sink, results) = ChannelSink::new();
    let latest = LatestDetection::default();
    tokio::spawn(sink::run_presenter(results, latest.clone()));

    let camera = Arc::new(V4l2Source {
        user_device: config.user_camera.clone(),
        environment_device: config.environment_camera.clone(),
        warmup_frames: config.warmup_frames,
    });
    let pipeline = Pipeline {
        extractor: Arc::new(OnnxExtractor::new(detector, recognizer)),
        decoder: Arc::new(RqrrDecoder),
        gallery: gallery.clone(),
        matcher: Arc::new(EuclideanMatcher::new(config.match_threshold)),
        sink: Arc::new(sink),
    };
    let scheduler = Arc::new(CaptureScheduler::new(
        camera,
        pipeline,
        config.initial_mode,
        config.poll_interval(),
    ));

    match gallery.reload(store.as_ref()).await {
        Ok(_) => {
            scheduler.loaded();
            if config.autostart {
                if let Err(e) = scheduler.start(config.initial_mode).await {
                    tracing::warn!(error = %e, "autostart failed; waiting for Start");
                }
            }
        }
        // No automatic retry: the session waits for Reload / Start.
        Err(e) => scheduler.fail(format!("failed to load enrollments: {e}")),
    }

    let service = SessionService {
        scheduler: scheduler.clone(),
        gallery,
        store,
        latest,
        session_id: uuid::Uuid::new_v4(),
    };
    let _conn = zbus::connection::Builder::session()?
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, service)?
        .build()
        .await
        .context("registering D-Bus service")?;

    tracing::info!(bus = BUS_NAME, path = OBJECT_PATH, "facegated ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("facegated shutting down");
    scheduler.stop();

    Ok(())
}
