use crate::mode::{Mode, ModeRequest};
use crate::scheduler::CaptureScheduler;
use crate::sink::LatestDetection;
use facegate_core::{Descriptor, EnrollmentStore, GalleryStore, Identity};
use std::sync::Arc;
use zbus::interface;

/// D-Bus control surface for the capture session.
///
/// Bus name: org.facegate.Session1
/// Object path: /org/facegate/Session1
pub struct SessionService {
    pub scheduler: Arc<CaptureScheduler>,
    pub gallery: Arc<GalleryStore>,
    pub store: Arc<dyn EnrollmentStore>,
    pub latest: LatestDetection,
    pub session_id: uuid::Uuid,
}

fn parse_mode(mode: &str) -> zbus::fdo::Result<Mode> {
    mode.parse()
        .map_err(|e: crate::mode::ParseModeError| zbus::fdo::Error::InvalidArgs(e.to_string()))
}

fn failed(e: impl std::fmt::Display) -> zbus::fdo::Error {
    zbus::fdo::Error::Failed(e.to_string())
}

impl SessionService {
    fn identity(identity: &str) -> zbus::fdo::Result<Identity> {
        let identity = identity.trim();
        if identity.is_empty() {
            return Err(zbus::fdo::Error::InvalidArgs("identity must not be empty".into()));
        }
        Ok(Identity::from(identity))
    }

    fn embedding_count(&self, identity: &Identity) -> u32 {
        self.gallery
            .snapshot()
            .get(identity)
            .map(|r| r.embeddings.len() as u32)
            .unwrap_or(0)
    }
}

#[interface(name = "org.facegate.Session1")]
impl SessionService {
    /// Start capturing in the given mode ("face" or "qr").
    async fn start(&self, mode: &str) -> zbus::fdo::Result<()> {
        let mode = parse_mode(mode)?;
        tracing::info!(mode = %mode, "start requested");
        self.scheduler.start(mode).await.map_err(failed)
    }

    /// Stop capturing and release the camera.
    async fn stop(&self) -> zbus::fdo::Result<()> {
        tracing::info!("stop requested");
        self.scheduler.stop();
        Ok(())
    }

    /// Switch detection mode. Returns "unchanged" or "switched".
    async fn set_mode(&self, mode: &str) -> zbus::fdo::Result<String> {
        let mode = parse_mode(mode)?;
        tracing::info!(mode = %mode, "mode change requested");
        let request = self.scheduler.switch_mode(mode).await.map_err(failed)?;
        Ok(match request {
            ModeRequest::Unchanged => "unchanged",
            _ => "switched",
        }
        .to_string())
    }

    /// Register a `{"descriptor": [...]}` record for `identity`.
    /// Returns the number of embeddings now enrolled for the identity.
    async fn enroll(&self, identity: &str, descriptor_json: &str) -> zbus::fdo::Result<u32> {
        let identity = Self::identity(identity)?;
        let descriptor: Descriptor = serde_json::from_str(descriptor_json)
            .map_err(|e| zbus::fdo::Error::InvalidArgs(format!("descriptor: {e}")))?;
        tracing::info!(identity = %identity, dims = descriptor.descriptor.len(), "enroll requested");

        self.gallery
            .enroll(identity.clone(), descriptor, self.store.as_ref())
            .await
            .map_err(failed)?;
        Ok(self.embedding_count(&identity))
    }

    /// Capture a frame from the live face stream and enroll it.
    async fn enroll_capture(&self, identity: &str) -> zbus::fdo::Result<u32> {
        let identity = Self::identity(identity)?;
        tracing::info!(identity = %identity, "capture enroll requested");

        let embedding = self.scheduler.capture_embedding().await.map_err(failed)?;
        self.gallery
            .enroll(identity.clone(), embedding, self.store.as_ref())
            .await
            .map_err(failed)?;
        Ok(self.embedding_count(&identity))
    }

    /// List stored descriptors as a JSON array.
    async fn list_enrollments(&self) -> zbus::fdo::Result<String> {
        let rows = self.store.list_descriptors().await.map_err(failed)?;
        serde_json::to_string(&rows).map_err(failed)
    }

    /// Rebuild the gallery from storage. Returns the number of identities.
    async fn reload(&self) -> zbus::fdo::Result<u32> {
        let gallery = self.gallery.reload(self.store.as_ref()).await.map_err(failed)?;
        self.scheduler.loaded();
        Ok(gallery.len() as u32)
    }

    /// Return session status as JSON.
    async fn status(&self) -> zbus::fdo::Result<String> {
        let gallery = self.gallery.snapshot();
        let latest = self.latest.lock().unwrap_or_else(|e| e.into_inner()).clone();
        Ok(serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "session": self.session_id.to_string(),
            "mode": self.scheduler.mode(),
            "status": self.scheduler.status(),
            "streaming": self.scheduler.is_streaming(),
            "generation": self.scheduler.generation(),
            "identities": gallery.len(),
            "embeddings": gallery.embedding_count(),
            "dimension": gallery.dimension(),
            "last_detection": latest,
        })
        .to_string())
    }
}
