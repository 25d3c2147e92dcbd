//! In-memory gallery of enrolled identities.
//!
//! The active gallery is an immutable `Arc<Gallery>` snapshot. Loads and
//! enrollments build a new snapshot and swap the reference, so a match
//! running against an older snapshot is never disturbed.

use crate::store::{EnrollmentStore, PersistError};
use crate::types::{Descriptor, Embedding, EnrollmentRecord, Identity};
use std::sync::{Arc, OnceLock, RwLock};
use thiserror::Error;
use tokio::sync::Mutex;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("embedding is empty")]
    EmptyEmbedding,
    #[error("embedding contains a non-finite value")]
    NonFinite,
}

#[derive(Error, Debug)]
pub enum EnrollError {
    #[error("embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("embedding is empty: no face detected")]
    EmptyEmbedding,
    #[error("embedding contains a non-finite value")]
    NonFinite,
    #[error("persist: {0}")]
    Persist(#[from] PersistError),
}

#[derive(Error, Debug)]
pub enum ReloadError {
    #[error("persist: {0}")]
    Persist(#[from] PersistError),
    #[error("validation: {0}")]
    Validation(#[from] ValidationError),
}

/// Ordered enrollment records sharing one embedding dimension.
#[derive(Debug, Clone, Default)]
pub struct Gallery {
    records: Vec<EnrollmentRecord>,
    dimension: Option<usize>,
}

impl Gallery {
    pub fn records(&self) -> &[EnrollmentRecord] {
        &self.records
    }

    pub fn dimension(&self) -> Option<usize> {
        self.dimension
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Number of enrolled identities.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Total number of embeddings across all identities.
    pub fn embedding_count(&self) -> usize {
        self.records.iter().map(|r| r.embeddings.len()).sum()
    }

    pub fn get(&self, identity: &Identity) -> Option<&EnrollmentRecord> {
        self.records.iter().find(|r| &r.identity == identity)
    }

    fn push(&mut self, identity: Identity, embedding: Embedding) {
        match self.records.iter_mut().find(|r| r.identity == identity) {
            Some(record) => record.embeddings.push(embedding),
            None => self.records.push(EnrollmentRecord::new(identity, vec![embedding])),
        }
    }
}

/// Owner of the session gallery and its fixed embedding dimension.
///
/// The dimension D is established by the first embedding the store ever
/// accepts and stays fixed for the lifetime of the store. Enrollments and
/// reloads are serialized so nothing reaches storage that the gallery
/// would later refuse to load.
#[derive(Default)]
pub struct GalleryStore {
    active: RwLock<Arc<Gallery>>,
    dimension: OnceLock<usize>,
    writes: Mutex<()>,
}

impl GalleryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store with a dimension fixed up front (e.g. by the embedding model).
    pub fn with_dimension(dimension: usize) -> Self {
        let store = Self::default();
        let _ = store.dimension.set(dimension);
        store
    }

    pub fn dimension(&self) -> Option<usize> {
        self.dimension.get().copied()
    }

    /// Current snapshot. Cheap: clones the `Arc`.
    pub fn snapshot(&self) -> Arc<Gallery> {
        self.active
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Replace the active gallery with `records`.
    ///
    /// All-or-nothing: on error the previous gallery stays active.
    pub fn load(&self, records: Vec<EnrollmentRecord>) -> Result<Arc<Gallery>, ValidationError> {
        let mut expected = self.dimension();
        for embedding in records.iter().flat_map(|r| r.embeddings.iter()) {
            if embedding.is_empty() {
                return Err(ValidationError::EmptyEmbedding);
            }
            if !embedding.is_finite() {
                return Err(ValidationError::NonFinite);
            }
            match expected {
                Some(d) if d != embedding.len() => {
                    return Err(ValidationError::DimensionMismatch {
                        expected: d,
                        actual: embedding.len(),
                    });
                }
                Some(_) => {}
                None => expected = Some(embedding.len()),
            }
        }

        // Merge duplicate identities so each identity owns a single record.
        let mut gallery = Gallery {
            records: Vec::with_capacity(records.len()),
            dimension: expected,
        };
        for record in records {
            for embedding in record.embeddings {
                gallery.push(record.identity.clone(), embedding);
            }
        }

        if let Some(d) = expected {
            let _ = self.dimension.set(d);
        }

        let gallery = Arc::new(gallery);
        *self.active.write().unwrap_or_else(|e| e.into_inner()) = gallery.clone();

        tracing::info!(
            identities = gallery.len(),
            embeddings = gallery.embedding_count(),
            dimension = ?gallery.dimension(),
            "gallery loaded"
        );
        Ok(gallery)
    }

    /// Rebuild the gallery from persistence.
    pub async fn reload(&self, store: &dyn EnrollmentStore) -> Result<Arc<Gallery>, ReloadError> {
        let _writes = self.writes.lock().await;
        let records = store.list_enrollments().await?;
        Ok(self.load(records)?)
    }

    /// Validate an embedding for enrollment without writing it anywhere.
    pub fn validate(&self, embedding: &Embedding) -> Result<(), EnrollError> {
        if embedding.is_empty() {
            return Err(EnrollError::EmptyEmbedding);
        }
        if !embedding.is_finite() {
            return Err(EnrollError::NonFinite);
        }
        match self.dimension() {
            Some(d) if d != embedding.len() => Err(EnrollError::DimensionMismatch {
                expected: d,
                actual: embedding.len(),
            }),
            _ => Ok(()),
        }
    }

    /// Add a descriptor to `identity`, persisting it first.
    ///
    /// The in-memory gallery is only updated after `store` acknowledges
    /// the write. The stored record keeps the descriptor's full precision.
    pub async fn enroll(
        &self,
        identity: Identity,
        descriptor: impl Into<Descriptor>,
        store: &dyn EnrollmentStore,
    ) -> Result<(), EnrollError> {
        let descriptor = descriptor.into();
        let embedding = Embedding::from(&descriptor);

        let _writes = self.writes.lock().await;
        self.validate(&embedding)?;

        store.save_enrollment(&identity, &descriptor).await?;

        let len = embedding.len();
        let d = *self.dimension.get_or_init(|| len);
        if d != len {
            // Only reachable through a direct `load` racing this call.
            return Err(EnrollError::DimensionMismatch {
                expected: d,
                actual: len,
            });
        }

        let mut active = self.active.write().unwrap_or_else(|e| e.into_inner());
        let mut next = Gallery::clone(&active);
        next.dimension = Some(d);
        next.push(identity.clone(), embedding);
        *active = Arc::new(next);

        tracing::info!(
            identity = %identity,
            embeddings = active.get(&identity).map(|r| r.embeddings.len()).unwrap_or(0),
            "enrolled embedding"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use async_trait::async_trait;

    fn record(identity: &str, embeddings: &[&[f32]]) -> EnrollmentRecord {
        EnrollmentRecord::new(
            identity,
            embeddings.iter().map(|e| Embedding::new(e.to_vec())).collect(),
        )
    }

    struct FailingStore;

    #[async_trait]
    impl EnrollmentStore for FailingStore {
        async fn list_enrollments(&self) -> Result<Vec<EnrollmentRecord>, PersistError> {
            Err(PersistError::Read("offline".into()))
        }

        async fn list_descriptors(
            &self,
        ) -> Result<Vec<crate::types::StoredDescriptor>, PersistError> {
            Err(PersistError::Read("offline".into()))
        }

        async fn save_enrollment(&self, _: &Identity, _: &Descriptor) -> Result<(), PersistError> {
            Err(PersistError::Write("disk full".into()))
        }
    }

    /// Memory store whose writes yield to the scheduler before landing.
    #[derive(Default)]
    struct YieldingStore {
        inner: MemoryStore,
    }

    #[async_trait]
    impl EnrollmentStore for YieldingStore {
        async fn list_enrollments(&self) -> Result<Vec<EnrollmentRecord>, PersistError> {
            self.inner.list_enrollments().await
        }

        async fn list_descriptors(
            &self,
        ) -> Result<Vec<crate::types::StoredDescriptor>, PersistError> {
            self.inner.list_descriptors().await
        }

        async fn save_enrollment(
            &self,
            identity: &Identity,
            descriptor: &Descriptor,
        ) -> Result<(), PersistError> {
            tokio::task::yield_now().await;
            self.inner.save_enrollment(identity, descriptor).await
        }
    }

    #[test]
    fn test_load_sets_dimension_from_first_embedding() {
        let store = GalleryStore::new();
        let gallery = store
            .load(vec![record("alice", &[&[1.0, 0.0, 0.0]]), record("bob", &[&[0.0, 1.0, 0.0]])])
            .unwrap();
        assert_eq!(gallery.len(), 2);
        assert_eq!(gallery.dimension(), Some(3));
        assert_eq!(store.dimension(), Some(3));
    }

    #[test]
    fn test_load_rejects_mismatched_dimension() {
        let store = GalleryStore::new();
        let err = store
            .load(vec![record("alice", &[&[1.0, 0.0, 0.0]]), record("bob", &[&[0.0, 1.0]])])
            .unwrap_err();
        assert_eq!(err, ValidationError::DimensionMismatch { expected: 3, actual: 2 });
        assert!(store.snapshot().is_empty());
    }

    #[test]
    fn test_failed_load_keeps_previous_gallery() {
        let store = GalleryStore::new();
        store.load(vec![record("alice", &[&[1.0, 0.0]])]).unwrap();
        assert!(store.load(vec![record("bob", &[&[1.0, 0.0, 0.0]])]).is_err());
        let snapshot = store.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert!(snapshot.get(&"alice".into()).is_some());
    }

    #[test]
    fn test_load_merges_duplicate_identities() {
        let store = GalleryStore::new();
        let gallery = store
            .load(vec![record("alice", &[&[1.0, 0.0]]), record("alice", &[&[0.9, 0.1]])])
            .unwrap();
        assert_eq!(gallery.len(), 1);
        assert_eq!(gallery.embedding_count(), 2);
    }

    #[test]
    fn test_old_snapshot_survives_reload() {
        let store = GalleryStore::new();
        store.load(vec![record("alice", &[&[1.0, 0.0]])]).unwrap();
        let before = store.snapshot();
        store.load(vec![record("bob", &[&[0.0, 1.0]])]).unwrap();
        assert!(before.get(&"alice".into()).is_some());
        assert!(store.snapshot().get(&"alice".into()).is_none());
    }

    #[tokio::test]
    async fn test_enroll_rejects_empty_embedding() {
        let store = GalleryStore::new();
        let persist = MemoryStore::new();
        let err = store
            .enroll("alice".into(), Embedding::new(vec![]), &persist)
            .await
            .unwrap_err();
        assert!(matches!(err, EnrollError::EmptyEmbedding));
        assert!(persist.list_descriptors().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_enroll_rejects_dimension_mismatch() {
        let store = GalleryStore::with_dimension(3);
        let persist = MemoryStore::new();
        let err = store
            .enroll("alice".into(), Embedding::new(vec![1.0, 0.0]), &persist)
            .await
            .unwrap_err();
        assert!(matches!(err, EnrollError::DimensionMismatch { expected: 3, actual: 2 }));
    }

    #[tokio::test]
    async fn test_enroll_appends_to_existing_identity() {
        let store = GalleryStore::new();
        let persist = MemoryStore::new();
        store.enroll("alice".into(), Embedding::new(vec![1.0, 0.0]), &persist).await.unwrap();
        store.enroll("alice".into(), Embedding::new(vec![0.9, 0.1]), &persist).await.unwrap();
        store.enroll("bob".into(), Embedding::new(vec![0.0, 1.0]), &persist).await.unwrap();

        let gallery = store.snapshot();
        assert_eq!(gallery.len(), 2);
        assert_eq!(gallery.records()[0].identity.as_str(), "alice");
        assert_eq!(gallery.records()[0].embeddings.len(), 2);
        assert_eq!(persist.list_descriptors().await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_enroll_not_applied_when_persist_fails() {
        let store = GalleryStore::new();
        let err = store
            .enroll("alice".into(), Embedding::new(vec![1.0, 0.0]), &FailingStore)
            .await
            .unwrap_err();
        assert!(matches!(err, EnrollError::Persist(_)));
        assert!(store.snapshot().is_empty());
        assert_eq!(store.dimension(), None);
    }

    #[tokio::test]
    async fn test_reload_from_store() {
        let persist = MemoryStore::new();
        persist
            .save_enrollment(&"alice".into(), &Descriptor { descriptor: vec![1.0, 0.0] })
            .await
            .unwrap();
        let store = GalleryStore::new();
        let gallery = store.reload(&persist).await.unwrap();
        assert_eq!(gallery.len(), 1);

        let err = store.reload(&FailingStore).await.unwrap_err();
        assert!(matches!(err, ReloadError::Persist(_)));
        assert_eq!(store.snapshot().len(), 1);
    }

    #[tokio::test]
    async fn test_enroll_rejects_non_finite_embedding() {
        let store = GalleryStore::new();
        let persist = MemoryStore::new();
        let err = store
            .enroll("alice".into(), Embedding::new(vec![0.5, f32::NAN]), &persist)
            .await
            .unwrap_err();
        assert!(matches!(err, EnrollError::NonFinite));
        assert!(persist.list_descriptors().await.unwrap().is_empty());

        let err = store
            .load(vec![record("bob", &[&[f32::INFINITY, 0.0]])])
            .unwrap_err();
        assert_eq!(err, ValidationError::NonFinite);
    }

    #[tokio::test]
    async fn test_concurrent_first_enrollments_never_store_a_rejected_row() {
        let store = GalleryStore::new();
        let persist = YieldingStore::default();

        let (first, second) = tokio::join!(
            store.enroll("alice".into(), Embedding::new(vec![1.0, 0.0, 0.0]), &persist),
            store.enroll("bob".into(), Embedding::new(vec![0.0, 1.0]), &persist),
        );

        assert!(first.is_ok());
        assert!(matches!(
            second,
            Err(EnrollError::DimensionMismatch { expected: 3, actual: 2 })
        ));
        assert_eq!(persist.list_descriptors().await.unwrap().len(), 1);

        let reloaded = store.reload(&persist).await.unwrap();
        assert_eq!(reloaded.len(), 1);
    }

    #[tokio::test]
    async fn test_enroll_stores_descriptor_at_full_precision() {
        let store = GalleryStore::new();
        let persist = MemoryStore::new();
        let descriptor = Descriptor { descriptor: vec![0.1234567891, -0.5] };
        store.enroll("alice".into(), descriptor.clone(), &persist).await.unwrap();

        let rows = persist.list_descriptors().await.unwrap();
        assert_eq!(rows[0].descriptor, descriptor);
        assert_eq!(store.snapshot().embedding_count(), 1);
    }
}
