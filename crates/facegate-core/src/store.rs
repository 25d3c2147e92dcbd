//! Persistence seam for enrolled embeddings.

use crate::types::{Descriptor, Embedding, EnrollmentRecord, Identity, StoredDescriptor};
use async_trait::async_trait;
use std::sync::Mutex;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PersistError {
    #[error("storage read failed: {0}")]
    Read(String),
    #[error("storage write failed: {0}")]
    Write(String),
    #[error("corrupt descriptor record {id}: {reason}")]
    Corrupt { id: i64, reason: String },
}

/// Durable storage of enrollments.
///
/// Implementations own the atomicity of a single write: once
/// `save_enrollment` returns `Ok`, the embedding must be visible to
/// every later `list_enrollments`.
#[async_trait]
pub trait EnrollmentStore: Send + Sync {
    /// All enrollments grouped by identity, in first-enrollment order.
    async fn list_enrollments(&self) -> Result<Vec<EnrollmentRecord>, PersistError>;

    /// Every stored descriptor in insertion order.
    async fn list_descriptors(&self) -> Result<Vec<StoredDescriptor>, PersistError>;

    /// Persist one descriptor exactly as given.
    async fn save_enrollment(
        &self,
        identity: &Identity,
        descriptor: &Descriptor,
    ) -> Result<(), PersistError>;
}

/// Group flat descriptor rows into records, preserving first-seen order.
pub fn group_descriptors(rows: Vec<StoredDescriptor>) -> Vec<EnrollmentRecord> {
    let mut records: Vec<EnrollmentRecord> = Vec::new();
    for row in rows {
        let embedding = Embedding::from(row.descriptor);
        match records.iter_mut().find(|r| r.identity == row.identity) {
            Some(record) => record.embeddings.push(embedding),
            None => records.push(EnrollmentRecord::new(row.identity, vec![embedding])),
        }
    }
    records
}

/// Process-local store. Nothing survives the process; useful for tests
/// and tools that enroll without a database.
#[derive(Default)]
pub struct MemoryStore {
    rows: Mutex<Vec<StoredDescriptor>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn rows(&self) -> std::sync::MutexGuard<'_, Vec<StoredDescriptor>> {
        self.rows.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl EnrollmentStore for MemoryStore {
    async fn list_enrollments(&self) -> Result<Vec<EnrollmentRecord>, PersistError> {
        Ok(group_descriptors(self.rows().clone()))
    }

    async fn list_descriptors(&self) -> Result<Vec<StoredDescriptor>, PersistError> {
        Ok(self.rows().clone())
    }

    async fn save_enrollment(
        &self,
        identity: &Identity,
        descriptor: &Descriptor,
    ) -> Result<(), PersistError> {
        let mut rows = self.rows();
        let id = rows.len() as i64 + 1;
        rows.push(StoredDescriptor {
            id,
            identity: identity.clone(),
            descriptor: descriptor.clone(),
            created_at: String::new(),
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_store_groups_by_identity_in_order() {
        let store = MemoryStore::new();
        store.save_enrollment(&"bob".into(), &Descriptor { descriptor: vec![0.0, 1.0] }).await.unwrap();
        store.save_enrollment(&"alice".into(), &Descriptor { descriptor: vec![1.0, 0.0] }).await.unwrap();
        store.save_enrollment(&"bob".into(), &Descriptor { descriptor: vec![0.0, 0.9] }).await.unwrap();

        let records = store.list_enrollments().await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].identity.as_str(), "bob");
        assert_eq!(records[0].embeddings.len(), 2);
        assert_eq!(records[0].embeddings[1].values, vec![0.0f32, 0.9]);
        assert_eq!(records[1].identity.as_str(), "alice");
    }

    #[tokio::test]
    async fn test_memory_store_lists_descriptors_unchanged() {
        let store = MemoryStore::new();
        let values = vec![0.3, -0.1, 0.7, 0.0];
        store.save_enrollment(&"carol".into(), &Descriptor { descriptor: values.clone() }).await.unwrap();

        let rows = store.list_descriptors().await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].descriptor.descriptor, values);
    }
}
