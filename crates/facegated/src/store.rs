//! SQLite-backed enrollment storage.
//!
//! Each row is one enrolled descriptor, stored as its JSON wire record
//! (`{"descriptor": [...]}`) so listing returns exactly what was registered.

use async_trait::async_trait;
use facegate_core::store::group_descriptors;
use facegate_core::{
    Descriptor, EnrollmentRecord, EnrollmentStore, Identity, PersistError, StoredDescriptor,
};
use std::path::Path;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS faces (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    identity    TEXT NOT NULL,
    descriptor  TEXT NOT NULL,
    created_at  TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS faces_identity ON faces(identity);
";

/// Enrollment store on a single SQLite connection.
pub struct SqliteStore {
    conn: tokio_rusqlite::Connection,
}

impl SqliteStore {
    /// Open (and create if needed) the database at `path`.
    pub async fn open(path: &Path) -> Result<Self, PersistError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| PersistError::Write(format!("{}: {e}", parent.display())))?;
        }
        let conn = tokio_rusqlite::Connection::open(path)
            .await
            .map_err(|e| PersistError::Read(format!("{}: {e}", path.display())))?;
        tracing::info!(path = %path.display(), "opened enrollment database");
        Self::init(conn).await
    }

    pub async fn open_in_memory() -> Result<Self, PersistError> {
        let conn = tokio_rusqlite::Connection::open_in_memory()
            .await
            .map_err(|e| PersistError::Read(e.to_string()))?;
        Self::init(conn).await
    }

    async fn init(conn: tokio_rusqlite::Connection) -> Result<Self, PersistError> {
        conn.call(|conn| {
            conn.execute_batch(SCHEMA)?;
            Ok(())
        })
        .await
        .map_err(|e| PersistError::Write(format!("schema: {e}")))?;
        Ok(Self { conn })
    }
}

#[async_trait]
impl EnrollmentStore for SqliteStore {
    async fn list_enrollments(&self) -> Result<Vec<EnrollmentRecord>, PersistError> {
        Ok(group_descriptors(self.list_descriptors().await?))
    }

    async fn list_descriptors(&self) -> Result<Vec<StoredDescriptor>, PersistError> {
        let rows = self
            .conn
            .call(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, identity, descriptor, created_at FROM faces ORDER BY id",
                )?;
                let rows = stmt
                    .query_map([], |row| {
                        Ok((
                            row.get::<_, i64>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, String>(2)?,
                            row.get::<_, String>(3)?,
                        ))
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
            .map_err(|e| PersistError::Read(e.to_string()))?;

        rows.into_iter()
            .map(|(id, identity, json, created_at)| {
                let descriptor: Descriptor = serde_json::from_str(&json)
                    .map_err(|e| PersistError::Corrupt { id, reason: e.to_string() })?;
                Ok(StoredDescriptor {
                    id,
                    identity: Identity(identity),
                    descriptor,
                    created_at,
                })
            })
            .collect()
    }

    async fn save_enrollment(
        &self,
        identity: &Identity,
        descriptor: &Descriptor,
    ) -> Result<(), PersistError> {
        let json = serde_json::to_string(descriptor)
            .map_err(|e| PersistError::Write(e.to_string()))?;
        let identity = identity.0.clone();
        let created_at = chrono::Utc::now().to_rfc3339();

        let id = self
            .conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO faces (identity, descriptor, created_at) VALUES (?1, ?2, ?3)",
                    rusqlite::params![identity, json, created_at],
                )?;
                Ok(conn.last_insert_rowid())
            })
            .await
            .map_err(|e| PersistError::Write(e.to_string()))?;

        tracing::debug!(id, "descriptor stored");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(values: Vec<f64>) -> Descriptor {
        Descriptor { descriptor: values }
    }

    #[tokio::test]
    async fn test_save_and_list_preserves_order() {
        let store = SqliteStore::open_in_memory().await.unwrap();
        let values = vec![0.5, -0.25, 0.125, 1.0e-3];
        store.save_enrollment(&"alice".into(), &descriptor(values.clone())).await.unwrap();
        store.save_enrollment(&"bob".into(), &descriptor(vec![0.0; 4])).await.unwrap();
        store.save_enrollment(&"alice".into(), &descriptor(vec![1.0; 4])).await.unwrap();

        let rows = store.list_descriptors().await.unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].descriptor.descriptor, values);
        assert!(rows[0].id < rows[1].id);
        assert!(!rows[0].created_at.is_empty());

        let records = store.list_enrollments().await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].identity.as_str(), "alice");
        assert_eq!(records[0].embeddings.len(), 2);
        assert_eq!(records[1].identity.as_str(), "bob");
    }

    #[tokio::test]
    async fn test_descriptor_lists_back_unchanged() {
        let store = SqliteStore::open_in_memory().await.unwrap();
        let values = vec![0.1234567891, -0.9876543219, 0.1];
        store.save_enrollment(&"carol".into(), &descriptor(values.clone())).await.unwrap();

        let rows = store.list_descriptors().await.unwrap();
        assert_eq!(rows[0].descriptor.descriptor, values);
        assert_eq!(
            serde_json::to_string(&rows[0].descriptor).unwrap(),
            r#"{"descriptor":[0.1234567891,-0.9876543219,0.1]}"#
        );
    }

    #[tokio::test]
    async fn test_empty_database() {
        let store = SqliteStore::open_in_memory().await.unwrap();
        assert!(store.list_enrollments().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_corrupt_row_is_reported() {
        let store = SqliteStore::open_in_memory().await.unwrap();
        store
            .conn
            .call(|conn| {
                conn.execute(
                    "INSERT INTO faces (identity, descriptor, created_at) VALUES ('x', 'not json', '')",
                    [],
                )?;
                Ok(())
            })
            .await
            .unwrap();

        let err = store.list_enrollments().await.unwrap_err();
        assert!(matches!(err, PersistError::Corrupt { id: 1, .. }));
    }
}
