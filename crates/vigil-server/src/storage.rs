//! Evidence Store
//!
//! Annotated JPEG evidence lands on the object store as
//! `anomaly_frames/{shop_id}/{YYYYMMDD_HHMMSS}_{8hex}.jpg`. The returned
//! reference is the path relative to the store root, which is what the event
//! row records.

use std::path::{Path, PathBuf};

use chrono::Utc;
use tokio::fs;
use uuid::Uuid;

use crate::error::ServiceError;

#[derive(Debug, Clone)]
pub struct EvidenceStore {
    root: PathBuf,
}

impl EvidenceStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Write one JPEG, creating the per-shop directory on demand. Returns
    /// the relative reference stored on the event row.
    pub async fn save_jpeg(&self, shop_id: Uuid, bytes: &[u8]) -> Result<String, ServiceError> {
        let stamp = Utc::now().format("%Y%m%d_%H%M%S");
        let short = &Uuid::new_v4().simple().to_string()[..8];
        let relative = format!("anomaly_frames/{shop_id}/{stamp}_{short}.jpg");

        let full = self.root.join(&relative);
        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(&full, bytes).await?;
        Ok(relative)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_save_jpeg_layout_and_content() {
        let dir = tempfile::tempdir().unwrap();
        let store = EvidenceStore::new(dir.path());
        let shop_id = Uuid::new_v4();

        let reference = store.save_jpeg(shop_id, b"\xFF\xD8fake").await.unwrap();
        assert!(reference.starts_with(&format!("anomaly_frames/{shop_id}/")));
        assert!(reference.ends_with(".jpg"));

        let written = std::fs::read(dir.path().join(&reference)).unwrap();
        assert_eq!(written, b"\xFF\xD8fake");
    }

    #[tokio::test]
    async fn test_two_saves_get_distinct_references() {
        let dir = tempfile::tempdir().unwrap();
        let store = EvidenceStore::new(dir.path());
        let shop_id = Uuid::new_v4();

        let a = store.save_jpeg(shop_id, b"a").await.unwrap();
        let b = store.save_jpeg(shop_id, b"b").await.unwrap();
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn test_unwritable_root_fails() {
        let store = EvidenceStore::new("/proc/vigil-denied");
        let result = store.save_jpeg(Uuid::new_v4(), b"x").await;
        assert!(matches!(result, Err(ServiceError::Storage(_))));
    }
}
