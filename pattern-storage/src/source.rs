//! Catalog loading through the disk and cloud tiers.

use async_trait::async_trait;
use pattern_core::{Catalog, CatalogError, CatalogSource};
use tracing::{error, info};

use crate::{DynBlobStore, StorageError, layout};

/// Reads `metadata/projects_data_<version>.txt`, disk first.
pub struct StoreCatalogSource {
    disk: DynBlobStore,
    cloud: DynBlobStore,
}

impl StoreCatalogSource {
    pub fn new(disk: DynBlobStore, cloud: DynBlobStore) -> Self {
        Self { disk, cloud }
    }
}

fn storage_error(err: &StorageError) -> CatalogError {
    CatalogError::Storage(err.to_string())
}

#[async_trait]
impl CatalogSource for StoreCatalogSource {
    async fn load(&self, version: &str) -> Result<Catalog, CatalogError> {
        let path = layout::catalog(version);
        let bytes = match self.disk.get(&path).await {
            Ok(bytes) => bytes,
            Err(err) if err.is_not_found() => {
                let bytes = match self.cloud.get(&path).await {
                    Ok(bytes) => bytes,
                    Err(err) if err.is_not_found() => return Err(CatalogError::NotFound(version.to_string())),
                    Err(err) => return Err(storage_error(&err)),
                };
                if let Err(err) = self.disk.create(&path, bytes.clone()).await {
                    error!(version, error = %err, "failed to backfill catalog to disk");
                }
                bytes
            }
            Err(err) => return Err(storage_error(&err)),
        };
        let body = String::from_utf8(bytes).map_err(|err| CatalogError::Decode {
            version: version.to_string(),
            line: 0,
            reason: err.to_string(),
        })?;
        let catalog = Catalog::from_ndjson(version, &body)?;
        info!(version, projects = catalog.project_count(), "catalog loaded");
        Ok(catalog)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use crate::{BlobStore, DiskBlobStore};
    use std::sync::Arc;

    #[tokio::test]
    async fn loads_from_cloud_and_backfills_disk() {
        let disk_dir = tempfile::tempdir().unwrap();
        let cloud_dir = tempfile::tempdir().unwrap();
        let disk = Arc::new(DiskBlobStore::new(disk_dir.path()));
        let cloud = Arc::new(DiskBlobStore::named(cloud_dir.path(), "cloud"));
        let body = concat!(
            r#"{"projectID":1,"modelID":10,"startDate":0,"endDate":100,"chunkIDs":["0","1"]}"#,
            "\n\n",
            r#"{"projectID":2,"modelID":20,"startDate":0,"endDate":100,"chunkIDs":["0"]}"#,
            "\n"
        );
        cloud
            .create(&layout::catalog("version3"), body.as_bytes().to_vec())
            .await
            .unwrap();

        let source = StoreCatalogSource::new(disk.clone(), cloud);
        let catalog = source.load("version3").await.unwrap();
        assert_eq!(catalog.version(), "version3");
        assert_eq!(catalog.project_count(), 2);
        assert_eq!(catalog.model(1, None).unwrap().1.chunk_ids, vec!["0", "1"]);
        assert!(disk.get(&layout::catalog("version3")).await.is_ok());
    }

    #[tokio::test]
    async fn unknown_version_is_not_found() {
        let disk_dir = tempfile::tempdir().unwrap();
        let cloud_dir = tempfile::tempdir().unwrap();
        let source = StoreCatalogSource::new(
            Arc::new(DiskBlobStore::new(disk_dir.path())),
            Arc::new(DiskBlobStore::named(cloud_dir.path(), "cloud")),
        );
        assert!(matches!(
            source.load("version9").await,
            Err(CatalogError::NotFound(v)) if v == "version9"
        ));
    }
}
