//! Memory → disk → cloud read-through store for event info and pattern chunks.

use std::sync::Arc;

use pattern_core::{BoundedCache, CacheStats, ModelId, Pattern, ProjectId, UserAndEventsInfo};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

use crate::{BlobPath, DynBlobStore, StorageError, StorageResult, codec, layout};

/// Capacities of the in-memory tier.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Pattern chunks kept in memory.
    pub chunk_cache_size: usize,
    /// Model event-info documents kept in memory.
    pub event_info_cache_size: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            chunk_cache_size: 5,
            event_info_cache_size: 10,
        }
    }
}

/// Hit/miss counters of both memory caches.
#[derive(Debug, Clone, Serialize)]
pub struct StoreCacheStats {
    pub chunks: CacheStats,
    #[serde(rename = "eventInfo")]
    pub event_info: CacheStats,
}

type ChunkKey = (ProjectId, ModelId, String);

/// Where a blob was found below memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Tier {
    Disk,
    Cloud,
}

pub struct PatternStore {
    disk: DynBlobStore,
    cloud: DynBlobStore,
    chunks: BoundedCache<ChunkKey, Arc<Vec<Pattern>>>,
    event_infos: BoundedCache<(ProjectId, ModelId), Arc<UserAndEventsInfo>>,
}

impl PatternStore {
    pub fn new(disk: DynBlobStore, cloud: DynBlobStore, config: &CacheConfig) -> Self {
        Self {
            disk,
            cloud,
            chunks: BoundedCache::new(config.chunk_cache_size),
            event_infos: BoundedCache::new(config.event_info_cache_size),
        }
    }

    #[must_use]
    pub fn disk(&self) -> &DynBlobStore {
        &self.disk
    }

    #[must_use]
    pub fn cloud(&self) -> &DynBlobStore {
        &self.cloud
    }

    /// Disk first; only a disk miss falls through to the cloud.
    async fn fetch(&self, path: &BlobPath) -> StorageResult<(Vec<u8>, Tier)> {
        match self.disk.get(path).await {
            Ok(bytes) => return Ok((bytes, Tier::Disk)),
            Err(err) if err.is_not_found() => {
                debug!(path = %path, "disk miss, trying cloud");
            }
            Err(err) => return Err(err),
        }
        match self.cloud.get(path).await {
            Ok(bytes) => Ok((bytes, Tier::Cloud)),
            Err(err) if err.is_not_found() => Err(StorageError::CacheChainExhausted(path.to_string())),
            Err(err) => Err(err),
        }
    }

    /// Copy a cloud blob to disk; failure only costs a future cloud read.
    async fn backfill_disk(&self, path: &BlobPath, bytes: Vec<u8>) {
        if let Err(err) = self.disk.create(path, bytes).await {
            error!(path = %path, error = %err, "failed to backfill disk from cloud");
        }
    }

    pub async fn get_event_info(
        &self,
        project_id: ProjectId,
        model_id: ModelId,
    ) -> StorageResult<Arc<UserAndEventsInfo>> {
        let key = (project_id, model_id);
        if let Some(info) = self.event_infos.get(&key) {
            return Ok(info);
        }
        let path = layout::event_info(project_id, model_id);
        let (bytes, tier) = self.fetch(&path).await?;
        let info = Arc::new(codec::decode_event_info(&path.to_string(), &bytes)?);
        if tier == Tier::Cloud {
            self.backfill_disk(&path, bytes).await;
        }
        self.event_infos.insert(key, Arc::clone(&info));
        Ok(info)
    }

    pub async fn get_patterns(
        &self,
        project_id: ProjectId,
        model_id: ModelId,
        chunk_id: &str,
    ) -> StorageResult<Arc<Vec<Pattern>>> {
        let key = (project_id, model_id, chunk_id.to_string());
        if let Some(patterns) = self.chunks.get(&key) {
            return Ok(patterns);
        }
        let path = layout::chunk(project_id, model_id, chunk_id);
        let (bytes, tier) = self.fetch(&path).await?;
        let patterns = Arc::new(codec::decode_patterns(&path.to_string(), &bytes)?);
        if tier == Tier::Cloud {
            self.backfill_disk(&path, bytes).await;
        }
        debug!(project_id, model_id, chunk_id, patterns = patterns.len(), "chunk loaded");
        self.chunks.insert(key, Arc::clone(&patterns));
        Ok(patterns)
    }

    /// Patterns of every listed chunk, in chunk order.
    pub async fn get_model_patterns(
        &self,
        project_id: ProjectId,
        model_id: ModelId,
        chunk_ids: &[String],
    ) -> StorageResult<Vec<Pattern>> {
        let mut patterns = Vec::new();
        for chunk_id in chunk_ids {
            patterns.extend(self.get_patterns(project_id, model_id, chunk_id).await?.iter().cloned());
        }
        Ok(patterns)
    }

    pub async fn put_event_info_in_disk(
        &self,
        project_id: ProjectId,
        model_id: ModelId,
        info: &UserAndEventsInfo,
    ) -> StorageResult<()> {
        let bytes = codec::encode_event_info(info)?;
        self.disk.create(&layout::event_info(project_id, model_id), bytes).await
    }

    pub async fn put_event_info_in_cloud(
        &self,
        project_id: ProjectId,
        model_id: ModelId,
        info: &UserAndEventsInfo,
    ) -> StorageResult<()> {
        let bytes = codec::encode_event_info(info)?;
        self.cloud.create(&layout::event_info(project_id, model_id), bytes).await
    }

    pub async fn put_patterns_in_disk(
        &self,
        project_id: ProjectId,
        model_id: ModelId,
        chunk_id: &str,
        patterns: &[Pattern],
    ) -> StorageResult<()> {
        let bytes = codec::encode_patterns(patterns)?;
        self.disk
            .create(&layout::chunk(project_id, model_id, chunk_id), bytes)
            .await
    }

    pub async fn put_patterns_in_cloud(
        &self,
        project_id: ProjectId,
        model_id: ModelId,
        chunk_id: &str,
        patterns: &[Pattern],
    ) -> StorageResult<()> {
        let bytes = codec::encode_patterns(patterns)?;
        self.cloud
            .create(&layout::chunk(project_id, model_id, chunk_id), bytes)
            .await
    }

    /// Drop every in-memory entry. Counters are kept.
    pub fn clear_memory(&self) {
        self.chunks.clear();
        self.event_infos.clear();
        info!("pattern store memory tier cleared");
    }

    #[must_use]
    pub fn cache_stats(&self) -> StoreCacheStats {
        StoreCacheStats {
            chunks: self.chunks.stats(),
            event_info: self.event_infos.stats(),
        }
    }
}
