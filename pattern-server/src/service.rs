//! Pattern queries scoped to the projects this node owns.
//!
//! Every project-scoped call first checks ownership against the current
//! cluster view. Calls for projects owned elsewhere come back with
//! `ignored = true` and no body. Owned calls resolve the model through the
//! view's catalog and run against an index cached per
//! `(project, model, catalog version)`.

use std::sync::Arc;

use dashmap::DashMap;
use pattern_core::tracker::{EventRecord, QueryDefinition, ScanReport, TrackerSet};
use pattern_core::{
    BoundedCache, CacheStats, CardinalityBounds, ClusterHandle, ClusterView, FactorReport, IndexConfig, ModelId,
    PathCount, Pattern, PatternIndex, ProjectId, UserAndEventsInfo,
};
use pattern_storage::{PatternStore, StoreCacheStats};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::RpcError;

type IndexKey = (ProjectId, ModelId, String);

/// Project and optional model of a call; no model means the latest one.
#[derive(Debug, Clone, Deserialize)]
pub struct ModelParams {
    #[serde(rename = "projectID")]
    pub project_id: ProjectId,
    #[serde(rename = "modelID", default)]
    pub model_id: Option<ModelId>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EventsParams {
    #[serde(flatten)]
    pub model: ModelParams,
    #[serde(rename = "eventNames")]
    pub event_names: Vec<String>,
    #[serde(flatten)]
    pub bounds: CardinalityBounds,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AnchorParams {
    #[serde(flatten)]
    pub model: ModelParams,
    #[serde(rename = "startEvent", default)]
    pub start_event: String,
    #[serde(rename = "endEvent", default)]
    pub end_event: String,
    #[serde(flatten)]
    pub bounds: CardinalityBounds,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ContainingParams {
    #[serde(flatten)]
    pub model: ModelParams,
    #[serde(rename = "eventName")]
    pub event_name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PatternsParams {
    #[serde(flatten)]
    pub model: ModelParams,
    #[serde(rename = "patternEvents")]
    pub pattern_events: Vec<Vec<String>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TrackQueriesParams {
    pub queries: Vec<QueryDefinition>,
    pub records: Vec<EventRecord>,
}

/// Fields every project-scoped result carries.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ResponseMeta {
    #[serde(rename = "projectID")]
    pub project_id: ProjectId,
    /// Resolved model, or the requested one when ignored.
    #[serde(rename = "modelID")]
    pub model_id: Option<ModelId>,
    pub ignored: bool,
    pub error: Option<String>,
}

/// A project-scoped result; `body` is absent when the call was ignored.
#[derive(Debug, Clone, Serialize)]
pub struct Reply<T> {
    #[serde(flatten)]
    pub meta: ResponseMeta,
    #[serde(flatten)]
    pub body: Option<T>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PerUserCount {
    #[serde(rename = "perUserCount")]
    pub per_user_count: u64,
    pub found: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct PatternCount {
    pub count: u64,
    pub found: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct Patterns {
    pub patterns: Vec<Pattern>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FrequentPaths {
    pub paths: Vec<PathCount>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TotalEventCount {
    #[serde(rename = "totalEventCount")]
    pub total_event_count: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct FactorResult {
    pub factor: FactorReport,
}

#[derive(Debug, Clone, Serialize)]
pub struct EventInfoResult {
    #[serde(rename = "userAndEventsInfo")]
    pub info: UserAndEventsInfo,
}

struct OwnedModel {
    meta: ResponseMeta,
    project_id: ProjectId,
    model_id: ModelId,
    chunk_ids: Vec<String>,
    catalog_version: String,
}

enum Target {
    Ignored(ResponseMeta),
    Owned(OwnedModel),
}

pub struct PatternService {
    store: Arc<PatternStore>,
    cluster: ClusterHandle,
    index_config: IndexConfig,
    indexes: BoundedCache<IndexKey, Arc<PatternIndex>>,
    /// One gate per index under construction.
    building: DashMap<IndexKey, Arc<Mutex<()>>>,
}

impl PatternService {
    pub fn new(store: Arc<PatternStore>, cluster: ClusterHandle, index_config: IndexConfig, index_cache_size: usize) -> Self {
        Self {
            store,
            cluster,
            index_config,
            indexes: BoundedCache::new(index_cache_size),
            building: DashMap::new(),
        }
    }

    #[must_use]
    pub fn view(&self) -> Arc<ClusterView> {
        self.cluster.view()
    }

    #[must_use]
    pub fn store_cache_stats(&self) -> StoreCacheStats {
        self.store.cache_stats()
    }

    #[must_use]
    pub fn index_cache_stats(&self) -> CacheStats {
        self.indexes.stats()
    }

    fn resolve(&self, params: &ModelParams) -> Result<Target, RpcError> {
        let view = self.cluster.view();
        let project_id = params.project_id;
        if !view.owns(project_id) {
            let owner = view.owner_of(project_id).unwrap_or("no live server");
            debug!(project_id, owner, "project served elsewhere, ignoring");
            return Ok(Target::Ignored(ResponseMeta {
                project_id,
                model_id: params.model_id,
                ignored: true,
                error: Some(format!("project {project_id} is served by {owner}")),
            }));
        }
        let (model_id, data) = view
            .catalog
            .model(project_id, params.model_id)
            .ok_or(RpcError::ModelNotFound {
                project_id,
                model_id: params.model_id,
            })?;
        Ok(Target::Owned(OwnedModel {
            meta: ResponseMeta {
                project_id,
                model_id: Some(model_id),
                ignored: false,
                error: None,
            },
            project_id,
            model_id,
            chunk_ids: data.chunk_ids.clone(),
            catalog_version: view.catalog_version().to_string(),
        }))
    }

    async fn index(&self, model: &OwnedModel) -> Result<Arc<PatternIndex>, RpcError> {
        let key = (model.project_id, model.model_id, model.catalog_version.clone());
        if let Some(index) = self.indexes.get(&key) {
            return Ok(index);
        }
        let gate = Arc::clone(&self.building.entry(key.clone()).or_default());
        let built = {
            let _building = gate.lock().await;
            match self.indexes.get(&key) {
                Some(index) => Ok(index),
                None => self.build_index(model).await.inspect(|index| {
                    self.indexes.insert(key.clone(), Arc::clone(index));
                }),
            }
        };
        self.building.remove(&key);
        built
    }

    async fn build_index(&self, model: &OwnedModel) -> Result<Arc<PatternIndex>, RpcError> {
        let patterns = self
            .store
            .get_model_patterns(model.project_id, model.model_id, &model.chunk_ids)
            .await?;
        let index = PatternIndex::build(patterns, self.index_config.clone())?;
        info!(
            project_id = model.project_id,
            model_id = model.model_id,
            catalog_version = %model.catalog_version,
            patterns = index.len(),
            "pattern index built"
        );
        Ok(Arc::new(index))
    }

    async fn with_index<T>(
        &self,
        params: &ModelParams,
        query: impl FnOnce(&PatternIndex) -> Result<T, RpcError>,
    ) -> Result<Reply<T>, RpcError> {
        match self.resolve(params)? {
            Target::Ignored(meta) => Ok(Reply { meta, body: None }),
            Target::Owned(model) => {
                let index = self.index(&model).await?;
                let body = query(&index)?;
                Ok(Reply {
                    meta: model.meta,
                    body: Some(body),
                })
            }
        }
    }

    pub async fn per_user_count(&self, params: EventsParams) -> Result<Reply<PerUserCount>, RpcError> {
        self.with_index(&params.model, |index| {
            let count = index.get_per_user_count(&params.event_names, params.bounds);
            Ok(PerUserCount {
                per_user_count: count.unwrap_or(0),
                found: count.is_some(),
            })
        })
        .await
    }

    pub async fn frequent_paths(&self, params: AnchorParams) -> Result<Reply<FrequentPaths>, RpcError> {
        self.with_index(&params.model, |index| {
            Ok(FrequentPaths {
                paths: index.frequent_paths(&params.start_event, &params.end_event, params.bounds),
            })
        })
        .await
    }

    pub async fn factor(&self, params: AnchorParams) -> Result<Reply<FactorResult>, RpcError> {
        self.with_index(&params.model, |index| {
            Ok(FactorResult {
                factor: index.factor(&params.end_event, params.bounds)?,
            })
        })
        .await
    }

    pub async fn all_patterns(&self, params: AnchorParams) -> Result<Reply<Patterns>, RpcError> {
        self.with_index(&params.model, |index| {
            Ok(Patterns {
                patterns: index
                    .anchored(&params.start_event, &params.end_event)
                    .cloned()
                    .collect(),
            })
        })
        .await
    }

    pub async fn containing_patterns(&self, params: ContainingParams) -> Result<Reply<Patterns>, RpcError> {
        self.with_index(&params.model, |index| {
            Ok(Patterns {
                patterns: index.containing(&params.event_name).cloned().collect(),
            })
        })
        .await
    }

    /// Exact lookups; sequences that are not indexed are left out.
    pub async fn patterns(&self, params: PatternsParams) -> Result<Reply<Patterns>, RpcError> {
        self.with_index(&params.model, |index| {
            Ok(Patterns {
                patterns: params
                    .pattern_events
                    .iter()
                    .filter_map(|events| index.get(events).cloned())
                    .collect(),
            })
        })
        .await
    }

    pub async fn count_of_pattern(&self, params: EventsParams) -> Result<Reply<PatternCount>, RpcError> {
        self.with_index(&params.model, |index| {
            let count = index.count_of(&params.event_names);
            Ok(PatternCount {
                count: count.unwrap_or(0),
                found: count.is_some(),
            })
        })
        .await
    }

    pub async fn total_event_count(&self, params: ModelParams) -> Result<Reply<TotalEventCount>, RpcError> {
        self.with_index(&params, |index| {
            Ok(TotalEventCount {
                total_event_count: index.total_event_count(),
            })
        })
        .await
    }

    pub async fn user_and_events_info(&self, params: ModelParams) -> Result<Reply<EventInfoResult>, RpcError> {
        match self.resolve(&params)? {
            Target::Ignored(meta) => Ok(Reply { meta, body: None }),
            Target::Owned(model) => {
                let info = self.store.get_event_info(model.project_id, model.model_id).await?;
                Ok(Reply {
                    meta: model.meta,
                    body: Some(EventInfoResult {
                        info: info.as_ref().clone(),
                    }),
                })
            }
        }
    }

    /// Run queries over the given records. Not scoped to a project.
    pub fn track_queries(&self, params: &TrackQueriesParams) -> Result<ScanReport, RpcError> {
        let mut trackers = TrackerSet::new(&params.queries)?;
        let report = trackers.scan(&params.records);
        debug!(
            queries = trackers.len(),
            processed = report.processed,
            rejected = report.rejected,
            "queries tracked"
        );
        Ok(report)
    }
}
