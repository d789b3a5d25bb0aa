//! Project → model → chunk catalog published with each cluster snapshot.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{ModelId, ProjectId};

/// Version written to the coordination service when none exists yet.
pub const INITIAL_CATALOG_VERSION: &str = "version1";

/// Errors raised while loading a catalog.
#[derive(Debug, Error)]
pub enum CatalogError {
    /// No blob exists for the requested version.
    #[error("catalog version '{0}' not found")]
    NotFound(String),
    /// A record line could not be decoded.
    #[error("catalog version '{version}' line {line}: {reason}")]
    Decode {
        /// Version being loaded.
        version: String,
        /// 1-based line number of the bad record.
        line: usize,
        /// Parser message.
        reason: String,
    },
    /// Backend failure while reading the blob.
    #[error("catalog storage error: {0}")]
    Storage(String),
}

/// One NDJSON line of a catalog blob.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogRecord {
    #[serde(rename = "projectID")]
    pub project_id: ProjectId,
    #[serde(rename = "modelID")]
    pub model_id: ModelId,
    #[serde(rename = "modelType", default)]
    pub model_type: String,
    #[serde(rename = "startDate")]
    pub start_date: i64,
    #[serde(rename = "endDate")]
    pub end_date: i64,
    #[serde(rename = "chunkIDs", default)]
    pub chunk_ids: Vec<String>,
}

/// Chunks and validity window of one mined model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelData {
    pub model_type: String,
    pub chunk_ids: Vec<String>,
    /// Inclusive start of the window, unix seconds.
    pub start_date: i64,
    /// Exclusive end of the window, unix seconds.
    pub end_date: i64,
}

impl ModelData {
    #[must_use]
    pub const fn covers(&self, timestamp: i64) -> bool {
        timestamp >= self.start_date && timestamp < self.end_date
    }
}

/// Models of one project, keyed by id.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelChunkMapping {
    models: BTreeMap<ModelId, ModelData>,
}

impl ModelChunkMapping {
    #[must_use]
    pub fn get(&self, model_id: ModelId) -> Option<&ModelData> {
        self.models.get(&model_id)
    }

    /// The model whose window ends last; ties go to the higher id.
    #[must_use]
    pub fn latest(&self) -> Option<(ModelId, &ModelData)> {
        self.models
            .iter()
            .max_by_key(|(id, data)| (data.end_date, **id))
            .map(|(id, data)| (*id, data))
    }

    pub fn iter(&self) -> impl Iterator<Item = (ModelId, &ModelData)> {
        self.models.iter().map(|(id, data)| (*id, data))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.models.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }

    fn absorb(&mut self, record: CatalogRecord) {
        let entry = self.models.entry(record.model_id).or_insert_with(|| ModelData {
            model_type: record.model_type.clone(),
            chunk_ids: Vec::new(),
            start_date: record.start_date,
            end_date: record.end_date,
        });
        entry.start_date = entry.start_date.min(record.start_date);
        entry.end_date = entry.end_date.max(record.end_date);
        if entry.model_type.is_empty() {
            entry.model_type = record.model_type;
        }
        for chunk in record.chunk_ids {
            if !chunk.is_empty() && !entry.chunk_ids.contains(&chunk) {
                entry.chunk_ids.push(chunk);
            }
        }
    }
}

/// Versioned snapshot of every project's models.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Catalog {
    version: String,
    projects: HashMap<ProjectId, ModelChunkMapping>,
}

impl Catalog {
    /// Catalog with no projects.
    #[must_use]
    pub fn empty(version: impl Into<String>) -> Self {
        Self {
            version: version.into(),
            projects: HashMap::new(),
        }
    }

    /// Fold decoded records into a catalog; repeated models merge their chunks.
    #[must_use]
    pub fn from_records(version: impl Into<String>, records: impl IntoIterator<Item = CatalogRecord>) -> Self {
        let mut projects: HashMap<ProjectId, ModelChunkMapping> = HashMap::new();
        for record in records {
            projects.entry(record.project_id).or_default().absorb(record);
        }
        Self {
            version: version.into(),
            projects,
        }
    }

    /// Decode an NDJSON catalog blob. Blank lines are skipped.
    pub fn from_ndjson(version: &str, body: &str) -> Result<Self, CatalogError> {
        let mut records = Vec::new();
        for (idx, line) in body.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let record = serde_json::from_str(line).map_err(|err| CatalogError::Decode {
                version: version.to_string(),
                line: idx + 1,
                reason: err.to_string(),
            })?;
            records.push(record);
        }
        Ok(Self::from_records(version, records))
    }

    #[must_use]
    pub fn version(&self) -> &str {
        &self.version
    }

    #[must_use]
    pub fn project(&self, project_id: ProjectId) -> Option<&ModelChunkMapping> {
        self.projects.get(&project_id)
    }

    /// Resolve a model of a project; `None` selects the latest one.
    #[must_use]
    pub fn model(&self, project_id: ProjectId, model_id: Option<ModelId>) -> Option<(ModelId, &ModelData)> {
        let mapping = self.projects.get(&project_id)?;
        match model_id {
            Some(id) => mapping.get(id).map(|data| (id, data)),
            None => mapping.latest(),
        }
    }

    pub fn project_ids(&self) -> impl Iterator<Item = ProjectId> + '_ {
        self.projects.keys().copied()
    }

    #[must_use]
    pub fn project_count(&self) -> usize {
        self.projects.len()
    }
}

/// Loads the catalog blob named after a version string.
#[async_trait]
pub trait CatalogSource: Send + Sync {
    async fn load(&self, version: &str) -> Result<Catalog, CatalogError>;
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::panic)]
    use super::*;

    const BLOB: &str = r#"
{"projectID":1,"modelID":10,"modelType":"w","startDate":100,"endDate":200,"chunkIDs":["1","2"]}
{"projectID":1,"modelID":11,"modelType":"m","startDate":200,"endDate":300,"chunkIDs":["1"]}

{"projectID":2,"modelID":20,"startDate":0,"endDate":50,"chunkIDs":[]}
{"projectID":1,"modelID":10,"modelType":"w","startDate":100,"endDate":200,"chunkIDs":["2","3"]}
"#;

    #[test]
    fn folds_records_by_project_and_model() {
        let catalog = Catalog::from_ndjson("v7", BLOB).unwrap();
        assert_eq!(catalog.version(), "v7");
        assert_eq!(catalog.project_count(), 2);

        let project = catalog.project(1).unwrap();
        assert_eq!(project.len(), 2);
        assert_eq!(project.get(10).unwrap().chunk_ids, vec!["1", "2", "3"]);
    }

    #[test]
    fn missing_model_id_resolves_latest() {
        let catalog = Catalog::from_ndjson("v7", BLOB).unwrap();
        let (id, data) = catalog.model(1, None).unwrap();
        assert_eq!(id, 11);
        assert_eq!(data.model_type, "m");
        assert!(data.covers(200));
        assert!(!data.covers(300));
        assert!(catalog.model(1, Some(99)).is_none());
        assert!(catalog.model(3, None).is_none());
    }

    #[test]
    fn malformed_line_reports_position() {
        let err = Catalog::from_ndjson("bad", "{\"projectID\":1}\n").unwrap_err();
        match err {
            CatalogError::Decode { version, line, .. } => {
                assert_eq!(version, "bad");
                assert_eq!(line, 1);
            }
            other => panic!("unexpected error {other:?}"),
        }
    }
}
