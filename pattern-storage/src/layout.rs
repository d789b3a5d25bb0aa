//! Where each kind of blob lives, relative to a backend's root.

use std::fmt;

use pattern_core::{ModelId, ProjectId};

/// Directory plus file name of one blob.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BlobPath {
    pub dir: String,
    pub name: String,
}

impl BlobPath {
    pub fn new(dir: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for BlobPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.dir.is_empty() {
            f.write_str(&self.name)
        } else {
            write!(f, "{}/{}", self.dir, self.name)
        }
    }
}

fn model_dir(project_id: ProjectId, model_id: ModelId) -> String {
    format!("projects/{project_id}/models/{model_id}")
}

/// `projects/<pid>/models/<mid>/event_info.txt`
#[must_use]
pub fn event_info(project_id: ProjectId, model_id: ModelId) -> BlobPath {
    BlobPath::new(model_dir(project_id, model_id), "event_info.txt")
}

/// `projects/<pid>/models/<mid>/chunks/chunk_<cid>.txt`
#[must_use]
pub fn chunk(project_id: ProjectId, model_id: ModelId, chunk_id: &str) -> BlobPath {
    BlobPath::new(
        format!("{}/chunks", model_dir(project_id, model_id)),
        format!("chunk_{chunk_id}.txt"),
    )
}

/// `metadata/projects_data_<version>.txt`
#[must_use]
pub fn catalog(version: &str) -> BlobPath {
    BlobPath::new("metadata", format!("projects_data_{version}.txt"))
}
