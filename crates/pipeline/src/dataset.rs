//! Resolution of uploaded file ids to dataset handles

use analytics_common::{PipelineError, PipelineResult};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Component, Path, PathBuf};
use tracing::debug;

/// Opaque reference to an uploaded dataset, handed to every agent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetHandle {
    pub file_id: String,
    pub path: PathBuf,
    pub size_bytes: u64,
}

#[async_trait]
pub trait DatasetResolver: Send + Sync {
    /// Resolve a file id, failing with a validation error if it does not exist.
    async fn resolve(&self, file_id: &str) -> PipelineResult<DatasetHandle>;
}

/// Resolves file ids as plain file names under a root directory
#[derive(Debug, Clone)]
pub struct FsDatasetResolver {
    root: PathBuf,
}

impl FsDatasetResolver {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[async_trait]
impl DatasetResolver for FsDatasetResolver {
    async fn resolve(&self, file_id: &str) -> PipelineResult<DatasetHandle> {
        let trimmed = file_id.trim();
        if trimmed.is_empty() {
            return Err(PipelineError::validation("file_id must not be empty"));
        }
        let mut components = Path::new(trimmed).components();
        let single_name = matches!(
            (components.next(), components.next()),
            (Some(Component::Normal(_)), None)
        );
        if !single_name {
            return Err(PipelineError::validation(format!(
                "file_id '{}' must be a plain file name",
                file_id
            )));
        }

        let path = self.root.join(trimmed);
        let metadata = match tokio::fs::metadata(&path).await {
            Ok(metadata) if metadata.is_file() => metadata,
            _ => {
                return Err(PipelineError::validation(format!(
                    "unknown file_id '{}'",
                    file_id
                )))
            }
        };
        debug!(file_id = trimmed, path = %path.display(), size = metadata.len(), "Resolved dataset");

        Ok(DatasetHandle {
            file_id: trimmed.to_string(),
            path,
            size_bytes: metadata.len(),
        })
    }
}
