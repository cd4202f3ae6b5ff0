//! Run artifact store: one pretty-printed `FinalizeResult` per trace id.

use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::orchestrator::FinalizeResult;

#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("trace id {0:?} is not a valid artifact key")]
    InvalidKey(String),

    #[error("failed to write artifact {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to encode artifact: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Keyed write of a finished run.
pub trait ArtifactStore: Send + Sync {
    fn store_artifact(&self, trace_id: &str, result: &FinalizeResult) -> Result<PathBuf, ArtifactError>;
}

/// Writes `<dir>/<trace_id>.json`.
#[derive(Debug, Clone)]
pub struct FsArtifactStore {
    dir: PathBuf,
}

impl FsArtifactStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, trace_id: &str) -> Result<PathBuf, ArtifactError> {
        let valid = !trace_id.is_empty()
            && trace_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(ArtifactError::InvalidKey(trace_id.to_string()));
        }
        Ok(self.dir.join(format!("{trace_id}.json")))
    }

    pub fn load(&self, trace_id: &str) -> Result<FinalizeResult, ArtifactError> {
        let path = self.path_for(trace_id)?;
        let text = std::fs::read_to_string(&path).map_err(|source| ArtifactError::Io {
            path: path.clone(),
            source,
        })?;
        Ok(serde_json::from_str(&text)?)
    }
}

impl ArtifactStore for FsArtifactStore {
    fn store_artifact(&self, trace_id: &str, result: &FinalizeResult) -> Result<PathBuf, ArtifactError> {
        let path = self.path_for(trace_id)?;
        let json = serde_json::to_string_pretty(result)?;
        let io_err = |path: &Path| {
            let path = path.to_path_buf();
            move |source: std::io::Error| ArtifactError::Io { path, source }
        };

        std::fs::create_dir_all(&self.dir).map_err(io_err(&self.dir))?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, json).map_err(io_err(&tmp))?;
        std::fs::rename(&tmp, &path).map_err(io_err(&path))?;
        Ok(path)
    }
}
