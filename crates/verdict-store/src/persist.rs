// persist.rs — On-disk engine state.
//
// Each engine is stored as one JSON file: `<state_dir>/<engine_id>.json`,
// holding the engine record (schema and attachments included) and its
// policies in evaluation order. Files are written to a temporary sibling
// and renamed into place so a crash never leaves a half-written engine.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::engine::PolicyEngine;
use crate::error::StoreError;
use crate::policy::Policy;

/// Everything persisted for one engine.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EngineFile {
    pub engine: PolicyEngine,
    #[serde(default)]
    pub policies: Vec<Policy>,
}

pub struct EngineFiles {
    dir: PathBuf,
}

impl EngineFiles {
    /// Open the state directory, creating it if needed.
    pub fn new(dir: impl AsRef<Path>) -> Result<Self, StoreError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).map_err(|source| StoreError::IoError {
            path: dir.display().to_string(),
            source,
        })?;
        Ok(Self { dir })
    }

    pub fn save(&self, file: &EngineFile) -> Result<(), StoreError> {
        let path = self.engine_file(file.engine.engine_id);
        let tmp = path.with_extension("json.tmp");
        let json = serde_json::to_string_pretty(file)?;
        fs::write(&tmp, json).map_err(|source| StoreError::IoError {
            path: tmp.display().to_string(),
            source,
        })?;
        fs::rename(&tmp, &path).map_err(|source| StoreError::IoError {
            path: path.display().to_string(),
            source,
        })?;
        Ok(())
    }

    /// Load every engine file, oldest engine first.
    pub fn load_all(&self) -> Result<Vec<EngineFile>, StoreError> {
        let entries = fs::read_dir(&self.dir).map_err(|source| StoreError::IoError {
            path: self.dir.display().to_string(),
            source,
        })?;

        let mut files = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|source| StoreError::IoError {
                path: self.dir.display().to_string(),
                source,
            })?;
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                let json = fs::read_to_string(&path).map_err(|source| StoreError::IoError {
                    path: path.display().to_string(),
                    source,
                })?;
                files.push(serde_json::from_str::<EngineFile>(&json)?);
            }
        }
        files.sort_by_key(|f| f.engine.created_at);
        Ok(files)
    }

    /// Remove an engine's file. Returns false if it did not exist.
    pub fn remove(&self, engine_id: Uuid) -> Result<bool, StoreError> {
        let path = self.engine_file(engine_id);
        if !path.exists() {
            return Ok(false);
        }
        fs::remove_file(&path).map_err(|source| StoreError::IoError {
            path: path.display().to_string(),
            source,
        })?;
        Ok(true)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn engine_file(&self, engine_id: Uuid) -> PathBuf {
        self.dir.join(format!("{}.json", engine_id))
    }
}
