//! Atomic JSON state files
//!
//! A [`StateFile`] stores one whole document. Saves go to a sibling
//! temporary file which is flushed to disk and then renamed over the
//! target, so a load after an abrupt stop sees either the previous document
//! or the new one, never a mix.
//!
//! - Missing file loads as `T::default()`
//! - Corrupt file is an error; authoritative state is never reset silently

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::{debug, info};

/// Errors from state file operations
#[derive(Error, Debug)]
pub enum PersistenceError {
    /// IO error reading/writing file
    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// JSON serialization/deserialization error
    #[error("JSON error in {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

impl PersistenceError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        PersistenceError::Io { path: path.to_path_buf(), source }
    }

    fn json(path: &Path, source: serde_json::Error) -> Self {
        PersistenceError::Json { path: path.to_path_buf(), source }
    }
}

/// Whole-document JSON file with atomic replace
#[derive(Debug, Clone)]
pub struct StateFile<T> {
    path: PathBuf,
    _marker: PhantomData<fn() -> T>,
}

impl<T> StateFile<T>
where
    T: Serialize + DeserializeOwned + Default,
{
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            _marker: PhantomData,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Load the document, or its default when the file does not exist yet
    pub fn load(&self) -> Result<T, PersistenceError> {
        let file = match File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("No state at {}, starting fresh", self.path.display());
                return Ok(T::default());
            }
            Err(e) => return Err(PersistenceError::io(&self.path, e)),
        };
        let value = serde_json::from_reader(BufReader::new(file))
            .map_err(|e| PersistenceError::json(&self.path, e))?;
        debug!("Loaded state from {}", self.path.display());
        Ok(value)
    }

    /// Replace the document on disk
    pub fn save(&self, value: &T) -> Result<(), PersistenceError> {
        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        fs::create_dir_all(dir).map_err(|e| PersistenceError::io(dir, e))?;

        let mut tmp = NamedTempFile::new_in(dir).map_err(|e| PersistenceError::io(dir, e))?;
        let tmp_path = tmp.path().to_path_buf();
        {
            let mut writer = BufWriter::new(tmp.as_file_mut());
            serde_json::to_writer_pretty(&mut writer, value).map_err(|e| PersistenceError::json(&tmp_path, e))?;
            writer.flush().map_err(|e| PersistenceError::io(&tmp_path, e))?;
        }
        tmp.as_file().sync_all().map_err(|e| PersistenceError::io(&tmp_path, e))?;
        // the temp file is removed on drop if the rename fails
        tmp.persist(&self.path)
            .map_err(|e| PersistenceError::io(&self.path, e.error))?;

        debug!("Saved state to {}", self.path.display());
        Ok(())
    }
}
