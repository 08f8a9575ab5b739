//! Persistence backends for activation records.

use std::collections::BTreeMap;
use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use thiserror::Error;
use tracing::debug;

use super::ActivationRecord;

/// Errors from an activation backend.
#[derive(Debug, Error)]
pub enum BackendError {
    /// Reading or writing the state file failed.
    #[error("activation state I/O error at {path}: {source}")]
    Io {
        /// File involved.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The state file is not valid JSON.
    #[error("invalid activation state in {path}: {source}")]
    Json {
        /// File involved.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: serde_json::Error,
    },
}

impl BackendError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Where activation records are kept between runs.
///
/// `store` is called with the updated record after every accepted change,
/// while the record's write lock is held. A newly tracked record is stored
/// before it becomes visible, with no store lock held.
pub trait ActivationBackend: Send + Sync + fmt::Debug {
    /// Load every persisted record.
    ///
    /// # Errors
    ///
    /// Returns an error if the persisted state cannot be read.
    fn load(&self) -> Result<Vec<ActivationRecord>, BackendError>;

    /// Persist one record, replacing any previous value for its identifier.
    ///
    /// # Errors
    ///
    /// Returns an error if the record cannot be written.
    fn store(&self, record: &ActivationRecord) -> Result<(), BackendError>;
}

/// Backend that keeps nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct EphemeralBackend;

impl ActivationBackend for EphemeralBackend {
    fn load(&self) -> Result<Vec<ActivationRecord>, BackendError> {
        Ok(Vec::new())
    }

    fn store(&self, _record: &ActivationRecord) -> Result<(), BackendError> {
        Ok(())
    }
}

/// Backend writing every record to one JSON file (identifier -> record).
///
/// Each write replaces the file atomically through a temporary file in the
/// same directory.
#[derive(Debug)]
pub struct JsonFileBackend {
    path: PathBuf,
    records: Mutex<BTreeMap<String, ActivationRecord>>,
}

impl JsonFileBackend {
    /// Open the backend at `path`. A missing file starts empty.
    ///
    /// # Errors
    ///
    /// Returns an error if an existing file cannot be read or parsed.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, BackendError> {
        let path = path.into();
        let records = match std::fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|source| BackendError::Json {
                path: path.clone(),
                source,
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(BackendError::io(&path, e)),
        };
        Ok(Self {
            path,
            records: Mutex::new(records),
        })
    }

    /// Path of the state file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write_all(&self, records: &BTreeMap<String, ActivationRecord>) -> Result<(), BackendError> {
        let dir = match self.path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir,
            _ => Path::new("."),
        };
        std::fs::create_dir_all(dir).map_err(|e| BackendError::io(dir, e))?;

        let bytes = serde_json::to_vec_pretty(records).map_err(|source| BackendError::Json {
            path: self.path.clone(),
            source,
        })?;

        let mut temp = tempfile::NamedTempFile::new_in(dir).map_err(|e| BackendError::io(dir, e))?;
        temp.as_file_mut()
            .write_all(&bytes)
            .map_err(|e| BackendError::io(temp.path(), e))?;
        temp.as_file()
            .sync_all()
            .map_err(|e| BackendError::io(temp.path(), e))?;
        temp.persist(&self.path)
            .map_err(|e| BackendError::io(&self.path, e.error))?;

        debug!(path = %self.path.display(), count = records.len(), "activation state written");
        Ok(())
    }
}

impl ActivationBackend for JsonFileBackend {
    fn load(&self) -> Result<Vec<ActivationRecord>, BackendError> {
        let records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(records.values().cloned().collect())
    }

    fn store(&self, record: &ActivationRecord) -> Result<(), BackendError> {
        let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        let previous = records.insert(record.identifier.clone(), record.clone());
        if let Err(e) = self.write_all(&records) {
            match previous {
                Some(previous) => records.insert(record.identifier.clone(), previous),
                None => records.remove(&record.identifier),
            };
            return Err(e);
        }
        Ok(())
    }
}
