//! Settings persistence for the host node
//!
//! The settings record lives in a JSON file. A missing or unreadable file
//! is not fatal: the core falls back to factory defaults and the record is
//! written back on shutdown.

use qbms::{BmsSettings, SettingsStore};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

/// Node-level error
#[derive(Debug, Error)]
pub enum NodeError {
    #[error("settings file I/O: {0}")]
    Io(#[from] io::Error),

    #[error("settings file is not a valid record: {0}")]
    Json(#[from] serde_json::Error),

    #[error("core error: {0}")]
    Core(qbms::Error),
}

impl From<qbms::Error> for NodeError {
    fn from(e: qbms::Error) -> Self {
        NodeError::Core(e)
    }
}

/// [`SettingsStore`] backed by a pretty-printed JSON file
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read and parse the record, keeping the failure reason
    pub fn read_record(&self) -> Result<BmsSettings, NodeError> {
        let text = fs::read_to_string(&self.path)?;
        let settings = serde_json::from_str(&text)?;
        Ok(settings)
    }

    /// Serialize and write the record
    pub fn write_record(&self, settings: &BmsSettings) -> Result<(), NodeError> {
        let text = serde_json::to_string_pretty(settings)?;
        fs::write(&self.path, text)?;
        debug!("Settings written to {}", self.path.display());
        Ok(())
    }
}

impl SettingsStore for JsonFileStore {
    fn load(&mut self) -> qbms::Result<BmsSettings> {
        self.read_record().map_err(|e| {
            warn!("Cannot load {}: {}", self.path.display(), e);
            qbms::Error::InvalidSettings
        })
    }

    fn save(&mut self, settings: &BmsSettings) -> qbms::Result<()> {
        self.write_record(settings).map_err(|e| {
            warn!("Cannot save {}: {}", self.path.display(), e);
            qbms::Error::HalFailure
        })
    }
}
