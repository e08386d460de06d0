use std::path::PathBuf;

use keyrot_core::{RosterSource, RotationError};
use tracing::debug;

/// Reads the roster from a local file.  Decoding is left to the parser.
#[derive(Debug, Clone)]
pub struct FileRosterSource {
    path: PathBuf,
}

impl FileRosterSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait::async_trait]
impl RosterSource for FileRosterSource {
    async fn fetch(&self) -> Result<Vec<u8>, RotationError> {
        let raw = tokio::fs::read(&self.path).await.map_err(|e| {
            RotationError::Config(format!("cannot read roster {}: {e}", self.path.display()))
        })?;
        debug!(path = %self.path.display(), bytes = raw.len(), "roster read");
        Ok(raw)
    }
}
