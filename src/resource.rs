//! File resources shipped to agents before a task group runs.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};

/// A named, versioned file that must be present on an agent before execution
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FileResource {
    pub name: String,
    pub path: PathBuf,
    pub version: String,
}

impl FileResource {
    pub fn new(
        name: impl Into<String>,
        path: impl Into<PathBuf>,
        version: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            version: version.into(),
        }
    }

    /// Build a resource from a local file, versioned by the SHA-256 of its contents
    pub fn from_path(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read(path)?;
        let name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("{} has no file name", path.display()),
                )
            })?;

        Ok(Self::new(name, path, content_version(&contents)))
    }

    pub async fn read_contents(&self) -> io::Result<Vec<u8>> {
        tokio::fs::read(&self.path).await
    }

    /// Whether an agent holding `inventory` (name -> version) needs this file
    pub fn needs_shipping(&self, inventory: &HashMap<String, String>) -> bool {
        inventory.get(&self.name) != Some(&self.version)
    }
}

pub fn content_version(contents: &[u8]) -> String {
    format!("{:x}", Sha256::digest(contents))
}
