//! Snapshot file location.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const DEFAULT_APP_NAME: &str = "procmaster";

const DEFAULT_FILE_NAME: &str = "dump.json";

/// Where the supervisor runs; selects the default snapshot directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceContext {
    /// System daemon: system state directories.
    System,
    /// Per-user service: user data directories.
    #[default]
    User,
    /// Login session; same directories as `User`.
    Session,
}

/// Snapshot location settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapshotFileConfig {
    /// Overrides the OS default directory when set.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_directory: Option<String>,
    pub service_context: ServiceContext,
    /// Subdirectory created under the OS default directory.
    pub app_name: String,
    pub file_name: String,
}

impl Default for SnapshotFileConfig {
    fn default() -> Self {
        Self {
            base_directory: None,
            service_context: ServiceContext::User,
            app_name: DEFAULT_APP_NAME.to_string(),
            file_name: DEFAULT_FILE_NAME.to_string(),
        }
    }
}

/// Resolves the snapshot path from a [`SnapshotFileConfig`].
#[derive(Debug, Clone)]
pub struct SnapshotLocator {
    config: SnapshotFileConfig,
}

impl SnapshotLocator {
    pub fn new(config: SnapshotFileConfig) -> Self {
        Self { config }
    }

    pub fn with_defaults() -> Self {
        Self::new(SnapshotFileConfig::default())
    }

    /// Snapshot stored directly inside `dir`.
    pub fn in_directory(dir: impl AsRef<Path>) -> Self {
        Self::new(SnapshotFileConfig {
            base_directory: Some(dir.as_ref().display().to_string()),
            ..SnapshotFileConfig::default()
        })
    }

    /// Directory holding the snapshot.
    ///
    /// An explicit base directory is used as is; OS defaults get the app
    /// subdirectory appended.
    pub fn directory(&self) -> PathBuf {
        if let Some(ref base) = self.config.base_directory {
            return PathBuf::from(base);
        }

        let root = match self.config.service_context {
            ServiceContext::System => system_directory(),
            ServiceContext::User | ServiceContext::Session => user_directory(),
        };
        root.join(&self.config.app_name)
    }

    pub fn snapshot_path(&self) -> PathBuf {
        self.directory().join(&self.config.file_name)
    }
}

fn system_directory() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        PathBuf::from(std::env::var("ProgramData").unwrap_or_else(|_| "C:\\ProgramData".to_string()))
    }

    #[cfg(not(target_os = "windows"))]
    {
        PathBuf::from("/var/lib")
    }
}

fn user_directory() -> PathBuf {
    dirs::data_local_dir().unwrap_or_else(|| {
        dirs::home_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join(".local")
            .join("share")
    })
}
