//! Snapshot format and atomic file I/O.

use chrono::{DateTime, Utc};
use procmaster_common::{ProcessSpec, SupervisorError, SupervisorResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

/// Highest snapshot format version this build reads and the one it writes.
///
/// Version 0 is the legacy format: a bare JSON array of entries.
pub const SNAPSHOT_VERSION: u32 = 1;

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// One persisted process definition.
///
/// Unknown fields are ignored on read and optional fields default, so newer
/// writers can add fields without breaking older readers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotEntry {
    pub name: String,
    pub source_path: String,
    #[serde(default)]
    pub keep_alive: bool,
    #[serde(default)]
    pub args: Vec<String>,
}

impl From<&ProcessSpec> for SnapshotEntry {
    fn from(spec: &ProcessSpec) -> Self {
        Self {
            name: spec.name.clone(),
            source_path: spec.source_path.clone(),
            keep_alive: spec.keep_alive,
            args: spec.args.clone(),
        }
    }
}

impl From<SnapshotEntry> for ProcessSpec {
    fn from(entry: SnapshotEntry) -> Self {
        ProcessSpec {
            name: entry.name,
            source_path: entry.source_path,
            keep_alive: entry.keep_alive,
            args: entry.args,
        }
    }
}

/// The persisted process set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub version: u32,
    #[serde(default)]
    pub saved_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub processes: Vec<SnapshotEntry>,
}

impl Snapshot {
    /// A current-version snapshot of `specs`, stamped now.
    pub fn from_specs<'a>(specs: impl IntoIterator<Item = &'a ProcessSpec>) -> Self {
        Self {
            version: SNAPSHOT_VERSION,
            saved_at: Some(Utc::now()),
            processes: specs.into_iter().map(SnapshotEntry::from).collect(),
        }
    }

    pub fn into_specs(self) -> Vec<ProcessSpec> {
        self.processes.into_iter().map(ProcessSpec::from).collect()
    }

    /// Parse any supported version.
    pub fn parse(path: &Path, content: &str) -> SupervisorResult<Self> {
        let parse_err = |e: serde_json::Error| {
            SupervisorError::persistence(path.display().to_string(), format!("parse error: {}", e))
        };

        let value: serde_json::Value = serde_json::from_str(content).map_err(parse_err)?;

        if value.is_array() {
            let processes: Vec<SnapshotEntry> = serde_json::from_value(value).map_err(parse_err)?;
            return Ok(Self {
                version: 0,
                saved_at: None,
                processes,
            });
        }

        let snapshot: Snapshot = serde_json::from_value(value).map_err(parse_err)?;
        if snapshot.version > SNAPSHOT_VERSION {
            return Err(SupervisorError::persistence(
                path.display().to_string(),
                format!(
                    "snapshot version {} is newer than supported version {}",
                    snapshot.version, SNAPSHOT_VERSION
                ),
            ));
        }
        Ok(snapshot)
    }
}

fn temp_sibling(path: &Path) -> PathBuf {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "snapshot".to_string());
    let unique = TEMP_COUNTER.fetch_add(1, Ordering::Relaxed);
    path.with_file_name(format!(
        ".{}.{}.{}.tmp",
        file_name,
        std::process::id(),
        unique
    ))
}

/// Write `snapshot` to `path` atomically.
///
/// The data goes to a temporary sibling which is synced and then renamed over
/// `path`, so readers see either the old or the new snapshot, never a
/// partial one.
pub async fn save_snapshot(path: &Path, snapshot: &Snapshot) -> SupervisorResult<()> {
    let io_err = |what: &str, e: std::io::Error| {
        SupervisorError::persistence(path.display().to_string(), format!("{}: {}", what, e))
    };

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| io_err("failed to create directory", e))?;
        }
    }

    let json = serde_json::to_vec_pretty(snapshot).map_err(|e| {
        SupervisorError::persistence(path.display().to_string(), format!("serialize error: {}", e))
    })?;

    let temp_path = temp_sibling(path);
    let written: std::io::Result<()> = async {
        let mut file = tokio::fs::File::create(&temp_path).await?;
        file.write_all(&json).await?;
        file.sync_all().await?;
        Ok(())
    }
    .await;

    if let Err(e) = written {
        let _ = tokio::fs::remove_file(&temp_path).await;
        return Err(io_err("failed to write temporary snapshot", e));
    }

    if let Err(e) = tokio::fs::rename(&temp_path, path).await {
        let _ = tokio::fs::remove_file(&temp_path).await;
        return Err(io_err("failed to replace snapshot", e));
    }

    #[cfg(unix)]
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        match tokio::fs::File::open(parent).await {
            Ok(dir) => {
                if let Err(e) = dir.sync_all().await {
                    debug!("Failed to sync directory {}: {}", parent.display(), e);
                }
            }
            Err(e) => debug!("Failed to open directory {} for sync: {}", parent.display(), e),
        }
    }

    info!(
        "Saved snapshot with {} process(es) to {}",
        snapshot.processes.len(),
        path.display()
    );
    Ok(())
}

/// Read and parse the snapshot at `path`.
pub async fn load_snapshot(path: &Path) -> SupervisorResult<Snapshot> {
    let content = tokio::fs::read_to_string(path).await.map_err(|e| {
        SupervisorError::persistence(path.display().to_string(), format!("read error: {}", e))
    })?;

    let snapshot = Snapshot::parse(path, &content)?;
    debug!(
        "Loaded snapshot version {} with {} process(es) from {}",
        snapshot.version,
        snapshot.processes.len(),
        path.display()
    );
    Ok(snapshot)
}
