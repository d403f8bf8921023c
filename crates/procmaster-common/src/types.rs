//! Core domain types shared across procmaster.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Everything needed to launch a supervised process identically.
///
/// This is the durable part of a process record: it is what `save` writes
/// and what `resurrect` relaunches from. Runtime fields (pid, status,
/// restart count) never appear here.
///
/// # Example
/// ```
/// use procmaster_common::ProcessSpec;
///
/// let spec = ProcessSpec::new("worker", "/usr/local/bin/worker")
///     .with_keep_alive(true)
///     .with_args(["--port", "8080"]);
/// assert_eq!(spec.args.len(), 2);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessSpec {
    /// Logical name, unique across the store.
    pub name: String,

    /// Path of the executable artifact to run.
    pub source_path: String,

    /// Restart automatically after an unexpected exit.
    #[serde(default)]
    pub keep_alive: bool,

    /// Ordered launch arguments.
    #[serde(default)]
    pub args: Vec<String>,
}

impl ProcessSpec {
    pub fn new(name: impl Into<String>, source_path: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            source_path: source_path.into(),
            keep_alive: false,
            args: Vec::new(),
        }
    }

    pub fn with_keep_alive(mut self, keep_alive: bool) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Checks the fields a launch cannot do without.
    ///
    /// Returns a human-readable reason on failure.
    pub fn check(&self) -> std::result::Result<(), String> {
        if self.name.trim().is_empty() {
            return Err("process name must not be empty".to_string());
        }
        if self.name.chars().any(|c| c.is_control() || c == '/' || c == '\\') {
            return Err(format!(
                "process name '{}' must not contain control characters or path separators",
                self.name.escape_debug()
            ));
        }
        if self.source_path.trim().is_empty() {
            return Err(format!("source path for '{}' must not be empty", self.name));
        }
        Ok(())
    }
}

impl fmt::Display for ProcessSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.source_path)
    }
}
