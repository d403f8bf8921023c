use anyhow::{Context, Result};
use procmaster_process::OutputRoute;
use procmaster_process_control::ControlConfig;
use procmaster_snapshot::{SnapshotFileConfig, SnapshotLocator};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::lifecycle::RestartPolicy;

pub mod validation;

pub use validation::ListenAddress;

/// Top-level supervisor configuration.
///
/// Every section is optional in YAML; a missing section takes its defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SupervisorConfig {
    #[serde(default)]
    pub supervisor: SupervisorOptions,
    #[serde(default)]
    pub snapshot: SnapshotFileConfig,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    #[serde(default)]
    pub restart_policy: RestartPolicyConfig,
}

/// Daemon options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorOptions {
    /// `tcp://host:port` or `unix:///path/to.sock`
    #[serde(default = "default_listen")]
    pub listen: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Per-process stdout/stderr logs go here when set; otherwise output is
    /// discarded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_directory: Option<String>,
    #[serde(default)]
    pub resurrect_on_start: bool,
    #[serde(default)]
    pub save_on_shutdown: bool,
}

impl Default for SupervisorOptions {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            log_level: default_log_level(),
            log_directory: None,
            resurrect_on_start: false,
            save_on_shutdown: false,
        }
    }
}

/// Bounds on launch and termination.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeoutConfig {
    /// Upper bound for a launch to be confirmed.
    #[serde(default = "default_launch_timeout", with = "duration_serde")]
    pub launch: Duration,
    /// Wait after SIGTERM before the forced kill.
    #[serde(default = "default_graceful_stop", with = "duration_serde")]
    pub graceful_stop: Duration,
    /// Wait after the forced kill before giving up.
    #[serde(default = "default_force_kill", with = "duration_serde")]
    pub force_kill: Duration,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            launch: default_launch_timeout(),
            graceful_stop: default_graceful_stop(),
            force_kill: default_force_kill(),
        }
    }
}

impl TimeoutConfig {
    /// Upper bound for a whole termination, graceful phase plus forced kill.
    pub fn stop_budget(&self) -> Duration {
        self.graceful_stop + self.force_kill + STOP_MARGIN
    }
}

const STOP_MARGIN: Duration = Duration::from_secs(1);

/// Keep-alive restart backoff.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RestartPolicyConfig {
    #[serde(default = "default_min_interval", with = "duration_serde")]
    pub min_interval: Duration,
    #[serde(default = "default_backoff_rate")]
    pub backoff_rate: f64,
    #[serde(default = "default_max_interval", with = "duration_serde")]
    pub max_interval: Duration,
    /// A run lasting this long clears the consecutive failure count.
    #[serde(default = "default_reset_after", with = "duration_serde")]
    pub reset_after: Duration,
    #[serde(default = "default_max_consecutive_failures")]
    pub max_consecutive_failures: u32,
    /// How often due restarts are dispatched.
    #[serde(default = "default_check_interval", with = "duration_serde")]
    pub check_interval: Duration,
}

impl Default for RestartPolicyConfig {
    fn default() -> Self {
        Self {
            min_interval: default_min_interval(),
            backoff_rate: default_backoff_rate(),
            max_interval: default_max_interval(),
            reset_after: default_reset_after(),
            max_consecutive_failures: default_max_consecutive_failures(),
            check_interval: default_check_interval(),
        }
    }
}

impl SupervisorConfig {
    /// Load configuration from a YAML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;

        Self::load_from_string(&content)
    }

    /// Load configuration from a YAML string
    pub fn load_from_string(content: &str) -> Result<Self> {
        let config: SupervisorConfig =
            serde_yaml::from_str(content).context("Failed to parse YAML configuration")?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        validation::validate_config(self)
    }

    pub fn listen_address(&self) -> Result<ListenAddress> {
        ListenAddress::parse(&self.supervisor.listen)
    }

    pub fn restart_policy(&self) -> RestartPolicy {
        RestartPolicy::from(&self.restart_policy)
    }

    /// Settings handed to every process control.
    pub fn control_config(&self) -> ControlConfig {
        ControlConfig {
            graceful_timeout: self.timeouts.graceful_stop,
            force_kill_timeout: self.timeouts.force_kill,
            output: OutputRoute::from_directory(
                self.supervisor.log_directory.as_deref().map(Path::new),
            ),
        }
    }

    pub fn snapshot_locator(&self) -> SnapshotLocator {
        SnapshotLocator::new(self.snapshot.clone())
    }

    pub fn snapshot_path(&self) -> PathBuf {
        self.snapshot_locator().snapshot_path()
    }
}

fn default_listen() -> String {
    "tcp://127.0.0.1:7071".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_launch_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_graceful_stop() -> Duration {
    Duration::from_secs(5)
}

fn default_force_kill() -> Duration {
    Duration::from_secs(3)
}

fn default_min_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_backoff_rate() -> f64 {
    2.0
}

fn default_max_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_reset_after() -> Duration {
    Duration::from_secs(30)
}

fn default_max_consecutive_failures() -> u32 {
    10
}

fn default_check_interval() -> Duration {
    Duration::from_millis(250)
}

// Durations are written as "250ms", "5s" or "2m".
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if duration.subsec_millis() == 0 {
            serializer.serialize_str(&format!("{}s", duration.as_secs()))
        } else {
            serializer.serialize_str(&format!("{}ms", duration.as_millis()))
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse_duration(&s).map_err(serde::de::Error::custom)
    }

    pub(super) fn parse_duration(s: &str) -> Result<Duration, String> {
        let s = s.trim();
        let invalid = || format!("Invalid duration: {}", s);

        // "ms" before "s"
        if let Some(num) = s.strip_suffix("ms") {
            let millis: u64 = num.trim().parse().map_err(|_| invalid())?;
            Ok(Duration::from_millis(millis))
        } else if let Some(num) = s.strip_suffix('s') {
            let secs: u64 = num.trim().parse().map_err(|_| invalid())?;
            Ok(Duration::from_secs(secs))
        } else if let Some(num) = s.strip_suffix('m') {
            let mins: u64 = num.trim().parse().map_err(|_| invalid())?;
            Ok(Duration::from_secs(mins * 60))
        } else {
            Err(format!("Duration must end with 's', 'ms', or 'm': {}", s))
        }
    }
}
