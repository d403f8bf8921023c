use super::*;
use anyhow::{anyhow, bail, Result};
use std::fmt;

/// Where the remote surface listens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenAddress {
    /// `host:port`; the host may be a name.
    Tcp(String),
    Unix(PathBuf),
}

impl ListenAddress {
    /// Parse `tcp://host:port` or `unix:///path`.
    pub fn parse(s: &str) -> Result<Self> {
        if let Some(rest) = s.strip_prefix("tcp://") {
            let (host, port) = rest
                .rsplit_once(':')
                .ok_or_else(|| anyhow!("TCP listen address needs host:port: {}", s))?;
            if host.is_empty() {
                bail!("TCP listen address has an empty host: {}", s);
            }
            port.parse::<u16>()
                .map_err(|_| anyhow!("Invalid port in listen address: {}", s))?;
            Ok(Self::Tcp(rest.to_string()))
        } else if let Some(path) = s.strip_prefix("unix://") {
            if path.is_empty() {
                bail!("Unix socket listen address has an empty path: {}", s);
            }
            Ok(Self::Unix(PathBuf::from(path)))
        } else {
            bail!("Listen address must start with tcp:// or unix://: {}", s)
        }
    }
}

impl fmt::Display for ListenAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp(addr) => write!(f, "tcp://{}", addr),
            Self::Unix(path) => write!(f, "unix://{}", path.display()),
        }
    }
}

/// Validate the complete configuration
pub fn validate_config(config: &SupervisorConfig) -> Result<()> {
    validate_supervisor_options(&config.supervisor)?;
    validate_snapshot_config(&config.snapshot)?;
    validate_timeouts(&config.timeouts)?;
    validate_restart_policy(&config.restart_policy)?;
    Ok(())
}

fn validate_supervisor_options(options: &SupervisorOptions) -> Result<()> {
    ListenAddress::parse(&options.listen)?;

    if let Some(ref dir) = options.log_directory {
        if dir.trim().is_empty() {
            bail!("log_directory cannot be empty when set");
        }
    }

    match options.log_level.to_lowercase().as_str() {
        "trace" | "debug" | "info" | "warn" | "error" => Ok(()),
        _ => Err(anyhow!(
            "Invalid log level: {}, must be one of: trace, debug, info, warn, error",
            options.log_level
        )),
    }
}

fn validate_snapshot_config(snapshot: &SnapshotFileConfig) -> Result<()> {
    if snapshot.file_name.is_empty() || snapshot.file_name.contains(['/', '\\']) {
        bail!("Snapshot file name must be a plain file name: {:?}", snapshot.file_name);
    }
    if snapshot.base_directory.is_none() && snapshot.app_name.is_empty() {
        bail!("Snapshot app_name cannot be empty without a base_directory");
    }
    Ok(())
}

fn validate_timeouts(timeouts: &TimeoutConfig) -> Result<()> {
    for (name, value) in [
        ("launch", timeouts.launch),
        ("graceful_stop", timeouts.graceful_stop),
        ("force_kill", timeouts.force_kill),
    ] {
        if value.is_zero() {
            bail!("Timeout {} must be greater than 0", name);
        }
    }
    Ok(())
}

fn validate_restart_policy(policy: &RestartPolicyConfig) -> Result<()> {
    if policy.min_interval.is_zero() {
        bail!("restart_policy.min_interval must be greater than 0");
    }
    if policy.max_interval < policy.min_interval {
        bail!(
            "restart_policy.max_interval ({:?}) must not be below min_interval ({:?})",
            policy.max_interval,
            policy.min_interval
        );
    }
    if !policy.backoff_rate.is_finite() || policy.backoff_rate < 1.0 {
        bail!(
            "restart_policy.backoff_rate must be at least 1.0, got: {}",
            policy.backoff_rate
        );
    }
    if policy.max_consecutive_failures == 0 {
        bail!("restart_policy.max_consecutive_failures must be at least 1");
    }
    if policy.check_interval.is_zero() {
        bail!("restart_policy.check_interval must be greater than 0");
    }
    Ok(())
}
