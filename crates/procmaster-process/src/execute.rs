//! Process spawning.

use procmaster_common::{SupervisorError, SupervisorResult};
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::{Child, Command};
use tracing::debug;

/// Where a child's stdout and stderr go.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum OutputRoute {
    /// Both streams go to the null device.
    #[default]
    Discard,
    /// Both streams are appended to `<name>.out.log` and `<name>.err.log`
    /// inside the directory.
    LogDirectory(PathBuf),
}

impl OutputRoute {
    pub fn from_directory(dir: Option<&Path>) -> Self {
        match dir {
            Some(dir) => OutputRoute::LogDirectory(dir.to_path_buf()),
            None => OutputRoute::Discard,
        }
    }

    /// Stdout/stderr log file paths for `name`, if logging to files.
    pub fn log_paths(&self, name: &str) -> Option<(PathBuf, PathBuf)> {
        match self {
            OutputRoute::Discard => None,
            OutputRoute::LogDirectory(dir) => Some((
                dir.join(format!("{}.out.log", name)),
                dir.join(format!("{}.err.log", name)),
            )),
        }
    }

    fn open(&self, name: &str) -> std::io::Result<(Stdio, Stdio)> {
        match self.log_paths(name) {
            None => Ok((Stdio::null(), Stdio::null())),
            Some((out, err)) => {
                if let Some(dir) = out.parent() {
                    std::fs::create_dir_all(dir)?;
                }
                let out = OpenOptions::new().create(true).append(true).open(out)?;
                let err = OpenOptions::new().create(true).append(true).open(err)?;
                Ok((Stdio::from(out), Stdio::from(err)))
            }
        }
    }
}

/// Spawn `executable` with `args` for the process record `name`.
///
/// Stdin is closed. The child is killed if its handle is dropped and, on
/// Unix, runs in its own process group so terminal signals aimed at the
/// supervisor do not reach it.
pub fn spawn_process(
    name: &str,
    executable: &str,
    args: &[String],
    output: &OutputRoute,
) -> SupervisorResult<Child> {
    let (stdout, stderr) = output.open(name).map_err(|e| {
        SupervisorError::launch_failed(name, format!("cannot open log files: {}", e))
    })?;

    let mut cmd = Command::new(executable);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(stdout)
        .stderr(stderr)
        .kill_on_drop(true);

    #[cfg(unix)]
    cmd.process_group(0);

    let child = cmd
        .spawn()
        .map_err(|e| SupervisorError::launch_failed_io(name, &e))?;

    debug!(
        "Spawned {} from {} (pid {:?})",
        name,
        executable,
        child.id()
    );
    Ok(child)
}
