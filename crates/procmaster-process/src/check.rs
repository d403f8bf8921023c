//! Process existence checks.

use procmaster_common::{SupervisorError, SupervisorResult};

/// Check if a process with the given PID exists.
///
/// On Unix this is `kill(pid, 0)`: no signal is delivered, only the
/// existence and permission checks run. A process we may not signal still
/// exists.
///
/// # Returns
///
/// * `Ok(true)` - Process exists
/// * `Ok(false)` - No such process
/// * `Err(_)` - The check itself failed
pub fn process_exists(pid: u32) -> SupervisorResult<bool> {
    #[cfg(unix)]
    {
        use nix::errno::Errno;
        use nix::sys::signal::kill;
        use nix::unistd::Pid;

        let raw = i32::try_from(pid).map_err(|_| {
            SupervisorError::invalid_request(format!("pid {} out of range", pid))
        })?;

        match kill(Pid::from_raw(raw), None) {
            Ok(()) => Ok(true),
            Err(Errno::ESRCH) => Ok(false),
            Err(Errno::EPERM) => Ok(true),
            Err(e) => Err(SupervisorError::unavailable(format!(
                "failed to check pid {}: {}",
                pid, e
            ))),
        }
    }

    #[cfg(not(unix))]
    {
        Err(SupervisorError::unavailable(format!(
            "process existence check for pid {} is not supported on this platform",
            pid
        )))
    }
}
