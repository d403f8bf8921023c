//! Process termination primitives.

use procmaster_common::{SupervisorError, SupervisorResult};

/// Ask a process to exit (SIGTERM on Unix).
///
/// A process that is already gone is not an error.
pub fn terminate_gracefully(name: &str, pid: u32) -> SupervisorResult<()> {
    send_signal(name, pid, Signal::Terminate)
}

/// Kill a process outright (SIGKILL on Unix).
pub fn force_kill(name: &str, pid: u32) -> SupervisorResult<()> {
    send_signal(name, pid, Signal::Kill)
}

#[derive(Debug, Clone, Copy)]
enum Signal {
    Terminate,
    Kill,
}

#[cfg(unix)]
fn send_signal(name: &str, pid: u32, signal: Signal) -> SupervisorResult<()> {
    use nix::errno::Errno;
    use nix::sys::signal::{kill, Signal as NixSignal};
    use nix::unistd::Pid;

    let raw = i32::try_from(pid)
        .map_err(|_| SupervisorError::termination_failed(name, format!("pid {} out of range", pid)))?;
    let nix_signal = match signal {
        Signal::Terminate => NixSignal::SIGTERM,
        Signal::Kill => NixSignal::SIGKILL,
    };

    match kill(Pid::from_raw(raw), nix_signal) {
        Ok(()) => {
            tracing::debug!("Sent {:?} to {} (pid {})", nix_signal, name, pid);
            Ok(())
        }
        Err(Errno::ESRCH) => Ok(()),
        Err(e) => Err(SupervisorError::termination_failed(
            name,
            format!("failed to send {:?} to pid {}: {}", nix_signal, pid, e),
        )),
    }
}

#[cfg(not(unix))]
fn send_signal(name: &str, pid: u32, signal: Signal) -> SupervisorResult<()> {
    Err(SupervisorError::termination_failed(
        name,
        format!("{:?} by pid {} is not supported on this platform", signal, pid),
    ))
}
