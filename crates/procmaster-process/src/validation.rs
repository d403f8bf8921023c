//! Launch request validation.

use procmaster_common::{ProcessSpec, SupervisorError, SupervisorResult};

/// Reject launch requests that cannot name or locate a process.
///
/// Whether the executable exists is left to the spawn itself so that the
/// OS error is reported as `LaunchFailed`.
pub fn validate_spec(spec: &ProcessSpec) -> SupervisorResult<()> {
    spec.check().map_err(SupervisorError::invalid_request)
}

/// Reject empty process names on by-name operations.
pub fn validate_name(name: &str) -> SupervisorResult<()> {
    if name.trim().is_empty() {
        return Err(SupervisorError::invalid_request(
            "process name must not be empty",
        ));
    }
    Ok(())
}
