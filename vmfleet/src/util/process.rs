//! Process helpers for pidfile-tracked engine instances.

use std::path::Path;
use vmfleet_shared::errors::{FleetError, FleetResult};

/// Read PID from file.
///
/// The engine writes its pidfile after daemonizing. The file contains a PID as
/// a decimal string, optionally with a trailing newline.
pub fn read_pid_file(path: &Path) -> FleetResult<u32> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        FleetError::Io(std::io::Error::new(
            e.kind(),
            format!("failed to read PID file {}: {e}", path.display()),
        ))
    })?;

    content.trim().parse::<u32>().map_err(|e| {
        FleetError::Config(format!(
            "invalid PID in file {}: '{}' - {}",
            path.display(),
            content.trim(),
            e
        ))
    })
}

/// Check if a process with the given PID exists.
///
/// Uses `kill(pid, 0)`. `EPERM` means the process exists but belongs to another
/// user, which is the normal case for engines started through `sudo`.
pub fn is_process_alive(pid: u32) -> bool {
    let Ok(pid) = i32::try_from(pid) else {
        return false;
    };
    if pid <= 0 {
        return false;
    }
    if unsafe { libc::kill(pid, 0) } == 0 {
        return true;
    }
    std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}
