//! Pid file bookkeeping for workers that outlive the CLI process.
//!
//! A pid file is a hint, not a lock: the recorded pid is only trusted after
//! an OS liveness check. Stale files (machine reboot, killed worker) are an
//! expected state and read as "nothing running".

use std::fs;
use std::path::Path;

use tracing::{debug, warn};

use crate::error::Result;
use crate::logging::create_parent_dirs;
use crate::process::pid_alive;

/// Write `pid` to `path` atomically (temp file + rename).
pub fn write_pid_file(path: &Path, pid: u32) -> Result<()> {
    create_parent_dirs(path)?;
    let tmp = path.with_extension("pid.tmp");
    fs::write(&tmp, format!("{pid}\n"))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&tmp, fs::Permissions::from_mode(0o600))?;
    }
    fs::rename(&tmp, path)?;
    debug!(path = %path.display(), pid, "pid file written");
    Ok(())
}

/// Read the recorded pid, if any.
///
/// Missing files and unparseable contents both read as `None`; garbage is
/// logged since it usually means something else wrote to our path.
#[must_use]
pub fn read_pid_file(path: &Path) -> Option<u32> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return None,
        Err(err) => {
            warn!(path = %path.display(), error = %err, "pid file unreadable");
            return None;
        }
    };
    match contents.trim().parse::<u32>() {
        Ok(pid) => Some(pid),
        Err(_) => {
            warn!(path = %path.display(), "pid file holds garbage, ignoring");
            None
        }
    }
}

/// Read the recorded pid and keep it only if that process is running.
#[must_use]
pub fn read_live_pid(path: &Path) -> Option<u32> {
    let pid = read_pid_file(path)?;
    if pid_alive(pid) {
        Some(pid)
    } else {
        debug!(path = %path.display(), pid, "pid file is stale");
        None
    }
}

/// Delete the pid file, tolerating one that is already gone.
pub fn remove_pid_file(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err.into()),
    }
}
