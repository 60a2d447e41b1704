//! Process-identity handle.
//!
//! A recording process announces itself with a pid file at a well-known
//! location from Starting until Closed/Failed. `syncap stop` reads it to
//! deliver the interrupt.

use std::path::{Path, PathBuf};

use syncap_common::error::{RecorderError, RecorderResult};

/// A pid file owned by this process. Removed on [`remove`](Self::remove)
/// or drop.
#[derive(Debug)]
pub struct PidFile {
    path: PathBuf,
    removed: bool,
}

impl PidFile {
    /// Write the current pid to `path`.
    ///
    /// Refuses when the file names another live process; a stale file left
    /// by a crashed recorder is replaced.
    pub fn create(path: impl Into<PathBuf>) -> RecorderResult<Self> {
        let path = path.into();
        if let Some(existing) = read_pid(&path)? {
            if existing != std::process::id() && process_alive(existing) {
                return Err(RecorderError::session(format!(
                    "Another recorder (pid {existing}) holds {}",
                    path.display()
                )));
            }
            tracing::warn!(pid = existing, path = %path.display(), "Replacing stale pid file");
        }
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, format!("{}\n", std::process::id()))?;
        tracing::debug!(path = %path.display(), pid = std::process::id(), "Wrote pid file");
        Ok(Self {
            path,
            removed: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn remove(&mut self) -> RecorderResult<()> {
        if self.removed {
            return Ok(());
        }
        self.removed = true;
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        if let Err(e) = self.remove() {
            tracing::warn!(path = %self.path.display(), error = %e, "Failed to remove pid file");
        }
    }
}

/// Pid recorded in `path`, `None` if the file does not exist.
pub fn read_pid(path: &Path) -> RecorderResult<Option<u32>> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    content
        .trim()
        .parse::<u32>()
        .map(Some)
        .map_err(|e| RecorderError::session(format!("Malformed pid file {}: {e}", path.display())))
}

/// Whether a process with this pid exists.
#[cfg(unix)]
pub fn process_alive(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    // Signal 0 only checks for existence; EPERM still means it exists.
    let rc = unsafe { libc::kill(pid, 0) };
    rc == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
pub fn process_alive(_pid: u32) -> bool {
    false
}

/// Deliver the interrupt that stops a recorder.
#[cfg(unix)]
pub fn send_interrupt(pid: u32) -> RecorderResult<()> {
    let target = libc::pid_t::try_from(pid)
        .map_err(|_| RecorderError::session(format!("pid {pid} out of range")))?;
    let rc = unsafe { libc::kill(target, libc::SIGINT) };
    if rc != 0 {
        return Err(std::io::Error::last_os_error().into());
    }
    Ok(())
}

#[cfg(not(unix))]
pub fn send_interrupt(_pid: u32) -> RecorderResult<()> {
    Err(RecorderError::unsupported(
        "delivering an interrupt to another process is only supported on unix",
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_and_remove() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run").join("syncap.pid");
        let mut pid = PidFile::create(&path).unwrap();
        assert_eq!(read_pid(&path).unwrap(), Some(std::process::id()));
        pid.remove().unwrap();
        assert!(!path.exists());
        assert_eq!(read_pid(&path).unwrap(), None);
    }

    #[test]
    fn test_drop_removes_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("syncap.pid");
        {
            let _pid = PidFile::create(&path).unwrap();
            assert!(path.exists());
        }
        assert!(!path.exists());
    }

    #[cfg(unix)]
    #[test]
    fn test_live_owner_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("syncap.pid");
        // pid 1 always exists on unix.
        std::fs::write(&path, "1\n").unwrap();
        let err = PidFile::create(&path).unwrap_err();
        assert!(err.to_string().contains("pid 1"));
    }

    #[test]
    fn test_stale_file_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("syncap.pid");
        std::fs::write(&path, format!("{}\n", i32::MAX)).unwrap();
        let _pid = PidFile::create(&path).unwrap();
        assert_eq!(read_pid(&path).unwrap(), Some(std::process::id()));
    }

    #[test]
    fn test_malformed_pid_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("syncap.pid");
        std::fs::write(&path, "not a pid").unwrap();
        assert!(read_pid(&path).is_err());
    }
}
