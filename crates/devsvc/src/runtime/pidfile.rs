//! Pid records under the state root, so later invocations can find a running service

use crate::runtime::process::pid_is_alive;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Contents of `<state_root>/<service>.pid`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PidRecord {
    /// The service process
    pub pid: u32,
    /// The devsvc process supervising it
    pub supervisor: u32,
    /// Spawn time, seconds since the unix epoch
    pub started_at: u64,
}

impl PidRecord {
    pub fn new(pid: u32) -> Self {
        let started_at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        Self {
            pid,
            supervisor: std::process::id(),
            started_at,
        }
    }

    pub fn started_at(&self) -> SystemTime {
        UNIX_EPOCH + Duration::from_secs(self.started_at)
    }

    pub fn service_alive(&self) -> bool {
        pid_is_alive(self.pid)
    }

    /// Supervisor is alive and is not the current process
    pub fn supervisor_elsewhere(&self) -> bool {
        self.supervisor != std::process::id() && pid_is_alive(self.supervisor)
    }
}

#[derive(Debug, Clone)]
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    pub fn for_service(state_root: &Path, service_name: &str) -> Self {
        Self {
            path: state_root.join(format!("{}.pid", service_name)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Atomically replace the record
    pub fn write(&self, record: &PidRecord) -> std::io::Result<()> {
        let tmp = self.path.with_extension("pid.tmp");
        let content = serde_json::to_vec(record).map_err(std::io::Error::other)?;
        std::fs::write(&tmp, content)?;
        std::fs::rename(&tmp, &self.path)
    }

    /// Read the record; a missing or unreadable file reads as `None`
    pub fn read(&self) -> Option<PidRecord> {
        let content = match std::fs::read(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                log::warn!("Failed to read pidfile '{}': {}", self.path.display(), e);
                return None;
            }
        };
        match serde_json::from_slice(&content) {
            Ok(record) => Some(record),
            Err(e) => {
                log::warn!("Ignoring corrupt pidfile '{}': {}", self.path.display(), e);
                None
            }
        }
    }

    /// Read the record, removing it when neither recorded process is alive
    pub fn read_live(&self) -> Option<PidRecord> {
        let record = self.read()?;
        if record.service_alive() || record.supervisor_elsewhere() {
            return Some(record);
        }
        log::debug!("Removing stale pidfile '{}'", self.path.display());
        if let Err(e) = self.remove() {
            log::warn!("Failed to remove stale pidfile '{}': {}", self.path.display(), e);
        }
        None
    }

    /// Remove the record; a missing file is not an error
    pub fn remove(&self) -> std::io::Result<()> {
        match std::fs::remove_file(&self.path) {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn test_write_read_remove() {
        let dir = tempfile::tempdir().unwrap();
        let pidfile = PidFile::for_service(dir.path(), "db");
        assert_eq!(pidfile.path(), dir.path().join("db.pid"));
        assert_eq!(pidfile.read(), None);

        let record = PidRecord::new(std::process::id());
        pidfile.write(&record).unwrap();
        assert_eq!(pidfile.read(), Some(record));
        assert_eq!(pidfile.read_live(), Some(record));

        pidfile.remove().unwrap();
        pidfile.remove().unwrap();
        assert_eq!(pidfile.read(), None);
    }

    #[test]
    fn test_stale_record_is_removed() {
        let dir = tempfile::tempdir().unwrap();
        let pidfile = PidFile::for_service(dir.path(), "db");

        let mut child = std::process::Command::new("/bin/sh")
            .args(["-c", "exit 0"])
            .spawn()
            .unwrap();
        let pid = child.id();
        child.wait().unwrap();

        let record = PidRecord {
            pid,
            supervisor: pid,
            started_at: 0,
        };
        pidfile.write(&record).unwrap();
        assert_eq!(pidfile.read_live(), None);
        assert!(!pidfile.path().exists());
    }

    #[test]
    fn test_corrupt_record_reads_as_none() {
        let dir = tempfile::tempdir().unwrap();
        let pidfile = PidFile::for_service(dir.path(), "db");
        std::fs::write(pidfile.path(), "not json").unwrap();
        assert_eq!(pidfile.read(), None);
    }
}
