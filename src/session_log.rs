//! Append-only per-run log shared by every phase.
//!
//! The file is created once at startup with owner-only permissions and is
//! never truncated or rotated while the run is in progress. Captured command
//! output and `tracing` events both land here.

use chrono::Local;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::error::ProvisionError;

const FILE_PREFIX: &str = "webverse-provision";

#[derive(Debug)]
pub struct SessionLog {
    path: PathBuf,
    file: Mutex<File>,
}

impl SessionLog {
    /// Creates a fresh, timestamped log file inside `dir`.
    pub fn create(dir: &Path) -> Result<Self, ProvisionError> {
        fs::create_dir_all(dir)?;
        let stamp = Local::now().format("%Y%m%d-%H%M%S");
        let mut path = dir.join(format!("{FILE_PREFIX}-{stamp}.log"));
        let mut suffix = 1;
        while path.exists() {
            path = dir.join(format!("{FILE_PREFIX}-{stamp}-{suffix}.log"));
            suffix += 1;
        }
        Self::open(path)
    }

    fn open(path: PathBuf) -> Result<Self, ProvisionError> {
        let mut options = OpenOptions::new();
        options.create_new(true).append(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let file = options.open(&path)?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// A second handle to the same file, used as the `tracing` writer.
    pub fn try_clone_file(&self) -> io::Result<File> {
        self.lock().try_clone()
    }

    pub fn append_line(&self, line: &str) {
        let mut file = self.lock();
        let _ = writeln!(file, "{line}");
    }

    pub fn append_bytes(&self, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }
        let mut file = self.lock();
        let _ = file.write_all(bytes);
        if !bytes.ends_with(b"\n") {
            let _ = file.write_all(b"\n");
        }
    }

    /// Last `lines` lines of the log.
    pub fn tail(&self, lines: usize) -> Vec<String> {
        let content = match fs::read(&self.path) {
            Ok(bytes) => String::from_utf8_lossy(&bytes).to_string(),
            Err(_) => return Vec::new(),
        };
        let all: Vec<&str> = content.lines().collect();
        let start = all.len().saturating_sub(lines);
        all[start..].iter().map(|line| line.to_string()).collect()
    }

    /// Hands the file to the target identity so it can read the log after a
    /// sudo-elevated run.
    #[cfg(unix)]
    pub fn hand_to(&self, uid: u32, gid: u32) -> Result<(), ProvisionError> {
        std::os::unix::fs::chown(&self.path, Some(uid), Some(gid))?;
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, File> {
        match self.file.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn create_uses_timestamped_name_and_owner_only_mode() {
        let dir = tempdir().unwrap();
        let log = SessionLog::create(dir.path()).unwrap();
        let name = log.path().file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("webverse-provision-"));
        assert!(name.ends_with(".log"));

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(log.path()).unwrap().permissions().mode() & 0o777;
            assert_eq!(mode, 0o600);
        }
    }

    #[test]
    fn two_logs_in_same_second_do_not_collide() {
        let dir = tempdir().unwrap();
        let first = SessionLog::create(dir.path()).unwrap();
        let second = SessionLog::create(dir.path()).unwrap();
        assert_ne!(first.path(), second.path());
    }

    #[test]
    fn tail_returns_last_lines_in_order() {
        let dir = tempdir().unwrap();
        let log = SessionLog::create(dir.path()).unwrap();
        for i in 0..100 {
            log.append_line(&format!("line {i}"));
        }
        let tail = log.tail(80);
        assert_eq!(tail.len(), 80);
        assert_eq!(tail[0], "line 20");
        assert_eq!(tail[79], "line 99");
    }

    #[test]
    fn append_bytes_terminates_partial_lines() {
        let dir = tempdir().unwrap();
        let log = SessionLog::create(dir.path()).unwrap();
        log.append_bytes(b"no newline");
        log.append_line("next");
        assert_eq!(log.tail(10), vec!["no newline", "next"]);
    }
}
