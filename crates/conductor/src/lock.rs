//! Run lock to prevent two supervisors from driving the same run root.
//!
//! The lock file lives at `<run_root>/lock` and holds JSON metadata about
//! the holder (PID, hostname, timestamp, run_id). A lock older than the
//! stale timeout can be taken over.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const LOCK_FILE: &str = "lock";

/// Information stored in the lock file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockInfo {
    /// Process ID of the lock holder
    pub pid: u32,
    /// Hostname where the lock was acquired
    pub hostname: String,
    /// When the lock was acquired
    pub acquired_at: DateTime<Utc>,
    /// Run being driven
    pub run_id: String,
}

/// Lock file handle that releases on Drop.
#[derive(Debug)]
pub struct RunLock {
    path: PathBuf,
}

impl RunLock {
    /// Acquire the lock for `run_id` under `run_root`, taking over a stale
    /// lock older than `stale_after`.
    pub fn acquire(run_root: &Path, run_id: &str, stale_after: Duration) -> Result<Self> {
        let lock_path = run_root.join(LOCK_FILE);

        fs::create_dir_all(run_root)
            .with_context(|| format!("failed to create run root {}", run_root.display()))?;

        if lock_path.exists() {
            let existing = Self::read_info(&lock_path)?;
            let age = Utc::now().signed_duration_since(existing.acquired_at);
            let stale = age.num_milliseconds() >= stale_after.as_millis() as i64;
            if !stale {
                let held_for = Duration::from_secs(age.num_seconds().max(0) as u64);
                bail!(
                    "run lock already held by pid {} on {} for {} (run_id: {})",
                    existing.pid,
                    existing.hostname,
                    humantime::format_duration(held_for),
                    existing.run_id
                );
            }
            fs::remove_file(&lock_path)
                .with_context(|| format!("failed to remove stale lock {}", lock_path.display()))?;
        }

        let info = LockInfo {
            pid: std::process::id(),
            hostname: gethostname::gethostname().to_string_lossy().to_string(),
            acquired_at: Utc::now(),
            run_id: run_id.to_string(),
        };

        let tmp_path = lock_path.with_extension("tmp");
        let json = serde_json::to_string_pretty(&info).context("failed to serialize lock info")?;
        {
            let mut file = File::create(&tmp_path)
                .with_context(|| format!("failed to create lock tmp {}", tmp_path.display()))?;
            file.write_all(json.as_bytes())
                .with_context(|| format!("failed to write lock tmp {}", tmp_path.display()))?;
            file.sync_all().context("failed to sync lock file")?;
        }
        fs::rename(&tmp_path, &lock_path)
            .with_context(|| format!("failed to rename lock into {}", lock_path.display()))?;

        Ok(Self { path: lock_path })
    }

    pub fn read_info(path: &Path) -> Result<LockInfo> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read lock {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("failed to parse lock {}", path.display()))
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    #[test]
    fn acquire_writes_holder_info_and_releases_on_drop() {
        let td = tempdir().expect("tempdir");
        let lock_path = td.path().join(LOCK_FILE);

        {
            let _lock =
                RunLock::acquire(td.path(), "run-1", Duration::from_secs(3600)).expect("acquire");
            let info = RunLock::read_info(&lock_path).expect("read");
            assert_eq!(info.run_id, "run-1");
            assert_eq!(info.pid, std::process::id());
        }

        assert!(!lock_path.exists());
    }

    #[test]
    fn second_acquire_fails_while_held() {
        let td = tempdir().expect("tempdir");
        let _lock =
            RunLock::acquire(td.path(), "run-1", Duration::from_secs(3600)).expect("acquire");
        let err = RunLock::acquire(td.path(), "run-1", Duration::from_secs(3600)).unwrap_err();
        assert!(format!("{err:#}").contains("already held"));
    }

    #[test]
    fn stale_lock_is_taken_over() {
        let td = tempdir().expect("tempdir");
        {
            let _lock =
                RunLock::acquire(td.path(), "run-old", Duration::from_secs(3600)).expect("acquire");
            // Keep the file: simulate a crashed holder by forgetting the guard.
            std::mem::forget(_lock);
        }
        std::thread::sleep(Duration::from_millis(30));
        let lock = RunLock::acquire(td.path(), "run-new", Duration::from_millis(10))
            .expect("takeover of stale lock");
        let info = RunLock::read_info(&td.path().join(LOCK_FILE)).expect("read");
        assert_eq!(info.run_id, "run-new");
        drop(lock);
    }
}
