use std::fs::{self, File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use fs2::FileExt;
use serde::{Deserialize, Serialize};

const LOCK_RETRY_INTERVAL: Duration = Duration::from_millis(100);

/// Exclusive advisory lock held for the lifetime of the value.
pub struct FileLockGuard {
    file: File,
    path: PathBuf,
}

pub enum AcquireState {
    Acquired(FileLockGuard),
    Busy { holder: Option<LockHolder> },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LockHolder {
    pub pid: u32,
    pub acquired_at: i64,
}

impl FileLockGuard {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for FileLockGuard {
    fn drop(&mut self) {
        let _ = self.file.set_len(0);
        let _ = FileExt::unlock(&self.file);
    }
}

pub fn try_acquire(path: &Path) -> Result<AcquireState> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create lock directory {}", parent.display()))?;
    }

    let mut file = open_lock_file(path)?;
    match file.try_lock_exclusive() {
        Ok(()) => {
            write_holder(&mut file)?;
            Ok(AcquireState::Acquired(FileLockGuard {
                file,
                path: path.to_path_buf(),
            }))
        }
        Err(_) => Ok(AcquireState::Busy {
            holder: read_holder(path),
        }),
    }
}

/// Polls for the lock until `timeout` elapses. `Ok(None)` means another
/// process kept it the whole time.
pub fn acquire_with_timeout(path: &Path, timeout: Duration) -> Result<Option<FileLockGuard>> {
    let deadline = Instant::now() + timeout;
    let mut logged_wait = false;
    loop {
        match try_acquire(path)? {
            AcquireState::Acquired(guard) => return Ok(Some(guard)),
            AcquireState::Busy { holder } => {
                if !logged_wait {
                    tracing::debug!(
                        lock = %path.display(),
                        holder_pid = holder.as_ref().map(|h| h.pid),
                        "waiting for lock"
                    );
                    logged_wait = true;
                }
                if Instant::now() >= deadline {
                    return Ok(None);
                }
                thread::sleep(LOCK_RETRY_INTERVAL);
            }
        }
    }
}

fn open_lock_file(path: &Path) -> Result<File> {
    OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .truncate(false)
        .open(path)
        .with_context(|| format!("failed to open lock file {}", path.display()))
}

fn write_holder(file: &mut File) -> Result<()> {
    let holder = LockHolder {
        pid: std::process::id(),
        acquired_at: crate::util::now_millis(),
    };
    file.seek(SeekFrom::Start(0))?;
    file.set_len(0)?;
    file.write_all(serde_json::to_string(&holder)?.as_bytes())?;
    file.flush()?;
    Ok(())
}

fn read_holder(path: &Path) -> Option<LockHolder> {
    let raw = fs::read_to_string(path).ok()?;
    serde_json::from_str(raw.trim()).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn second_acquire_is_busy_until_guard_drops() {
        let tmp = TempDir::new().expect("temp dir");
        let path = tmp.path().join("creds.lock");

        let guard = match try_acquire(&path).expect("acquire") {
            AcquireState::Acquired(guard) => guard,
            AcquireState::Busy { .. } => panic!("expected acquired lock"),
        };
        assert_eq!(guard.path(), path.as_path());

        match try_acquire(&path).expect("second acquire") {
            AcquireState::Busy { holder } => {
                assert_eq!(holder.map(|h| h.pid), Some(std::process::id()));
            }
            AcquireState::Acquired(_) => panic!("expected busy lock"),
        }

        drop(guard);

        assert!(matches!(
            try_acquire(&path).expect("third acquire"),
            AcquireState::Acquired(_)
        ));
    }

    #[test]
    fn acquire_with_timeout_gives_up_while_held() {
        let tmp = TempDir::new().expect("temp dir");
        let path = tmp.path().join("creds.lock");
        let _held = acquire_with_timeout(&path, Duration::from_millis(50))
            .expect("acquire")
            .expect("guard");

        let waited = acquire_with_timeout(&path, Duration::from_millis(250)).expect("wait");
        assert!(waited.is_none());
    }
}
