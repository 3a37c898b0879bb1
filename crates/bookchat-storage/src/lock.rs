//! Cross-process advisory lock on the shared working tree, plus stale-lock
//! healing for lock files left behind by dead processes.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::error::{RepositoryError, Result};

/// Owner metadata stored alongside the lock file.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct LockOwnerMeta {
    pid: u32,
    created_ts: f64,
}

/// Advisory `flock` on a file, with owner metadata in `<name>.owner.json`.
///
/// The lock file itself is never unlinked on release; only the metadata is.
/// The OS drops the `flock` when the owning process dies, so a crashed holder
/// never blocks the next acquirer.
pub struct FileLock {
    path: PathBuf,
    metadata_path: PathBuf,
    timeout: Duration,
    file: Option<fs::File>,
}

impl FileLock {
    #[must_use]
    pub fn new(path: PathBuf) -> Self {
        let metadata_path = {
            let name = path.file_name().unwrap_or_default().to_string_lossy();
            path.with_file_name(format!("{name}.owner.json"))
        };
        Self {
            path,
            metadata_path,
            timeout: Duration::from_secs(60),
            file: None,
        }
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub const fn is_held(&self) -> bool {
        self.file.is_some()
    }

    /// Blocks (polling with backoff) until the lock is held or the timeout
    /// elapses.
    ///
    /// # Errors
    /// [`RepositoryError::LockTimeout`] after `timeout`; I/O errors opening the file.
    pub fn acquire(&mut self) -> Result<()> {
        use fs2::FileExt;

        if self.file.is_some() {
            return Ok(());
        }
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        let start = Instant::now();
        let mut attempt: u32 = 0;
        loop {
            let file = fs::OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(false)
                .open(&self.path)?;

            if file.try_lock_exclusive().is_ok() {
                self.file = Some(file);
                self.write_metadata()?;
                return Ok(());
            }

            let elapsed = start.elapsed();
            if elapsed >= self.timeout {
                return Err(RepositoryError::LockTimeout(format!(
                    "{} still held after {:.2}s ({} attempts){}",
                    self.path.display(),
                    elapsed.as_secs_f64(),
                    attempt + 1,
                    self.owner_hint()
                )));
            }

            // Exponential backoff with jitter: 25ms, 50ms, ... capped at 500ms.
            let base_ms = (25u64 << attempt.min(5)).min(500);
            let jitter = base_ms / 4;
            let spread = u64::from(std::process::id()).wrapping_add(u64::from(attempt)) % (2 * jitter + 1);
            let sleep = Duration::from_millis((base_ms + spread).saturating_sub(jitter).max(5));
            std::thread::sleep(sleep.min(self.timeout.saturating_sub(elapsed)).max(Duration::from_millis(1)));
            attempt = attempt.saturating_add(1);
        }
    }

    pub fn release(&mut self) {
        use fs2::FileExt;

        if let Some(file) = self.file.take() {
            let _ = fs::remove_file(&self.metadata_path);
            let _ = FileExt::unlock(&file);
        }
    }

    fn write_metadata(&self) -> Result<()> {
        let meta = LockOwnerMeta {
            pid: std::process::id(),
            created_ts: unix_now(),
        };
        let content = serde_json::to_string(&meta)
            .map_err(|e| RepositoryError::Io(std::io::Error::other(e)))?;
        fs::write(&self.metadata_path, content)?;
        Ok(())
    }

    fn owner_hint(&self) -> String {
        read_owner(&self.metadata_path)
            .map(|m| format!("; held by pid {}", m.pid))
            .unwrap_or_default()
    }

    /// Removes the lock artifacts if nobody holds the lock and the recorded
    /// owner is gone. Returns `true` when something was removed.
    fn cleanup_if_stale(&self) -> bool {
        use fs2::FileExt;

        let owner = read_owner(&self.metadata_path);
        if owner.as_ref().is_some_and(|m| pid_alive(m.pid)) {
            return false;
        }
        let Ok(file) = fs::OpenOptions::new().write(true).open(&self.path) else {
            // Lock file gone; only orphaned metadata may remain.
            return fs::remove_file(&self.metadata_path).is_ok();
        };
        if file.try_lock_exclusive().is_err() {
            return false;
        }
        let removed_meta = fs::remove_file(&self.metadata_path).is_ok();
        let removed_lock = fs::remove_file(&self.path).is_ok();
        let _ = FileExt::unlock(&file);
        removed_meta || removed_lock
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        self.release();
    }
}

fn read_owner(path: &Path) -> Option<LockOwnerMeta> {
    fs::read_to_string(path)
        .ok()
        .and_then(|s| serde_json::from_str::<LockOwnerMeta>(&s).ok())
}

fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

/// Check if a process with the given PID is alive (Unix only).
fn pid_alive(pid: u32) -> bool {
    if pid == 0 {
        return false;
    }
    if pid == std::process::id() {
        return true;
    }
    #[cfg(unix)]
    {
        let result = std::process::Command::new("kill")
            .args(["-0", &pid.to_string()])
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .status();
        matches!(result, Ok(s) if s.success())
    }
    #[cfg(not(unix))]
    {
        true
    }
}

// ---------------------------------------------------------------------------
// Stale lock healing (startup cleanup)
// ---------------------------------------------------------------------------

/// Result of a lock healing scan.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HealResult {
    pub locks_scanned: usize,
    pub locks_removed: Vec<String>,
    pub metadata_removed: Vec<String>,
    pub index_lock_removed: bool,
}

/// Removes stale index.lock older than this during healing.
const STALE_INDEX_LOCK_SECS: f64 = 300.0;

/// Scans `git_dir` for abandoned advisory locks and a stale `index.lock`.
///
/// # Errors
/// I/O errors listing the directory.
pub fn heal_locks_in(git_dir: &Path) -> Result<HealResult> {
    let mut result = HealResult::default();
    if !git_dir.is_dir() {
        return Ok(result);
    }

    for entry in fs::read_dir(git_dir)? {
        let path = entry?.path();
        let Some(name) = path.file_name().map(|n| n.to_string_lossy().into_owned()) else {
            continue;
        };
        if name.starts_with("bookchat-") && name.ends_with(".lock") {
            result.locks_scanned += 1;
            if FileLock::new(path.clone()).cleanup_if_stale() {
                result.locks_removed.push(path.display().to_string());
            }
        } else if let Some(lock_name) = name.strip_suffix(".owner.json")
            && !git_dir.join(lock_name).exists()
            && fs::remove_file(&path).is_ok()
        {
            result.metadata_removed.push(path.display().to_string());
        }
    }

    result.index_lock_removed = clean_stale_index_lock(git_dir, STALE_INDEX_LOCK_SECS);
    Ok(result)
}

/// Removes `index.lock` if it is older than `max_age_seconds`.
pub(crate) fn clean_stale_index_lock(git_dir: &Path, max_age_seconds: f64) -> bool {
    let lock_path = git_dir.join("index.lock");
    let age = fs::metadata(&lock_path)
        .ok()
        .and_then(|m| m.modified().ok())
        .and_then(|t| SystemTime::now().duration_since(t).ok())
        .map(|d| d.as_secs_f64());
    match age {
        Some(age) if age > max_age_seconds => {
            tracing::warn!(path = %lock_path.display(), age, "removing stale git index.lock");
            fs::remove_file(&lock_path).is_ok()
        }
        _ => false,
    }
}
