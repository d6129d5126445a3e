//! Exclusive resource lock
//!
//! A single JSON record at a well-known path marks the shared resource (one
//! GPU) as in use. The record names its holder so that other processes can
//! show *who* holds the resource and *why*, which is the reason this is a
//! file and not a kernel lock.
//!
//! The lock is advisory:
//! - creation is create-if-absent and never overwrites an existing holder
//! - anyone may delete the record, which is the recovery path for a holder
//!   that crashed
//! - there is no expiry or heartbeat

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Local, NaiveDateTime, SecondsFormat, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;

/// Well-known location of the lock record.
pub const DEFAULT_LOCK_PATH: &str = "/tmp/gpu_lock.json";

/// Upper bound on a single sleep inside [`ResourceLock::await_free`], so
/// cancellation is observed promptly even with long poll intervals.
const MAX_SLEEP_SLICE: Duration = Duration::from_millis(250);

/// Lock result type
pub type LockResult<T> = Result<T, LockError>;

/// Errors from lock operations
#[derive(Debug, Error)]
pub enum LockError {
    #[error("I/O error on lock record {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("lock record {path} is not valid JSON: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to encode lock record: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Who is holding the resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HolderKind {
    /// An ad hoc script or shell started by a person
    #[serde(alias = "cli")]
    Interactive,
    /// A job started by the scheduler
    #[serde(alias = "sql")]
    Scheduled,
}

impl std::fmt::Display for HolderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HolderKind::Interactive => write!(f, "interactive"),
            HolderKind::Scheduled => write!(f, "scheduled"),
        }
    }
}

/// The lock record.
///
/// Aliases accept records written by the legacy lock tooling
/// (`user`, `time started`, `script`, ctype `cli`/`sql`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HolderInfo {
    #[serde(alias = "user", deserialize_with = "null_as_unknown")]
    pub holder_user: String,

    /// ISO-8601 timestamp, stored exactly as written by the holder
    #[serde(alias = "time started")]
    pub acquired_at: String,

    #[serde(alias = "script")]
    pub command: String,

    pub pid: u32,

    pub ctype: HolderKind,

    #[serde(default)]
    pub job_id: Option<i64>,
}

fn null_as_unknown<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let value: Option<String> = Option::deserialize(deserializer)?;
    Ok(value.unwrap_or_else(|| "unknown".to_string()))
}

impl HolderInfo {
    /// Build a record stamped with the current time.
    pub fn new(
        holder_user: impl Into<String>,
        command: impl Into<String>,
        pid: u32,
        ctype: HolderKind,
        job_id: Option<i64>,
    ) -> Self {
        Self {
            holder_user: holder_user.into(),
            acquired_at: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
            command: command.into(),
            pid,
            ctype,
            job_id,
        }
    }

    /// Parse `acquired_at`. Naive timestamps (legacy records) are local time.
    pub fn acquired_at(&self) -> Option<DateTime<Utc>> {
        if let Ok(ts) = DateTime::parse_from_rfc3339(&self.acquired_at) {
            return Some(ts.with_timezone(&Utc));
        }
        NaiveDateTime::parse_from_str(&self.acquired_at, "%Y-%m-%dT%H:%M:%S%.f")
            .ok()
            .and_then(|naive| naive.and_local_timezone(Local).single())
            .map(|ts| ts.with_timezone(&Utc))
    }

    /// How long the record has existed, if the timestamp parses.
    pub fn held_for(&self) -> Option<chrono::Duration> {
        self.acquired_at().map(|ts| Utc::now() - ts)
    }
}

/// Result of waiting for the resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AwaitOutcome {
    /// The record disappeared
    Free,
    /// The deadline passed while the record still existed
    TimedOut,
    /// The caller's cancellation check returned true
    Cancelled,
}

/// Handle on the lock record at one path.
#[derive(Debug, Clone)]
pub struct ResourceLock {
    path: PathBuf,
}

impl Default for ResourceLock {
    fn default() -> Self {
        Self::new(DEFAULT_LOCK_PATH)
    }
}

impl ResourceLock {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Path of the lock record.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether the record currently exists.
    pub fn is_held(&self) -> bool {
        self.path.exists()
    }

    /// Create the record if it does not exist.
    ///
    /// Returns `Ok(false)` without touching anything when another holder is
    /// present. The record is written to a temporary file first and then
    /// hard-linked into place, so readers never observe a partial record and
    /// an existing holder can never be overwritten.
    pub fn acquire(&self, holder: &HolderInfo) -> LockResult<bool> {
        if self.is_held() {
            return Ok(false);
        }

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|e| self.io_err(e))?;
            }
        }

        let json = serde_json::to_string_pretty(holder)?;
        let tmp_path = self.temp_path();
        fs::write(&tmp_path, json).map_err(|e| self.io_err(e))?;
        make_group_writable(&tmp_path);

        let linked = fs::hard_link(&tmp_path, &self.path);
        let _ = fs::remove_file(&tmp_path);

        match linked {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(self.io_err(e)),
        }
    }

    /// Acquire and return a guard that releases on drop.
    pub fn try_guard(&self, holder: HolderInfo) -> LockResult<Option<LockGuard>> {
        if self.acquire(&holder)? {
            Ok(Some(LockGuard {
                lock: self.clone(),
                holder,
                released: false,
            }))
        } else {
            Ok(None)
        }
    }

    /// Delete the record. Returns whether anything was removed.
    pub fn release(&self) -> LockResult<bool> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(self.io_err(e)),
        }
    }

    /// Delete the record only if it still names `holder`.
    pub fn release_if_holder(&self, holder: &HolderInfo) -> LockResult<bool> {
        match self.current_holder()? {
            Some(current) if &current == holder => self.release(),
            _ => Ok(false),
        }
    }

    /// Read the record, if any.
    pub fn current_holder(&self) -> LockResult<Option<HolderInfo>> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(self.io_err(e)),
        };

        serde_json::from_str(&content)
            .map(Some)
            .map_err(|source| LockError::Corrupt {
                path: self.path.clone(),
                source,
            })
    }

    /// Block until the record disappears, the deadline passes, or
    /// `cancelled` returns true.
    pub fn await_free(
        &self,
        poll_interval: Duration,
        deadline: Option<Duration>,
        cancelled: &dyn Fn() -> bool,
    ) -> AwaitOutcome {
        let start = Instant::now();
        let mut warned = false;

        loop {
            if !self.is_held() {
                if warned {
                    tracing::info!(
                        waited_secs = start.elapsed().as_secs_f64(),
                        path = %self.path.display(),
                        "resource lock released"
                    );
                }
                return AwaitOutcome::Free;
            }

            if !warned {
                let holder = self.current_holder().ok().flatten();
                tracing::warn!(
                    path = %self.path.display(),
                    holder = holder.as_ref().map(|h| h.holder_user.as_str()).unwrap_or("unknown"),
                    command = holder.as_ref().map(|h| h.command.as_str()).unwrap_or("unknown"),
                    "resource lock held, waiting"
                );
                warned = true;
            }

            let next_check = start.elapsed() + poll_interval;
            loop {
                if cancelled() {
                    return AwaitOutcome::Cancelled;
                }
                let elapsed = start.elapsed();
                if let Some(deadline) = deadline {
                    if elapsed >= deadline {
                        return AwaitOutcome::TimedOut;
                    }
                }
                if elapsed >= next_check {
                    break;
                }
                let mut slice = (next_check - elapsed).min(MAX_SLEEP_SLICE);
                if let Some(deadline) = deadline {
                    slice = slice.min(deadline.saturating_sub(elapsed));
                }
                std::thread::sleep(slice);
            }
        }
    }

    fn temp_path(&self) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        let name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "lock".to_string());
        self.path
            .with_file_name(format!(".{}.{}.{}.tmp", name, std::process::id(), nanos))
    }

    fn io_err(&self, source: io::Error) -> LockError {
        LockError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

/// Held lock. Dropping it removes the record if it still names this holder.
#[derive(Debug)]
pub struct LockGuard {
    lock: ResourceLock,
    holder: HolderInfo,
    released: bool,
}

impl LockGuard {
    pub fn holder(&self) -> &HolderInfo {
        &self.holder
    }

    /// Release now and report whether the record was removed.
    pub fn release(mut self) -> LockResult<bool> {
        self.released = true;
        self.lock.release_if_holder(&self.holder)
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        match self.lock.release_if_holder(&self.holder) {
            Ok(true) => {}
            Ok(false) => tracing::warn!(
                path = %self.lock.path().display(),
                "resource lock was already removed or taken over by another holder"
            ),
            Err(e) => tracing::error!(error = %e, "failed to release resource lock"),
        }
    }
}

/// Whether the process named in the record is still running.
///
/// `None` when liveness cannot be determined on this platform.
pub fn holder_alive(holder: &HolderInfo) -> Option<bool> {
    #[cfg(unix)]
    {
        use nix::errno::Errno;
        use nix::sys::signal::kill;
        use nix::unistd::Pid;

        let pid = i32::try_from(holder.pid).ok()?;
        match kill(Pid::from_raw(pid), None) {
            Ok(()) => Some(true),
            Err(Errno::ESRCH) => Some(false),
            Err(Errno::EPERM) => Some(true),
            Err(_) => None,
        }
    }
    #[cfg(not(unix))]
    {
        let _ = holder;
        None
    }
}

#[cfg(unix)]
fn make_group_writable(path: &Path) {
    use std::os::unix::fs::PermissionsExt;
    let _ = fs::set_permissions(path, fs::Permissions::from_mode(0o664));
}

#[cfg(not(unix))]
fn make_group_writable(_path: &Path) {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use tempfile::TempDir;

    fn lock_in(dir: &TempDir) -> ResourceLock {
        ResourceLock::new(dir.path().join("gpu_lock.json"))
    }

    fn scheduled(job_id: i64) -> HolderInfo {
        HolderInfo::new("alice", "/opt/train.py", 4242, HolderKind::Scheduled, Some(job_id))
    }

    #[test]
    fn test_acquire_creates_record() {
        let dir = TempDir::new().unwrap();
        let lock = lock_in(&dir);

        assert!(!lock.is_held());
        assert!(lock.acquire(&scheduled(1)).unwrap());
        assert!(lock.is_held());

        let holder = lock.current_holder().unwrap().unwrap();
        assert_eq!(holder, scheduled_with_ts(&holder, 1));
    }

    fn scheduled_with_ts(read: &HolderInfo, job_id: i64) -> HolderInfo {
        HolderInfo {
            acquired_at: read.acquired_at.clone(),
            ..scheduled(job_id)
        }
    }

    #[test]
    fn test_second_acquire_leaves_first_holder_untouched() {
        let dir = TempDir::new().unwrap();
        let lock = lock_in(&dir);

        assert!(lock.acquire(&scheduled(1)).unwrap());
        let before = fs::read(lock.path()).unwrap();

        let other = HolderInfo::new("bob", "python notebook.py", 99, HolderKind::Interactive, None);
        assert!(!lock.acquire(&other).unwrap(), "second acquire must fail");

        let after = fs::read(lock.path()).unwrap();
        assert_eq!(before, after, "first holder record must be byte-identical");
    }

    #[test]
    fn test_release_without_acquire_is_noop() {
        let dir = TempDir::new().unwrap();
        let lock = lock_in(&dir);

        assert!(!lock.release().unwrap());
        assert!(!lock.release().unwrap());
    }

    #[test]
    fn test_release_after_acquire() {
        let dir = TempDir::new().unwrap();
        let lock = lock_in(&dir);

        lock.acquire(&scheduled(7)).unwrap();
        assert!(lock.release().unwrap());
        assert!(!lock.is_held());
        assert!(lock.current_holder().unwrap().is_none());
    }

    #[test]
    fn test_no_temp_files_left_behind() {
        let dir = TempDir::new().unwrap();
        let lock = lock_in(&dir);

        lock.acquire(&scheduled(1)).unwrap();
        lock.acquire(&scheduled(2)).unwrap();

        let entries: Vec<_> = fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(entries.len(), 1, "only the lock record should remain");
    }

    #[test]
    fn test_reads_legacy_record() {
        let dir = TempDir::new().unwrap();
        let lock = lock_in(&dir);
        fs::write(
            lock.path(),
            r#"{
  "user": null,
  "time started": "2025-03-01T10:15:30.123456",
  "script": "/home/lab/analysis.py",
  "pid": 1234,
  "ctype": "sql",
  "job_id": 17
}"#,
        )
        .unwrap();

        let holder = lock.current_holder().unwrap().unwrap();
        assert_eq!(holder.holder_user, "unknown");
        assert_eq!(holder.command, "/home/lab/analysis.py");
        assert_eq!(holder.ctype, HolderKind::Scheduled);
        assert_eq!(holder.job_id, Some(17));
        assert!(holder.acquired_at().is_some());
    }

    #[test]
    fn test_corrupt_record_is_reported() {
        let dir = TempDir::new().unwrap();
        let lock = lock_in(&dir);
        fs::write(lock.path(), "not json").unwrap();

        assert!(lock.is_held());
        assert!(matches!(
            lock.current_holder(),
            Err(LockError::Corrupt { .. })
        ));
    }

    #[test]
    fn test_guard_releases_on_drop() {
        let dir = TempDir::new().unwrap();
        let lock = lock_in(&dir);

        {
            let guard = lock.try_guard(scheduled(3)).unwrap();
            assert!(guard.is_some());
            assert!(lock.is_held());
        }
        assert!(!lock.is_held());
    }

    #[test]
    fn test_guard_does_not_remove_foreign_record() {
        let dir = TempDir::new().unwrap();
        let lock = lock_in(&dir);

        let guard = lock.try_guard(scheduled(3)).unwrap().unwrap();
        // Operator force-releases, then someone else takes the resource.
        lock.release().unwrap();
        let other = HolderInfo::new("bob", "adhoc.py", 77, HolderKind::Interactive, None);
        assert!(lock.acquire(&other).unwrap());

        drop(guard);
        assert_eq!(lock.current_holder().unwrap().unwrap().holder_user, "bob");
    }

    #[test]
    fn test_await_free_returns_immediately_when_free() {
        let dir = TempDir::new().unwrap();
        let lock = lock_in(&dir);

        let outcome = lock.await_free(Duration::from_secs(60), None, &|| false);
        assert_eq!(outcome, AwaitOutcome::Free);
    }

    #[test]
    fn test_await_free_times_out() {
        let dir = TempDir::new().unwrap();
        let lock = lock_in(&dir);
        lock.acquire(&scheduled(1)).unwrap();

        let start = Instant::now();
        let outcome = lock.await_free(
            Duration::from_millis(20),
            Some(Duration::from_millis(100)),
            &|| false,
        );
        assert_eq!(outcome, AwaitOutcome::TimedOut);
        assert!(start.elapsed() >= Duration::from_millis(100));
    }

    #[test]
    fn test_await_free_is_cancellable() {
        let dir = TempDir::new().unwrap();
        let lock = lock_in(&dir);
        lock.acquire(&scheduled(1)).unwrap();

        let cancel = Arc::new(AtomicBool::new(false));
        let cancel_clone = Arc::clone(&cancel);
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            cancel_clone.store(true, Ordering::SeqCst);
        });

        let outcome = lock.await_free(Duration::from_secs(600), None, &|| {
            cancel.load(Ordering::SeqCst)
        });
        handle.join().unwrap();
        assert_eq!(outcome, AwaitOutcome::Cancelled);
    }

    #[test]
    fn test_await_free_sees_release_from_other_thread() {
        let dir = TempDir::new().unwrap();
        let lock = lock_in(&dir);
        lock.acquire(&scheduled(1)).unwrap();

        let other = lock.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(60));
            other.release().unwrap();
        });

        let outcome = lock.await_free(
            Duration::from_millis(10),
            Some(Duration::from_secs(5)),
            &|| false,
        );
        handle.join().unwrap();
        assert_eq!(outcome, AwaitOutcome::Free);
    }

    #[test]
    #[cfg(unix)]
    fn test_holder_alive_for_current_process() {
        let holder = HolderInfo::new("me", "test", std::process::id(), HolderKind::Interactive, None);
        assert_eq!(holder_alive(&holder), Some(true));
    }
}
