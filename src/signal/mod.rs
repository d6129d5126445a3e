//! Pause and shutdown control
//!
//! The scheduler consults a [`ControlState`] at the top of every iteration.
//! Requests reach it three ways:
//!
//! - in-process, by calling [`ControlState::toggle_pause`] or
//!   [`ControlState::request_shutdown`]
//! - from other processes through a [`ControlChannel`] directory:
//!   `<state_dir>/control/paused` exists while paused, and
//!   `<state_dir>/control/shutdown` is a one-shot request the scheduler
//!   consumes
//! - from SIGINT/SIGTERM, via [`SignalHandler::install`]
//!
//! Neither pause nor shutdown ever interrupts a job that is already running.
//!
//! [`ChildRelay`] is the foreground counterpart used by `gpuq lock run`: it
//! keeps the parent alive through a termination signal and passes the
//! signal on to the child, so the lock is always released afterwards.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::ExitStatus;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

const PAUSED_FILE: &str = "paused";
const SHUTDOWN_FILE: &str = "shutdown";

/// File-based control requests shared between processes
#[derive(Debug, Clone)]
pub struct ControlChannel {
    dir: PathBuf,
}

impl ControlChannel {
    /// Channel rooted at `<state_dir>/control`
    pub fn new(state_dir: &Path) -> Self {
        Self {
            dir: state_dir.join("control"),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn paused_path(&self) -> PathBuf {
        self.dir.join(PAUSED_FILE)
    }

    fn shutdown_path(&self) -> PathBuf {
        self.dir.join(SHUTDOWN_FILE)
    }

    pub fn is_paused(&self) -> bool {
        self.paused_path().exists()
    }

    pub fn set_paused(&self, paused: bool) -> io::Result<()> {
        let path = self.paused_path();
        if paused {
            fs::create_dir_all(&self.dir)?;
            fs::write(&path, format!("{}\n", chrono::Local::now().to_rfc3339()))
        } else {
            match fs::remove_file(&path) {
                Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
                _ => Ok(()),
            }
        }
    }

    /// Flip the pause flag; returns the new value.
    pub fn toggle_pause(&self) -> io::Result<bool> {
        let paused = !self.is_paused();
        self.set_paused(paused)?;
        Ok(paused)
    }

    pub fn request_shutdown(&self) -> io::Result<()> {
        fs::create_dir_all(&self.dir)?;
        fs::write(self.shutdown_path(), format!("{}\n", chrono::Local::now().to_rfc3339()))
    }

    pub fn shutdown_requested(&self) -> bool {
        self.shutdown_path().exists()
    }

    /// Consume a pending shutdown request. True if there was one.
    pub fn take_shutdown_request(&self) -> io::Result<bool> {
        match fs::remove_file(self.shutdown_path()) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e),
        }
    }
}

/// Outcome of a received signal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalAction {
    /// First signal: finish the current job, then stop
    RequestShutdown,
    /// Shutdown was already underway
    AlreadyRequested,
}

/// Pause/shutdown flags polled by the scheduler
#[derive(Debug, Default)]
pub struct ControlState {
    paused: AtomicBool,
    shutdown: AtomicBool,
    signal_count: AtomicU8,
    channel: Option<ControlChannel>,
}

impl ControlState {
    /// Flags held in memory only
    pub fn new() -> Self {
        Self::default()
    }

    /// Flags mirrored from a control directory. Picks up the persisted
    /// pause state immediately.
    pub fn with_channel(channel: ControlChannel) -> Self {
        Self {
            paused: AtomicBool::new(channel.is_paused()),
            channel: Some(channel),
            ..Self::default()
        }
    }

    pub fn channel(&self) -> Option<&ControlChannel> {
        self.channel.as_ref()
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub fn is_shutdown_requested(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    pub fn set_paused(&self, paused: bool) -> io::Result<()> {
        if let Some(channel) = &self.channel {
            channel.set_paused(paused)?;
        }
        self.paused.store(paused, Ordering::SeqCst);
        Ok(())
    }

    /// Flip the pause flag; returns the new value.
    pub fn toggle_pause(&self) -> io::Result<bool> {
        let paused = !self.is_paused();
        self.set_paused(paused)?;
        Ok(paused)
    }

    /// One-way: once requested, shutdown cannot be withdrawn.
    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    /// Pull requests made by other processes through the control directory.
    pub fn refresh(&self) -> io::Result<()> {
        let Some(channel) = &self.channel else {
            return Ok(());
        };

        let paused = channel.is_paused();
        if self.paused.swap(paused, Ordering::SeqCst) != paused {
            tracing::info!(paused, "pause state changed");
        }
        if channel.take_shutdown_request()? {
            tracing::info!("shutdown requested through control directory");
            self.request_shutdown();
        }
        Ok(())
    }

    pub fn handle_signal(&self) -> SignalAction {
        let count = self.signal_count.fetch_add(1, Ordering::SeqCst);
        self.request_shutdown();
        if count == 0 {
            SignalAction::RequestShutdown
        } else {
            SignalAction::AlreadyRequested
        }
    }

    pub fn signal_count(&self) -> u8 {
        self.signal_count.load(Ordering::SeqCst)
    }

    /// Sleep for up to `duration`, returning early once shutdown is
    /// requested. Returns true if the full duration elapsed.
    pub fn sleep(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        let slice = Duration::from_millis(250);
        loop {
            if let Err(e) = self.refresh() {
                tracing::warn!(error = %e, "failed to read control directory");
            }
            if self.is_shutdown_requested() {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            std::thread::sleep(slice.min(deadline - now));
        }
    }
}

/// Routes SIGINT/SIGTERM into a [`ControlState`]
pub struct SignalHandler {
    state: Arc<ControlState>,
}

impl SignalHandler {
    pub fn new(state: Arc<ControlState>) -> Self {
        Self { state }
    }

    pub fn state(&self) -> Arc<ControlState> {
        Arc::clone(&self.state)
    }

    /// Install the process-wide handler. Call once at startup.
    pub fn install(&self) -> Result<(), ctrlc::Error> {
        let state = Arc::clone(&self.state);
        ctrlc::set_handler(move || match state.handle_signal() {
            SignalAction::RequestShutdown => {
                tracing::warn!("received termination signal; stopping after the current job");
            }
            SignalAction::AlreadyRequested => {
                tracing::warn!("shutdown already requested; waiting for the current job to finish");
            }
        })
    }
}

/// Records the scheduler's pid so `gpuq shutdown --signal` can find it.
#[derive(Debug)]
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    pub fn create(path: &Path) -> io::Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, format!("{}\n", std::process::id()))?;
        Ok(Self {
            path: path.to_path_buf(),
        })
    }

    pub fn read(path: &Path) -> io::Result<Option<u32>> {
        match fs::read_to_string(path) {
            Ok(content) => Ok(content.trim().parse().ok()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        if PidFile::read(&self.path).ok().flatten() == Some(std::process::id()) {
            let _ = fs::remove_file(&self.path);
        }
    }
}

/// Forwards termination signals to a foreground child.
#[derive(Debug, Default)]
pub struct ChildRelay {
    interrupted: AtomicBool,
    child_pid: AtomicU32,
}

impl ChildRelay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install as the process-wide SIGINT/SIGTERM/SIGHUP handler.
    pub fn install() -> Result<Arc<Self>, ctrlc::Error> {
        let relay = Arc::new(Self::new());
        let handler = Arc::clone(&relay);
        ctrlc::set_handler(move || handler.handle_signal())?;
        Ok(relay)
    }

    pub fn interrupted(&self) -> bool {
        self.interrupted.load(Ordering::SeqCst)
    }

    pub fn set_child(&self, pid: u32) {
        self.child_pid.store(pid, Ordering::SeqCst);
    }

    pub fn clear_child(&self) {
        self.child_pid.store(0, Ordering::SeqCst);
    }

    /// Record the signal and pass SIGTERM on to the child, if one runs.
    pub fn handle_signal(&self) {
        self.interrupted.store(true, Ordering::SeqCst);
        let pid = self.child_pid.load(Ordering::SeqCst);
        if pid != 0 {
            // The child may already have exited; nothing left to stop then.
            let _ = send_terminate(pid);
        }
    }
}

/// Exit code for a finished process; death by signal maps to 128 + signal.
pub fn exit_code(status: &ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    -1
}

/// Send SIGTERM to a process (the scheduler, or a relayed child).
#[cfg(unix)]
pub fn send_terminate(pid: u32) -> io::Result<()> {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let pid = i32::try_from(pid).map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "pid out of range"))?;
    kill(Pid::from_raw(pid), Signal::SIGTERM).map_err(io::Error::from)
}

#[cfg(not(unix))]
pub fn send_terminate(_pid: u32) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "signals are only supported on unix",
    ))
}
