use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, warn};

/// Shared between a process unit and its deadline: `true` while the child
/// is still unreaped. Reaping and signalling both happen under this lock,
/// so the deadline never signals a recycled pid.
#[derive(Debug, Clone)]
pub(crate) struct ReapGuard(Arc<Mutex<bool>>);

impl ReapGuard {
    pub(crate) fn new() -> Self {
        Self(Arc::new(Mutex::new(true)))
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, bool> {
        // A poisoned flag is still a valid flag.
        self.0.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Timer that sends `SIGXCPU` to a child once the timeout elapses.
pub(crate) struct Deadline {
    cancel: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl Deadline {
    pub(crate) fn arm(pid: u32, timeout: Duration, guard: ReapGuard) -> std::io::Result<Self> {
        let (tx, rx) = mpsc::channel::<()>();
        let handle = thread::Builder::new()
            .name(format!("deadline-{pid}"))
            .spawn(move || {
                if let Err(RecvTimeoutError::Timeout) = rx.recv_timeout(timeout) {
                    let alive = guard.lock();
                    if *alive {
                        debug!(pid, ?timeout, "deadline reached, sending SIGXCPU");
                        // SAFETY: the child is unreaped while `alive` holds,
                        // so `pid` still names it.
                        let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGXCPU) };
                        if rc != 0 {
                            warn!(pid, error = %std::io::Error::last_os_error(), "failed to signal timed out process");
                        }
                    }
                }
            })?;
        Ok(Self {
            cancel: Some(tx),
            handle: Some(handle),
        })
    }

    /// Stop the timer; a no-op if it already fired.
    pub(crate) fn cancel(&mut self) {
        // Dropping the sender wakes the timer thread with `Disconnected`.
        self.cancel.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Deadline {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use std::process::Command;
    use std::time::Instant;

    use super::*;

    #[test]
    fn cancel_returns_promptly() {
        let guard = ReapGuard::new();
        *guard.lock() = false;
        let mut deadline =
            Deadline::arm(std::process::id(), Duration::from_secs(60), guard).unwrap();
        let start = Instant::now();
        deadline.cancel();
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn fires_sigxcpu_at_deadline() {
        use std::os::unix::process::ExitStatusExt;

        let mut child = Command::new("sleep").arg("5").spawn().unwrap();
        let guard = ReapGuard::new();
        let mut deadline =
            Deadline::arm(child.id(), Duration::from_millis(100), guard.clone()).unwrap();
        let status = child.wait().unwrap();
        *guard.lock() = false;
        deadline.cancel();
        assert_eq!(status.signal(), Some(libc::SIGXCPU));
    }

    #[test]
    fn disarmed_guard_suppresses_signal() {
        let mut child = Command::new("sleep").arg("1").spawn().unwrap();
        let guard = ReapGuard::new();
        *guard.lock() = false;
        let mut deadline =
            Deadline::arm(child.id(), Duration::from_millis(50), guard.clone()).unwrap();
        let status = child.wait().unwrap();
        deadline.cancel();
        assert!(status.success());
    }
}
