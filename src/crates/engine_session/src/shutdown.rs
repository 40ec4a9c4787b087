use std::io;
use std::process::{Child, ExitStatus};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

const EXIT_POLL: Duration = Duration::from_millis(10);
const JOIN_POLL: Duration = Duration::from_millis(5);

/// Lock a mutex, recovering the data if another thread panicked while holding it.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Shared cancellation flag that can also wake timed waits immediately.
#[derive(Debug, Default)]
pub(crate) struct StopSignal {
    raised: Mutex<bool>,
    wake: Condvar,
}

impl StopSignal {
    pub(crate) fn raise(&self) {
        *lock(&self.raised) = true;
        self.wake.notify_all();
    }

    pub(crate) fn clear(&self) {
        *lock(&self.raised) = false;
    }

    pub(crate) fn is_raised(&self) -> bool {
        *lock(&self.raised)
    }

    /// Wait up to `timeout`; returns true if the signal was raised.
    pub(crate) fn wait_timeout(&self, timeout: Duration) -> bool {
        let guard = lock(&self.raised);
        let (guard, _) = self
            .wake
            .wait_timeout_while(guard, timeout, |raised| !*raised)
            .unwrap_or_else(PoisonError::into_inner);
        *guard
    }
}

/// Ask the child to exit. SIGTERM on unix, a hard kill elsewhere.
#[cfg(unix)]
pub(crate) fn request_terminate(child: &mut Child) -> io::Result<()> {
    use nix::errno::Errno;
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let pid = i32::try_from(child.id())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "pid out of range"))?;
    match kill(Pid::from_raw(pid), Signal::SIGTERM) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(errno) => Err(io::Error::from(errno)),
    }
}

#[cfg(not(unix))]
pub(crate) fn request_terminate(child: &mut Child) -> io::Result<()> {
    child.kill()
}

/// Poll the child until it exits or `timeout` passes (forever when `None`).
///
/// The lock is only held for each individual poll so liveness checks on
/// other threads are not starved while we wait.
pub(crate) fn wait_for_exit(
    child: &Mutex<Option<Child>>,
    timeout: Option<Duration>,
) -> io::Result<Option<ExitStatus>> {
    let deadline = timeout.map(|timeout| Instant::now() + timeout);
    loop {
        {
            let mut guard = lock(child);
            match guard.as_mut() {
                Some(child) => {
                    if let Some(status) = child.try_wait()? {
                        return Ok(Some(status));
                    }
                }
                None => return Ok(None),
            }
        }
        if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
            return Ok(None);
        }
        thread::sleep(EXIT_POLL);
    }
}

/// Join a worker thread, giving up after `timeout`.
///
/// Returns false when the thread was still running and has been detached.
pub(crate) fn join_bounded(handle: JoinHandle<()>, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while !handle.is_finished() {
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(JOIN_POLL);
    }
    let _ = handle.join();
    true
}
