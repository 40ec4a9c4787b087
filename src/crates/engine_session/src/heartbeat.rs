use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crate::diagnostics::{publish, Diagnostic, DiagnosticLevel, DiagnosticSender, DiagnosticStream};
use crate::protocol::HANDSHAKE_METHOD;
use crate::session::Shared;
use crate::shutdown::lock;

/// Monotonic "last stdout activity" timestamp shared by the iterator and the monitor.
#[derive(Debug)]
pub(crate) struct ActivityClock {
    epoch: Instant,
    last: AtomicU64,
}

impl ActivityClock {
    pub(crate) fn new() -> Self {
        Self {
            epoch: Instant::now(),
            last: AtomicU64::new(0),
        }
    }

    fn now_nanos(&self) -> u64 {
        u64::try_from(self.epoch.elapsed().as_nanos()).unwrap_or(u64::MAX)
    }

    /// Move the timestamp forward to now; never moves it backwards.
    pub(crate) fn touch(&self) {
        self.last.fetch_max(self.now_nanos(), Ordering::SeqCst);
    }

    pub(crate) fn reset(&self) {
        self.last.store(self.now_nanos(), Ordering::SeqCst);
    }

    /// If at least `timeout` passed since the last activity, restart the
    /// window at now and return the silence observed. Concurrent callers
    /// race on the swap so a window is claimed at most once.
    fn claim_stall(&self, timeout: Duration) -> Option<Duration> {
        let last = self.last.load(Ordering::SeqCst);
        let now = self.now_nanos();
        let elapsed = Duration::from_nanos(now.saturating_sub(last));
        if elapsed < timeout {
            return None;
        }
        self.last
            .compare_exchange(last, now, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| elapsed)
    }
}

/// Silence detection rules for stdout.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct HeartbeatPolicy {
    pub(crate) timeout: Option<Duration>,
}

impl HeartbeatPolicy {
    pub(crate) fn check(&self, clock: &ActivityClock, session_id: &str) -> Option<Diagnostic> {
        let timeout = self.timeout.filter(|timeout| !timeout.is_zero())?;
        let elapsed = clock.claim_stall(timeout)?;
        Some(
            Diagnostic::new(
                DiagnosticStream::Heartbeat,
                DiagnosticLevel::Warning,
                format!("No stdout messages for {:.2}s", elapsed.as_secs_f64()),
            )
            .with_session(session_id)
            .with_elapsed(elapsed),
        )
    }
}

/// Publish heartbeat and handshake-deadline diagnostics that are due.
pub(crate) fn check_liveness(shared: &Shared, tx: &DiagnosticSender) {
    if let Some(diagnostic) = shared.heartbeat.check(&shared.activity, &shared.session_id) {
        publish(tx, diagnostic);
    }

    let overdue = lock(&shared.handshake).overdue(shared.handshake_timeout);
    if let Some(waited) = overdue {
        publish(
            tx,
            Diagnostic::new(
                DiagnosticStream::Heartbeat,
                DiagnosticLevel::Warning,
                format!(
                    "{HANDSHAKE_METHOD} handshake unanswered after {:.2}s",
                    waited.as_secs_f64()
                ),
            )
            .with_session(shared.session_id.clone())
            .with_elapsed(waited),
        );
    }
}

pub(crate) fn spawn_monitor(
    shared: Arc<Shared>,
    interval: Duration,
    tx: DiagnosticSender,
) -> io::Result<thread::JoinHandle<()>> {
    thread::Builder::new()
        .name("engine-session-heartbeat".to_string())
        .spawn(move || {
            while !shared.stop.wait_timeout(interval) {
                if !shared.is_running() {
                    break;
                }
                check_liveness(&shared, &tx);
            }
        })
}
