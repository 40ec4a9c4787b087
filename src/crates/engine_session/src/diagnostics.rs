use std::fmt;
use std::sync::mpsc;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::Serialize;

use crate::session::Shared;

const DRAIN_POLL: Duration = Duration::from_millis(100);
const MAX_IDLE_POLLS_AFTER_EXIT: u32 = 10;

/// Origin of a diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DiagnosticStream {
    Stdout,
    Stderr,
    Heartbeat,
}

/// Severity of a diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DiagnosticLevel {
    Error,
    Warning,
    Protocol,
}

impl fmt::Display for DiagnosticStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DiagnosticStream::Stdout => "stdout",
            DiagnosticStream::Stderr => "stderr",
            DiagnosticStream::Heartbeat => "heartbeat",
        })
    }
}

impl fmt::Display for DiagnosticLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DiagnosticLevel::Error => "error",
            DiagnosticLevel::Warning => "warning",
            DiagnosticLevel::Protocol => "protocol",
        })
    }
}

/// Non-fatal observation about stream content or engine liveness.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Diagnostic {
    /// Wall-clock seconds since the Unix epoch.
    pub timestamp: f64,
    pub stream: DiagnosticStream,
    pub text: String,
    pub level: DiagnosticLevel,
    /// Session that produced the diagnostic, for heartbeat reports.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session: Option<String>,
    /// Silence measured by a heartbeat check.
    #[serde(
        rename = "elapsed_secs",
        serialize_with = "serialize_elapsed",
        skip_serializing_if = "Option::is_none"
    )]
    pub elapsed: Option<Duration>,
}

impl Diagnostic {
    pub fn new(stream: DiagnosticStream, level: DiagnosticLevel, text: impl Into<String>) -> Self {
        Self {
            timestamp: wall_clock_secs(),
            stream,
            text: text.into(),
            level,
            session: None,
            elapsed: None,
        }
    }

    pub(crate) fn stderr_line(line: impl Into<String>) -> Self {
        Self::new(DiagnosticStream::Stderr, DiagnosticLevel::Error, line)
    }

    pub(crate) fn malformed_stdout(line: impl Into<String>) -> Self {
        Self::new(DiagnosticStream::Stdout, DiagnosticLevel::Protocol, line)
    }

    pub(crate) fn with_session(mut self, session: impl Into<String>) -> Self {
        self.session = Some(session.into());
        self
    }

    pub(crate) fn with_elapsed(mut self, elapsed: Duration) -> Self {
        self.elapsed = Some(elapsed);
        self
    }

    pub fn is_heartbeat(&self) -> bool {
        self.stream == DiagnosticStream::Heartbeat
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}/{}] {}", self.stream, self.level, self.text)
    }
}

fn serialize_elapsed<S>(elapsed: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    match elapsed {
        Some(elapsed) => serializer.serialize_f64(elapsed.as_secs_f64()),
        None => serializer.serialize_none(),
    }
}

fn wall_clock_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|since| since.as_secs_f64())
        .unwrap_or_default()
}

/// Entry on the diagnostics queue.
#[derive(Debug)]
pub(crate) enum DiagnosticEntry {
    Diagnostic(Diagnostic),
    /// Pushed by the stderr reader once its stream is exhausted.
    Closed,
}

pub(crate) type DiagnosticSender = mpsc::Sender<DiagnosticEntry>;

pub(crate) fn publish(tx: &DiagnosticSender, diagnostic: Diagnostic) {
    // The drain may already be gone; nothing left to report to.
    let _ = tx.send(DiagnosticEntry::Diagnostic(diagnostic));
}

/// Draining sequence over the session's diagnostics.
///
/// Ends once the engine process has exited, stderr has been read to the end
/// and the queue is empty, or once every producer is gone. Sentinels from the
/// stderr reader do not end the sequence on their own because heartbeat checks
/// and message decoding may still publish after stderr closes.
pub struct Diagnostics {
    rx: mpsc::Receiver<DiagnosticEntry>,
    shared: Arc<Shared>,
    stderr_closed: bool,
    idle_polls_after_exit: u32,
    done: bool,
}

impl Diagnostics {
    pub(crate) fn new(rx: mpsc::Receiver<DiagnosticEntry>, shared: Arc<Shared>) -> Self {
        Self {
            rx,
            shared,
            stderr_closed: false,
            idle_polls_after_exit: 0,
            done: false,
        }
    }

    /// Return everything already queued without blocking.
    pub fn drain_ready(&mut self) -> Vec<Diagnostic> {
        let mut ready = Vec::new();
        while let Ok(entry) = self.rx.try_recv() {
            if let DiagnosticEntry::Diagnostic(diagnostic) = entry {
                ready.push(diagnostic);
            }
        }
        ready
    }

    /// Called after an empty poll.
    fn finished(&mut self) -> bool {
        if self.shared.stop.is_raised() {
            return true;
        }
        if self.shared.is_running() {
            return false;
        }
        // stderr may lag the exit slightly; a descendant holding the pipe open
        // must not keep the drain alive forever either.
        self.idle_polls_after_exit += 1;
        self.stderr_closed || self.idle_polls_after_exit >= MAX_IDLE_POLLS_AFTER_EXIT
    }
}

impl Iterator for Diagnostics {
    type Item = Diagnostic;

    fn next(&mut self) -> Option<Diagnostic> {
        if self.done {
            return None;
        }
        loop {
            match self.rx.recv_timeout(DRAIN_POLL) {
                Ok(DiagnosticEntry::Diagnostic(diagnostic)) => return Some(diagnostic),
                Ok(DiagnosticEntry::Closed) => self.stderr_closed = true,
                Err(mpsc::RecvTimeoutError::Timeout) => {
                    if self.finished() {
                        self.done = true;
                        return None;
                    }
                }
                Err(mpsc::RecvTimeoutError::Disconnected) => {
                    self.done = true;
                    return None;
                }
            }
        }
    }
}
