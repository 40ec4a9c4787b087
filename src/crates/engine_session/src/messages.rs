use std::sync::{mpsc, Arc};
use std::time::Duration;

use crate::diagnostics::{publish, Diagnostic, DiagnosticSender};
use crate::heartbeat::check_liveness;
use crate::protocol::{decode_line, Decoded, Inbound};
use crate::reader::StdoutEntry;
use crate::session::Shared;
use crate::shutdown::lock;

/// Single-pass sequence of decoded messages from the engine's stdout.
///
/// Blank lines are skipped, undecodable lines become protocol diagnostics and
/// the banner handshake response is absorbed into the session description.
/// An idle `timeout` does not end the sequence; it runs the heartbeat check
/// and keeps waiting. The sequence ends once stdout is closed.
pub struct Messages {
    rx: mpsc::Receiver<StdoutEntry>,
    shared: Arc<Shared>,
    diagnostics: DiagnosticSender,
    timeout: Option<Duration>,
    done: bool,
}

impl Messages {
    pub(crate) fn new(
        rx: mpsc::Receiver<StdoutEntry>,
        shared: Arc<Shared>,
        diagnostics: DiagnosticSender,
        timeout: Option<Duration>,
    ) -> Self {
        Self {
            rx,
            shared,
            diagnostics,
            timeout,
            done: false,
        }
    }

    fn next_entry(&self) -> Option<StdoutEntry> {
        loop {
            let received = match self.timeout {
                Some(timeout) => self.rx.recv_timeout(timeout),
                None => self
                    .rx
                    .recv()
                    .map_err(|_| mpsc::RecvTimeoutError::Disconnected),
            };
            match received {
                Ok(entry) => return Some(entry),
                Err(mpsc::RecvTimeoutError::Timeout) => {
                    check_liveness(&self.shared, &self.diagnostics);
                }
                Err(mpsc::RecvTimeoutError::Disconnected) => return None,
            }
        }
    }
}

impl Iterator for Messages {
    type Item = Inbound;

    fn next(&mut self) -> Option<Inbound> {
        while !self.done {
            let line = match self.next_entry() {
                Some(StdoutEntry::Line(line)) => line,
                Some(StdoutEntry::Closed) | None => {
                    self.done = true;
                    break;
                }
            };

            match decode_line(&line) {
                Decoded::Blank => continue,
                Decoded::Malformed(text) => {
                    publish(&self.diagnostics, Diagnostic::malformed_stdout(text));
                }
                Decoded::Message(message) => {
                    self.shared.activity.touch();
                    if lock(&self.shared.handshake).intercept(&message) {
                        continue;
                    }
                    return Some(message);
                }
            }
        }
        None
    }
}

impl std::iter::FusedIterator for Messages {}
