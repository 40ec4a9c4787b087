use std::io::{self, BufRead, BufReader, Read};
use std::sync::{mpsc, Arc};
use std::thread;

use crate::diagnostics::{Diagnostic, DiagnosticEntry};
use crate::session::Shared;

/// Entry on the stdout queue: raw lines, decoded later by the message iterator.
#[derive(Debug)]
pub(crate) enum StdoutEntry {
    Line(String),
    /// Pushed once stdout reaches end of input.
    Closed,
}

pub(crate) fn spawn_stdout_reader<R: Read + Send + 'static>(
    reader: R,
    shared: Arc<Shared>,
    tx: mpsc::Sender<StdoutEntry>,
) -> io::Result<thread::JoinHandle<()>> {
    spawn_line_reader("engine-session-stdout", reader, shared, tx, StdoutEntry::Line, || {
        StdoutEntry::Closed
    })
}

pub(crate) fn spawn_stderr_reader<R: Read + Send + 'static>(
    reader: R,
    shared: Arc<Shared>,
    tx: mpsc::Sender<DiagnosticEntry>,
) -> io::Result<thread::JoinHandle<()>> {
    spawn_line_reader(
        "engine-session-stderr",
        reader,
        shared,
        tx,
        |line| DiagnosticEntry::Diagnostic(Diagnostic::stderr_line(line)),
        || DiagnosticEntry::Closed,
    )
}

fn spawn_line_reader<R, T, W, C>(
    name: &str,
    reader: R,
    shared: Arc<Shared>,
    tx: mpsc::Sender<T>,
    wrap: W,
    closed: C,
) -> io::Result<thread::JoinHandle<()>>
where
    R: Read + Send + 'static,
    T: Send + 'static,
    W: Fn(String) -> T + Send + 'static,
    C: FnOnce() -> T + Send + 'static,
{
    thread::Builder::new().name(name.to_string()).spawn(move || {
        let mut buf_reader = BufReader::new(reader);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match buf_reader.read_until(b'\n', &mut buf) {
                Ok(0) | Err(_) => break,
                Ok(_) => {}
            }
            if shared.stop.is_raised() {
                break;
            }
            let line = String::from_utf8_lossy(&buf);
            let line = line.trim_end_matches(['\n', '\r']).to_string();
            // Keep draining the pipe even if nobody consumes the queue any more.
            let _ = tx.send(wrap(line));
        }
        let _ = tx.send(closed());
        drop(buf_reader);
    })
}
