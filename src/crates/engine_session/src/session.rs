use std::io::{self, Write};
use std::ops::{Deref, DerefMut};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, Command, ExitStatus, Stdio};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::Duration;

use serde_json::{Map, Value};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::SessionConfig;
use crate::diagnostics::{DiagnosticEntry, DiagnosticSender, Diagnostics};
use crate::error::{SessionError, SessionResult};
use crate::handshake::Handshake;
use crate::heartbeat::{self, ActivityClock, HeartbeatPolicy};
use crate::messages::Messages;
use crate::protocol::{self, Request, HANDSHAKE_ID, HANDSHAKE_METHOD};
use crate::reader::{self, StdoutEntry};
use crate::shutdown::{self, lock, StopSignal};

/// Flags placed between the binary and the project root on every launch.
const FIXED_FLAGS: [&str; 2] = ["--headless", "--path"];

/// Lifecycle of a [`Session`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    NotStarted,
    Running,
    Stopping,
    Stopped,
}

/// Immutable snapshot returned by [`Session::describe`].
#[derive(Debug, Clone, PartialEq)]
pub struct SessionDescription {
    pub session_id: String,
    pub pid: Option<u32>,
    pub command: Vec<String>,
    pub project_root: PathBuf,
    pub banner: Option<Map<String, Value>>,
    pub heartbeat_interval: Option<Duration>,
    pub heartbeat_timeout: Option<Duration>,
    pub handshake_timeout: Duration,
    pub state: SessionState,
}

/// State reachable from the session's background threads.
pub(crate) struct Shared {
    pub(crate) session_id: String,
    pub(crate) child: Mutex<Option<Child>>,
    pub(crate) stop: StopSignal,
    pub(crate) activity: ActivityClock,
    pub(crate) handshake: Mutex<Handshake>,
    pub(crate) heartbeat: HeartbeatPolicy,
    pub(crate) handshake_timeout: Duration,
}

impl Shared {
    /// True while a child exists and has not exited. Never blocks on the child.
    pub(crate) fn is_running(&self) -> bool {
        match lock(&self.child).as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }
}

struct Worker {
    name: &'static str,
    handle: thread::JoinHandle<()>,
}

/// One managed lifetime of a headless engine process and its stdio channels.
///
/// ```no_run
/// use std::time::Duration;
/// use engine_session::{Session, SessionConfig};
/// use serde_json::json;
///
/// let config = SessionConfig::new("/opt/engine/bin/engine", "/srv/game")
///     .with_heartbeat_interval(Duration::from_secs(1));
/// let mut session = Session::new(config)?;
/// let mut running = session.scoped()?;
/// running.request("scene.load", json!({"path": "res://main.tscn"}))?;
/// for message in running.messages(Some(Duration::from_millis(250)))? {
///     if message.is_response() {
///         break;
///     }
/// }
/// # Ok::<(), engine_session::SessionError>(())
/// ```
pub struct Session {
    config: SessionConfig,
    binary_path: PathBuf,
    project_root: PathBuf,
    shared: Arc<Shared>,
    state: SessionState,
    stdin: Option<ChildStdin>,
    next_id: u64,
    message_rx: Option<mpsc::Receiver<StdoutEntry>>,
    diagnostic_rx: Option<mpsc::Receiver<DiagnosticEntry>>,
    diagnostic_tx: Option<DiagnosticSender>,
    workers: Vec<Worker>,
}

impl Session {
    /// Validate the configuration and prepare a session without spawning anything.
    pub fn new(config: SessionConfig) -> SessionResult<Self> {
        let binary_path = config
            .binary_path
            .clone()
            .ok_or(SessionError::MissingConfiguration("engine binary path"))?;
        let project_root = config
            .project_root
            .clone()
            .ok_or(SessionError::MissingConfiguration("project root"))?;

        let shared = Arc::new(Shared {
            session_id: Uuid::new_v4().to_string(),
            child: Mutex::new(None),
            stop: StopSignal::default(),
            activity: ActivityClock::new(),
            handshake: Mutex::new(Handshake::default()),
            heartbeat: HeartbeatPolicy {
                timeout: config.effective_heartbeat_timeout(),
            },
            handshake_timeout: config.handshake_timeout,
        });

        Ok(Self {
            config,
            binary_path,
            project_root,
            shared,
            state: SessionState::NotStarted,
            stdin: None,
            next_id: 1,
            message_rx: None,
            diagnostic_rx: None,
            diagnostic_tx: None,
            workers: Vec::new(),
        })
    }

    /// Identifier shared by every start of this session.
    pub fn session_id(&self) -> &str {
        &self.shared.session_id
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// True while the engine process is alive. Never blocks.
    pub fn is_running(&self) -> bool {
        self.shared.is_running()
    }

    /// Process id of the current engine, if one has been spawned and not released.
    pub fn pid(&self) -> Option<u32> {
        lock(&self.shared.child).as_ref().map(Child::id)
    }

    /// Banner negotiated during start, once the message stream has seen it.
    pub fn banner(&self) -> Option<Map<String, Value>> {
        lock(&self.shared.handshake).banner().cloned()
    }

    /// Full command line: binary, fixed flags, project root, extra args.
    pub fn command_line(&self) -> Vec<String> {
        let mut command = vec![self.binary_path.display().to_string()];
        command.extend(FIXED_FLAGS.iter().map(|flag| flag.to_string()));
        command.push(self.project_root.display().to_string());
        command.extend(self.config.extra_args.iter().cloned());
        command
    }

    /// Spawn the engine, start the background threads and send the banner request.
    ///
    /// Does nothing while the engine is alive. A session whose engine exited
    /// on its own is torn down and relaunched.
    pub fn start(&mut self) -> SessionResult<()> {
        if self.is_running() {
            return Ok(());
        }
        if self.state == SessionState::Running {
            self.stop();
        }

        let mut cmd = Command::new(&self.binary_path);
        cmd.args(FIXED_FLAGS);
        cmd.arg(&self.project_root);
        cmd.args(&self.config.extra_args);
        if let Some(dir) = &self.config.working_directory {
            cmd.current_dir(dir);
        }
        cmd.envs(&self.config.env);
        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());

        let mut child = cmd
            .spawn()
            .map_err(|err| SessionError::spawn(&self.binary_path, err))?;
        let (stdin, stdout, stderr) =
            match (child.stdin.take(), child.stdout.take(), child.stderr.take()) {
                (Some(stdin), Some(stdout), Some(stderr)) => (stdin, stdout, stderr),
                _ => {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(SessionError::spawn(
                        &self.binary_path,
                        io::Error::new(io::ErrorKind::BrokenPipe, "failed to capture engine stdio"),
                    ));
                }
            };

        let pid = child.id();
        *lock(&self.shared.child) = Some(child);
        self.stdin = Some(stdin);
        self.state = SessionState::Running;
        self.shared.stop.clear();
        self.shared.activity.reset();
        info!(session_id = %self.shared.session_id, pid, "engine spawned");

        let (message_tx, message_rx) = mpsc::channel();
        let (diagnostic_tx, diagnostic_rx) = mpsc::channel();
        self.message_rx = Some(message_rx);
        self.diagnostic_rx = Some(diagnostic_rx);
        self.diagnostic_tx = Some(diagnostic_tx.clone());

        if let Err(err) = self.launch_workers(stdout, stderr, message_tx, diagnostic_tx) {
            self.stop();
            return Err(err.into());
        }

        let params = protocol::handshake_params(&self.config.client_name, &self.shared.session_id);
        let id = self.send(HANDSHAKE_METHOD, params, Some(HANDSHAKE_ID))?;
        lock(&self.shared.handshake).begin(id);
        debug!(session_id = %self.shared.session_id, "banner handshake sent");
        Ok(())
    }

    fn launch_workers(
        &mut self,
        stdout: impl io::Read + Send + 'static,
        stderr: impl io::Read + Send + 'static,
        message_tx: mpsc::Sender<StdoutEntry>,
        diagnostic_tx: DiagnosticSender,
    ) -> io::Result<()> {
        let handle = reader::spawn_stdout_reader(stdout, self.shared.clone(), message_tx)?;
        self.workers.push(Worker {
            name: "stdout reader",
            handle,
        });

        let handle = reader::spawn_stderr_reader(stderr, self.shared.clone(), diagnostic_tx.clone())?;
        self.workers.push(Worker {
            name: "stderr reader",
            handle,
        });

        if let Some(interval) = self.config.heartbeat_interval.filter(|i| !i.is_zero()) {
            let handle = heartbeat::spawn_monitor(self.shared.clone(), interval, diagnostic_tx)?;
            self.workers.push(Worker {
                name: "heartbeat monitor",
                handle,
            });
        }
        Ok(())
    }

    /// Write one request line to the engine and return the id used.
    ///
    /// Without `id_override` the next automatic id is assigned; automatic ids
    /// always exceed every id used before in this session. An id with no
    /// successor (`u64::MAX`) is refused with [`SessionError::IdsExhausted`]
    /// before anything is written. Write failures are
    /// returned as [`SessionError::TransportWrite`] and never retried.
    pub fn send(
        &mut self,
        method: &str,
        params: Value,
        id_override: Option<u64>,
    ) -> SessionResult<u64> {
        if !self.is_running() {
            return Err(SessionError::NotRunning);
        }
        let stdin = self.stdin.as_mut().ok_or(SessionError::NotRunning)?;

        let id = id_override.unwrap_or(self.next_id);
        let after = id.checked_add(1).ok_or(SessionError::IdsExhausted(id))?;
        let line = Request::new(id, method, params)?.encode_line()?;
        self.next_id = self.next_id.max(after);

        stdin
            .write_all(line.as_bytes())
            .and_then(|()| stdin.flush())
            .map_err(SessionError::TransportWrite)?;
        Ok(id)
    }

    /// Send with an automatically assigned id.
    pub fn request(&mut self, method: &str, params: Value) -> SessionResult<u64> {
        self.send(method, params, None)
    }

    /// Claim the message sequence for the current start.
    ///
    /// `timeout` bounds each idle wait before a heartbeat check runs; `None`
    /// blocks until the next line.
    pub fn messages(&mut self, timeout: Option<Duration>) -> SessionResult<Messages> {
        if self.state == SessionState::NotStarted {
            return Err(SessionError::NotRunning);
        }
        let rx = self.message_rx.take().ok_or(SessionError::MessagesClaimed)?;
        let tx = self.diagnostic_tx.clone().ok_or(SessionError::NotRunning)?;
        Ok(Messages::new(rx, self.shared.clone(), tx, timeout))
    }

    /// Claim the diagnostics drain for the current start.
    pub fn diagnostics(&mut self) -> SessionResult<Diagnostics> {
        if self.state == SessionState::NotStarted {
            return Err(SessionError::NotRunning);
        }
        let rx = self
            .diagnostic_rx
            .take()
            .ok_or(SessionError::DiagnosticsClaimed)?;
        Ok(Diagnostics::new(rx, self.shared.clone()))
    }

    /// Wait for the engine to exit on its own.
    ///
    /// Returns `None` if `timeout` passed first or no engine was ever started.
    pub fn wait(&self, timeout: Option<Duration>) -> SessionResult<Option<ExitStatus>> {
        Ok(shutdown::wait_for_exit(&self.shared.child, timeout)?)
    }

    /// Shut the engine down and release every resource. Safe to call repeatedly.
    ///
    /// Order: stop signal, close stdin, graceful terminate, forced kill after
    /// the grace period, bounded thread joins, handle release.
    pub fn stop(&mut self) {
        self.shared.stop.raise();
        if self.state != SessionState::Running {
            return;
        }
        self.state = SessionState::Stopping;

        if let Some(mut stdin) = self.stdin.take() {
            // The engine may already be gone.
            let _ = stdin.flush();
            drop(stdin);
        }

        self.terminate_child();

        for worker in self.workers.drain(..) {
            if !shutdown::join_bounded(worker.handle, self.config.join_timeout) {
                warn!(
                    session_id = %self.shared.session_id,
                    worker = worker.name,
                    "worker did not finish in time, detaching"
                );
            }
        }

        lock(&self.shared.child).take();
        self.state = SessionState::Stopped;
        info!(session_id = %self.shared.session_id, "engine session stopped");
    }

    fn terminate_child(&self) {
        let session_id = &self.shared.session_id;
        {
            let mut guard = lock(&self.shared.child);
            let Some(child) = guard.as_mut() else {
                return;
            };
            match child.try_wait() {
                Ok(Some(status)) => {
                    debug!(%session_id, ?status, "engine already exited");
                    return;
                }
                Ok(None) => {}
                Err(err) => warn!(%session_id, %err, "failed to poll engine"),
            }
            if let Err(err) = shutdown::request_terminate(child) {
                warn!(%session_id, %err, "failed to signal engine");
            }
        }

        let grace = self.config.grace_period;
        match shutdown::wait_for_exit(&self.shared.child, Some(grace)) {
            Ok(Some(status)) => {
                debug!(%session_id, ?status, "engine exited after terminate");
                return;
            }
            Ok(None) => warn!(
                %session_id,
                ?grace,
                "engine did not exit within grace period, forcing kill"
            ),
            Err(err) => warn!(%session_id, %err, "failed to wait for engine"),
        }

        if let Some(child) = lock(&self.shared.child).as_mut() {
            if let Err(err) = child.kill() {
                warn!(%session_id, %err, "failed to kill engine");
            }
        }
        match shutdown::wait_for_exit(&self.shared.child, Some(grace)) {
            Ok(Some(status)) => debug!(%session_id, ?status, "engine killed"),
            Ok(None) => warn!(%session_id, "engine still alive after kill"),
            Err(err) => warn!(%session_id, %err, "failed to wait for engine"),
        }
    }

    /// Snapshot of the session's identity, command and negotiated banner.
    pub fn describe(&self) -> SessionDescription {
        SessionDescription {
            session_id: self.shared.session_id.clone(),
            pid: self.pid(),
            command: self.command_line(),
            project_root: self.project_root.clone(),
            banner: self.banner(),
            heartbeat_interval: self.config.heartbeat_interval,
            heartbeat_timeout: self.config.effective_heartbeat_timeout(),
            handshake_timeout: self.config.handshake_timeout,
            state: self.state,
        }
    }

    /// Start the session and return a guard that stops it when dropped.
    pub fn scoped(&mut self) -> SessionResult<SessionGuard<'_>> {
        if let Err(err) = self.start() {
            self.stop();
            return Err(err);
        }
        Ok(SessionGuard { session: self })
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Running session that is stopped on every exit path, including unwinding.
pub struct SessionGuard<'a> {
    session: &'a mut Session,
}

impl Deref for SessionGuard<'_> {
    type Target = Session;

    fn deref(&self) -> &Session {
        self.session
    }
}

impl DerefMut for SessionGuard<'_> {
    fn deref_mut(&mut self) -> &mut Session {
        self.session
    }
}

impl Drop for SessionGuard<'_> {
    fn drop(&mut self) {
        self.session.stop();
    }
}

/// Build and start a session, run `f`, then stop it regardless of the outcome.
pub fn with_session<T, F>(config: SessionConfig, f: F) -> SessionResult<T>
where
    F: FnOnce(&mut Session) -> SessionResult<T>,
{
    let mut session = Session::new(config)?;
    let mut running = session.scoped()?;
    let outcome = f(&mut running);
    drop(running);
    outcome
}
