#![cfg(feature = "test-support")]

#[path = "session_support.rs"]
mod support;

use std::panic::{self, AssertUnwindSafe};
use std::time::{Duration, Instant};

use engine_session::{with_session, Session, SessionError, SessionResult, SessionState};
use serde_json::{json, Value};
use support::{collect_messages, project_dir, started, stub_config, stub_worker_path};

#[test]
fn start_is_idempotent_while_running() {
    let project = project_dir();
    let mut session = started(stub_config(project.path()));
    let pid = session.pid().expect("pid while running");

    session.start().expect("second start is a no-op");
    assert_eq!(session.pid(), Some(pid));
    assert_eq!(session.state(), SessionState::Running);
    session.stop();
}

#[test]
fn stop_twice_leaves_the_same_end_state() {
    let project = project_dir();
    let mut session = started(stub_config(project.path()));
    assert!(session.is_running());

    session.stop();
    let first = session.describe();
    session.stop();
    let second = session.describe();

    assert!(!session.is_running());
    assert_eq!(first, second);
    assert_eq!(second.pid, None);
    assert_eq!(second.state, SessionState::Stopped);
    assert!(matches!(
        session.request("ping", Value::Null),
        Err(SessionError::NotRunning)
    ));
}

#[test]
fn engine_ignoring_terminate_is_killed_after_grace_period() {
    let project = project_dir();
    let grace = Duration::from_millis(300);
    let mut session = started(
        stub_config(project.path())
            .with_grace_period(grace)
            .with_args(["--ignore-term", "--emit", r#"{"event":"ready"}"#]),
    );

    // The ready line is written after SIGTERM is ignored.
    let mut messages = session
        .messages(Some(Duration::from_millis(50)))
        .expect("message stream");
    assert!(messages.next().is_some());

    let started_at = Instant::now();
    session.stop();
    let took = started_at.elapsed();

    assert!(!session.is_running());
    assert!(took >= grace, "stop returned before the grace period: {took:?}");
    assert!(
        took < grace + Duration::from_secs(3),
        "stop should be bounded, took {took:?}"
    );
    assert!(messages.next().is_none(), "stdout closes with the engine");
}

#[test]
fn session_can_be_restarted_after_stop() {
    let project = project_dir();
    let mut session = started(stub_config(project.path()).with_arg("--echo"));
    let session_id = session.session_id().to_string();
    let first_pid = session.pid();
    assert_eq!(session.request("one", Value::Null).expect("send"), 1);
    session.stop();

    session.start().expect("restart");
    assert_eq!(session.state(), SessionState::Running);
    assert_eq!(session.session_id(), session_id);
    assert_ne!(session.pid(), first_pid);
    assert_eq!(
        session.request("two", Value::Null).expect("send"),
        2,
        "ids are never reused within a session"
    );

    let reply = session
        .messages(Some(Duration::from_millis(50)))
        .expect("fresh message stream")
        .next()
        .expect("echo after restart");
    assert_eq!(reply.id(), Some(2));
    session.stop();
}

#[test]
fn exited_engine_reports_status_and_is_not_running() {
    let project = project_dir();
    let mut session = started(stub_config(project.path()).with_arg("--exit-after-emit"));

    let status = session
        .wait(Some(Duration::from_secs(5)))
        .expect("wait")
        .expect("engine exits by itself");
    assert!(status.success());
    assert!(!session.is_running());
    assert!(matches!(
        session.request("late", Value::Null),
        Err(SessionError::NotRunning)
    ));

    // Messages produced before the exit are still readable.
    assert!(collect_messages(&mut session).is_empty());
    session.stop();
    assert_eq!(session.state(), SessionState::Stopped);
}

#[test]
fn write_to_closed_stdin_is_a_transport_error() {
    let project = project_dir();
    let mut session = started(stub_config(project.path()).with_arg("--close-stdin"));

    let closed = session
        .messages(Some(Duration::from_millis(50)))
        .expect("message stream")
        .next()
        .expect("stdin-closed notice");
    assert_eq!(closed.as_object().and_then(|m| m.get("event")), Some(&json!("stdin-closed")));
    assert!(session.is_running());

    let err = session
        .request("unheard", json!({"payload": "x".repeat(64)}))
        .unwrap_err();
    assert!(matches!(err, SessionError::TransportWrite(_)), "got {err:?}");
    session.stop();
    assert!(!session.is_running());
}

#[test]
fn description_snapshots_the_command_line() {
    let project = project_dir();
    let mut session = started(stub_config(project.path()).with_args(["--emit", "{}"]));

    let description = session.describe();
    assert_eq!(description.session_id, session.session_id());
    assert_eq!(description.pid, session.pid());
    assert!(description.pid.is_some());
    assert_eq!(description.project_root, project.path());
    assert_eq!(
        description.command,
        vec![
            stub_worker_path().display().to_string(),
            "--headless".to_string(),
            "--path".to_string(),
            project.path().display().to_string(),
            "--emit".to_string(),
            "{}".to_string(),
        ]
    );
    assert_eq!(description.state, SessionState::Running);
    assert_eq!(description.handshake_timeout, Duration::from_secs(5));
    session.stop();
}

#[test]
fn scoped_guard_stops_on_error_and_panic() {
    let project = project_dir();
    let mut session = Session::new(stub_config(project.path())).expect("config");

    let outcome = (|| -> SessionResult<()> {
        let mut running = session.scoped()?;
        running.request("work", Value::Null)?;
        Err(SessionError::NotRunning)
    })();
    assert!(outcome.is_err());
    assert_eq!(session.state(), SessionState::Stopped);
    assert!(!session.is_running());

    let unwound = panic::catch_unwind(AssertUnwindSafe(|| {
        let running = session.scoped().expect("start");
        assert!(running.is_running());
        panic!("driver failure");
    }));
    assert!(unwound.is_err());
    assert_eq!(session.state(), SessionState::Stopped);
    assert!(!session.is_running());
}

#[test]
fn with_session_returns_the_closure_result() {
    let project = project_dir();
    let pid = with_session(stub_config(project.path()), |session| {
        assert!(session.is_running());
        Ok(session.pid())
    })
    .expect("session should run");
    assert!(pid.is_some());

    let err = with_session(stub_config(project.path()).with_binary("/no/such/engine"), |_| Ok(()))
        .unwrap_err();
    assert!(matches!(err, SessionError::Spawn { .. }));
}
