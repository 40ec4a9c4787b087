#![cfg(feature = "test-support")]

#[path = "session_support.rs"]
mod support;

use std::thread;
use std::time::Duration;

use engine_session::{Diagnostic, DiagnosticLevel, DiagnosticStream};
use support::{collect_diagnostics_after_exit, collect_messages, project_dir, started, stub_config};

fn heartbeats(diagnostics: &[Diagnostic]) -> Vec<&Diagnostic> {
    diagnostics
        .iter()
        .filter(|diagnostic| diagnostic.is_heartbeat())
        .collect()
}

#[test]
fn silent_engine_triggers_bounded_heartbeat_reports() {
    let project = project_dir();
    let timeout = Duration::from_millis(100);
    let mut session = started(
        stub_config(project.path())
            .with_arg("--no-banner")
            .with_heartbeat_interval(Duration::from_millis(50))
            .with_heartbeat_timeout(timeout),
    );
    let session_id = session.session_id().to_string();

    thread::sleep(Duration::from_millis(300));
    session.stop();
    let diagnostics: Vec<_> = session.diagnostics().expect("diagnostics").collect();

    let reports = heartbeats(&diagnostics);
    assert!(!reports.is_empty(), "expected a heartbeat report");
    assert!(
        reports.len() <= 4,
        "stalls are reported once per window, got {}",
        reports.len()
    );
    for report in reports {
        assert_eq!(report.stream, DiagnosticStream::Heartbeat);
        assert_eq!(report.level, DiagnosticLevel::Warning);
        assert_eq!(report.session.as_deref(), Some(session_id.as_str()));
        assert!(report.elapsed.expect("elapsed recorded") >= timeout);
        assert!(report.text.starts_with("No stdout messages for"));
    }
}

#[test]
fn idle_message_iteration_runs_the_heartbeat_check() {
    let project = project_dir();
    // No monitor thread: only the iterator's idle path can report.
    let mut session = started(
        stub_config(project.path())
            .with_heartbeat_timeout(Duration::from_millis(100))
            .with_args([
                "--delay-ms",
                "350",
                "--emit",
                r#"{"id":1,"method":"late","params":{}}"#,
                "--exit-after-emit",
            ]),
    );

    let messages = collect_messages(&mut session);
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].method(), Some("late"));

    let diagnostics = collect_diagnostics_after_exit(&mut session);
    let reports = heartbeats(&diagnostics);
    assert!(!reports.is_empty(), "iterator should report the stall");
    assert!(reports.len() <= 4);
    session.stop();
}

#[test]
fn chatty_engine_produces_no_heartbeat() {
    let project = project_dir();
    let mut session = started(
        stub_config(project.path())
            .with_arg("--echo")
            .with_heartbeat_interval(Duration::from_millis(20))
            .with_heartbeat_timeout(Duration::from_secs(5)),
    );

    let mut messages = session
        .messages(Some(Duration::from_millis(20)))
        .expect("message stream");
    for _ in 0..3 {
        session
            .request("tick", serde_json::Value::Null)
            .expect("send");
        assert!(messages.next().is_some());
        thread::sleep(Duration::from_millis(30));
    }

    session.stop();
    let diagnostics = session.diagnostics().expect("diagnostics").drain_ready();
    assert!(heartbeats(&diagnostics).is_empty());
}

#[test]
fn description_reports_heartbeat_settings() {
    let project = project_dir();
    let mut session = started(
        stub_config(project.path()).with_heartbeat_interval(Duration::from_millis(250)),
    );

    let description = session.describe();
    assert_eq!(description.heartbeat_interval, Some(Duration::from_millis(250)));
    assert_eq!(
        description.heartbeat_timeout,
        Some(Duration::from_millis(250)),
        "timeout falls back to the interval"
    );
    session.stop();
}
