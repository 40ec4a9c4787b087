//! Scriptable stand-in for the headless engine, used by the integration tests.

use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use clap::Parser;
use engine_session::protocol::HANDSHAKE_METHOD;
use serde_json::{json, Value};
use tracing::{debug, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "stub_worker", about = "Scriptable headless engine stub")]
struct Cli {
    /// Accepted for command-line compatibility with the real engine.
    #[arg(long)]
    headless: bool,

    /// Project root supplied by the session.
    #[arg(long)]
    path: Option<PathBuf>,

    /// JSON result returned for the banner handshake.
    #[arg(long)]
    banner: Option<String>,

    /// Never answer the banner handshake.
    #[arg(long)]
    no_banner: bool,

    /// Raw line written to stdout after the handshake (repeatable).
    #[arg(long = "emit")]
    emit: Vec<String>,

    /// Raw line written to stderr after the handshake (repeatable).
    #[arg(long = "stderr")]
    stderr: Vec<String>,

    /// Pause before emitting scripted lines.
    #[arg(long, default_value_t = 0)]
    delay_ms: u64,

    /// Answer every request with its method and params.
    #[arg(long)]
    echo: bool,

    /// Exit (closing stdout) right after the scripted lines.
    #[arg(long)]
    exit_after_emit: bool,

    /// Close stdin after the scripted lines and stay alive.
    #[arg(long)]
    close_stdin: bool,

    /// Ignore SIGTERM and keep running after stdin closes.
    #[arg(long)]
    ignore_term: bool,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    init_tracing()?;
    info!(path = ?cli.path, headless = cli.headless, "stub worker started");

    if cli.ignore_term {
        ignore_sigterm()?;
    }

    let stdin = io::stdin();
    let mut lines = stdin.lock().lines();
    let mut stdout = io::stdout();

    if let Some(line) = lines.next() {
        let request: Value = serde_json::from_str(&line?)?;
        let is_handshake = request.get("method").and_then(Value::as_str) == Some(HANDSHAKE_METHOD);
        if is_handshake && !cli.no_banner {
            let banner = match &cli.banner {
                Some(raw) => serde_json::from_str(raw)?,
                None => json!({"engine": "stub_worker", "version": env!("CARGO_PKG_VERSION")}),
            };
            let response = json!({"id": request.get("id").cloned().unwrap_or(Value::Null), "result": banner});
            write_line(&mut stdout, &response.to_string())?;
        } else if cli.echo {
            write_line(&mut stdout, &echo_response(&request).to_string())?;
        }
    }

    if cli.delay_ms > 0 {
        thread::sleep(Duration::from_millis(cli.delay_ms));
    }
    for line in &cli.emit {
        write_line(&mut stdout, line)?;
    }
    let mut stderr = io::stderr();
    for line in &cli.stderr {
        writeln!(stderr, "{line}")?;
    }

    if cli.exit_after_emit {
        return Ok(());
    }

    if cli.close_stdin {
        drop(lines);
        close_stdin();
        write_line(&mut stdout, &json!({"event": "stdin-closed"}).to_string())?;
        linger();
    }

    for line in lines {
        let line = line?;
        debug!(%line, "request received");
        if !cli.echo {
            continue;
        }
        match serde_json::from_str::<Value>(&line) {
            Ok(request) => write_line(&mut stdout, &echo_response(&request).to_string())?,
            Err(err) => debug!(%err, "ignoring undecodable request"),
        }
    }

    info!("stdin closed");
    if cli.ignore_term {
        linger();
    }
    Ok(())
}

fn init_tracing() -> Result<(), Box<dyn std::error::Error>> {
    let filter = EnvFilter::try_from_env("STUB_WORKER_LOG").unwrap_or_else(|_| EnvFilter::new("off"));
    fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_ansi(false)
        .try_init()
        .map_err(|err| format!("failed to init tracing: {err}"))?;
    Ok(())
}

fn echo_response(request: &Value) -> Value {
    json!({
        "id": request.get("id").cloned().unwrap_or(Value::Null),
        "result": {
            "method": request.get("method").cloned().unwrap_or(Value::Null),
            "params": request.get("params").cloned().unwrap_or(Value::Null),
        },
    })
}

fn write_line(stdout: &mut io::Stdout, line: &str) -> io::Result<()> {
    let mut handle = stdout.lock();
    writeln!(handle, "{line}")?;
    handle.flush()
}

fn linger() -> ! {
    loop {
        thread::sleep(Duration::from_secs(60));
    }
}

#[cfg(unix)]
fn ignore_sigterm() -> Result<(), Box<dyn std::error::Error>> {
    use nix::sys::signal::{signal, SigHandler, Signal};

    // SAFETY: installing SIG_IGN does not run any handler code.
    unsafe { signal(Signal::SIGTERM, SigHandler::SigIgn) }?;
    Ok(())
}

#[cfg(not(unix))]
fn ignore_sigterm() -> Result<(), Box<dyn std::error::Error>> {
    Ok(())
}

#[cfg(unix)]
fn close_stdin() {
    if let Err(err) = nix::unistd::close(0) {
        warn!(%err, "failed to close stdin");
    }
}

#[cfg(not(unix))]
fn close_stdin() {}
