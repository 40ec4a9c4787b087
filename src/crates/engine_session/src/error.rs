use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Result alias for session operations.
pub type SessionResult<T> = Result<T, SessionError>;

/// Errors raised to the caller while configuring, starting or driving a session.
///
/// Decode failures and liveness stalls are not represented here; they are
/// reported as [`Diagnostic`](crate::Diagnostic) values instead.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("missing configuration: {0} was not supplied and has no default")]
    MissingConfiguration(&'static str),
    #[error("failed to spawn engine {binary:?}: {source}")]
    Spawn {
        binary: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("engine process is not running")]
    NotRunning,
    #[error("failed to write to engine stdin: {0}")]
    TransportWrite(#[source] io::Error),
    #[error("request params must be a JSON object, got {0}")]
    InvalidParams(String),
    #[error("request id {0} leaves no larger id for later requests")]
    IdsExhausted(u64),
    #[error("failed to encode request: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("message stream for this session start was already claimed")]
    MessagesClaimed,
    #[error("diagnostics stream for this session start was already claimed")]
    DiagnosticsClaimed,
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl SessionError {
    pub(crate) fn spawn(binary: impl Into<PathBuf>, source: io::Error) -> Self {
        SessionError::Spawn {
            binary: binary.into(),
            source,
        }
    }
}
