//! Managed sessions for a headless engine process driven over its standard
//! streams with line-delimited JSON.
//!
//! A [`Session`] spawns the engine, pumps stdout and stderr on background
//! threads, negotiates a banner handshake, watches stdout for silence and
//! shuts everything down in a fixed order.
//!
//! Typical usage:
//! ```no_run
//! use std::time::Duration;
//! use engine_session::{with_session, SessionConfig};
//! use serde_json::json;
//!
//! let config = SessionConfig::default()
//!     .with_process_env_defaults()
//!     .with_args(["--script", "res://tests/run_all_tests.gd"])
//!     .with_heartbeat_interval(Duration::from_secs(2));
//!
//! with_session(config, |session| {
//!     let diagnostics = session.diagnostics()?;
//!     let collector = std::thread::spawn(move || diagnostics.collect::<Vec<_>>());
//!
//!     session.request("suite.run", json!({"manifest": "tests/manifest.json"}))?;
//!     for message in session.messages(Some(Duration::from_millis(500)))? {
//!         println!("engine says {message:?}");
//!     }
//!     println!("banner: {:?}", session.describe().banner);
//!     session.stop();
//!
//!     for diagnostic in collector.join().unwrap_or_default() {
//!         eprintln!("{diagnostic}");
//!     }
//!     Ok(())
//! })?;
//! # Ok::<(), engine_session::SessionError>(())
//! ```

mod config;
mod diagnostics;
mod error;
mod handshake;
mod heartbeat;
mod messages;
pub mod protocol;
mod reader;
mod session;
mod shutdown;

pub use config::{SessionConfig, BINARY_ENV_KEY, PROJECT_ROOT_ENV_KEY};
pub use diagnostics::{Diagnostic, DiagnosticLevel, DiagnosticStream, Diagnostics};
pub use error::{SessionError, SessionResult};
pub use messages::Messages;
pub use protocol::Inbound;
pub use session::{with_session, Session, SessionDescription, SessionGuard, SessionState};
