use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

/// Lookup key for the default engine binary path.
pub const BINARY_ENV_KEY: &str = "ENGINE_SESSION_BIN";
/// Lookup key for the default project root.
pub const PROJECT_ROOT_ENV_KEY: &str = "ENGINE_SESSION_PROJECT_ROOT";

/// Process-level configuration for a managed engine session.
///
/// The session core only ever reads this struct. Ambient defaults (such as
/// environment variables) are folded in at the boundary through
/// [`SessionConfig::with_defaults_from`] before the session is constructed.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Path to the engine binary to spawn.
    pub binary_path: Option<PathBuf>,
    /// Project directory passed to the engine through `--path`.
    pub project_root: Option<PathBuf>,
    /// Additional CLI arguments appended after the fixed flags.
    pub extra_args: Vec<String>,
    /// Environment variables overlaid on the inherited environment.
    pub env: BTreeMap<String, String>,
    /// Optional working directory override for the child process.
    pub working_directory: Option<PathBuf>,
    /// Interval between background heartbeat checks; no monitor thread when unset.
    pub heartbeat_interval: Option<Duration>,
    /// Silence tolerated on stdout before a heartbeat diagnostic is published.
    /// Falls back to `heartbeat_interval` when unset.
    pub heartbeat_timeout: Option<Duration>,
    /// How long the banner handshake may stay unanswered before it is reported.
    pub handshake_timeout: Duration,
    /// Wait after the graceful terminate signal before escalating to a kill.
    pub grace_period: Duration,
    /// Upper bound for joining each background thread during shutdown.
    pub join_timeout: Duration,
    /// Client identifier announced in the handshake.
    pub client_name: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            binary_path: None,
            project_root: None,
            extra_args: Vec::new(),
            env: BTreeMap::new(),
            working_directory: None,
            heartbeat_interval: None,
            heartbeat_timeout: None,
            handshake_timeout: Duration::from_secs(5),
            grace_period: Duration::from_secs(5),
            join_timeout: Duration::from_secs(1),
            client_name: "engine-session".to_string(),
        }
    }
}

impl SessionConfig {
    /// Create a new config targeting a specific engine binary and project.
    pub fn new(binary_path: impl Into<PathBuf>, project_root: impl Into<PathBuf>) -> Self {
        Self {
            binary_path: Some(binary_path.into()),
            project_root: Some(project_root.into()),
            ..Self::default()
        }
    }

    /// Set the engine binary path.
    pub fn with_binary(mut self, path: impl Into<PathBuf>) -> Self {
        self.binary_path = Some(path.into());
        self
    }

    /// Set the project root passed through `--path`.
    pub fn with_project_root(mut self, path: impl Into<PathBuf>) -> Self {
        self.project_root = Some(path.into());
        self
    }

    /// Add a passthrough CLI argument.
    pub fn with_arg(mut self, arg: impl Into<String>) -> Self {
        self.extra_args.push(arg.into());
        self
    }

    /// Add several passthrough CLI arguments.
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.extra_args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Add an environment variable override.
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Override the working directory for the spawned process.
    pub fn with_working_directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_directory = Some(dir.into());
        self
    }

    /// Enable the background heartbeat monitor.
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = Some(interval);
        self
    }

    /// Override how much stdout silence is tolerated.
    pub fn with_heartbeat_timeout(mut self, timeout: Duration) -> Self {
        self.heartbeat_timeout = Some(timeout);
        self
    }

    /// Override how long the banner handshake may stay unanswered.
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Override the wait between the terminate signal and a forced kill.
    pub fn with_grace_period(mut self, grace: Duration) -> Self {
        self.grace_period = grace;
        self
    }

    /// Override the per-thread join bound used during shutdown.
    pub fn with_join_timeout(mut self, timeout: Duration) -> Self {
        self.join_timeout = timeout;
        self
    }

    /// Override the client identifier sent in the handshake.
    pub fn with_client_name(mut self, name: impl Into<String>) -> Self {
        self.client_name = name.into();
        self
    }

    /// The heartbeat timeout in effect: the explicit one, else the interval.
    pub fn effective_heartbeat_timeout(&self) -> Option<Duration> {
        self.heartbeat_timeout.or(self.heartbeat_interval)
    }

    /// Fill a missing binary path or project root from a key lookup.
    ///
    /// Explicit values always win. Empty lookups are treated as absent.
    pub fn with_defaults_from<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let fetch = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());
        if self.binary_path.is_none() {
            self.binary_path = fetch(BINARY_ENV_KEY).map(PathBuf::from);
        }
        if self.project_root.is_none() {
            self.project_root = fetch(PROJECT_ROOT_ENV_KEY).map(PathBuf::from);
        }
        self
    }

    /// Fill missing paths from the current process environment.
    pub fn with_process_env_defaults(self) -> Self {
        self.with_defaults_from(|key| std::env::var(key).ok())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn explicit_paths_win_over_lookup() {
        let lookup: HashMap<&str, &str> = [
            (BINARY_ENV_KEY, "/opt/engine"),
            (PROJECT_ROOT_ENV_KEY, "/srv/project"),
        ]
        .into_iter()
        .collect();

        let config = SessionConfig::default()
            .with_binary("/usr/bin/engine")
            .with_defaults_from(|key| lookup.get(key).map(|value| value.to_string()));

        assert_eq!(config.binary_path, Some(PathBuf::from("/usr/bin/engine")));
        assert_eq!(config.project_root, Some(PathBuf::from("/srv/project")));
    }

    #[test]
    fn blank_lookups_are_ignored() {
        let config = SessionConfig::default().with_defaults_from(|_| Some("  ".to_string()));
        assert!(config.binary_path.is_none());
        assert!(config.project_root.is_none());
    }

    #[test]
    fn heartbeat_timeout_falls_back_to_interval() {
        let config = SessionConfig::default().with_heartbeat_interval(Duration::from_millis(50));
        assert_eq!(
            config.effective_heartbeat_timeout(),
            Some(Duration::from_millis(50))
        );

        let config = config.with_heartbeat_timeout(Duration::from_millis(120));
        assert_eq!(
            config.effective_heartbeat_timeout(),
            Some(Duration::from_millis(120))
        );
    }
}
