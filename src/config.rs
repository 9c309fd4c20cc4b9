//! Global configuration parsing, validation, and credential loading.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use tracing::warn;

use crate::{AppError, Result};

/// Keyring service name used for engine credentials.
pub const KEYRING_SERVICE: &str = "session-relay";

/// Engine process configuration.
///
/// The API credential is loaded at runtime via OS keychain or environment
/// variable, never from the TOML file.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct EngineConfig {
    /// Binary that produces the NDJSON update-event stream.
    pub host_cli: String,
    /// Arguments passed before the prompt.
    #[serde(default)]
    pub host_cli_args: Vec<String>,
    /// Environment variable name under which the credential is handed to the engine.
    #[serde(default = "default_credential_env")]
    pub credential_env: String,
    /// Whether a credential is required before any submission is accepted.
    #[serde(default = "default_true")]
    pub require_credential: bool,
    /// Grace period between a SIGINT and a hard kill on cancellation.
    #[serde(default = "default_cancel_grace_millis")]
    pub cancel_grace_millis: u64,
    /// API credential (populated at runtime).
    #[serde(skip)]
    pub credential: Option<String>,
}

fn default_credential_env() -> String {
    "AGENT_API_KEY".into()
}

fn default_true() -> bool {
    true
}

fn default_cancel_grace_millis() -> u64 {
    2000
}

/// How identifiers for brand-new sessions are allocated.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum SessionIdStrategy {
    /// Random UUID v4.
    #[default]
    Random,
    /// `sha256(workingDirectory, initialPrompt)`, so identical requests resume.
    Derived,
}

/// Session registry and controller settings.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct SessionConfig {
    /// Inactivity TTL after which a session is evicted.
    #[serde(default = "default_ttl_seconds")]
    pub ttl_seconds: u64,
    /// Identifier allocation strategy for new sessions.
    #[serde(default)]
    pub id_strategy: SessionIdStrategy,
    /// Delay observed after a forced cancellation before the session is reused.
    #[serde(default = "default_force_settle_millis")]
    pub force_settle_millis: u64,
    /// Period of the background eviction sweep.
    #[serde(default = "default_sweep_interval_seconds")]
    pub sweep_interval_seconds: u64,
}

fn default_ttl_seconds() -> u64 {
    1800
}

fn default_force_settle_millis() -> u64 {
    100
}

fn default_sweep_interval_seconds() -> u64 {
    60
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ttl_seconds: default_ttl_seconds(),
            id_strategy: SessionIdStrategy::default(),
            force_settle_millis: default_force_settle_millis(),
            sweep_interval_seconds: default_sweep_interval_seconds(),
        }
    }
}

/// Liveness supervision thresholds.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct HeartbeatConfig {
    /// Unconditional wall-clock limit for one stream.
    #[serde(default = "default_hard_timeout_seconds")]
    pub hard_timeout_seconds: u64,
    /// Period of the inactivity check.
    #[serde(default = "default_check_interval_seconds")]
    pub check_interval_seconds: u64,
    /// Inactivity after which a warning is logged.
    #[serde(default = "default_warn_after_seconds")]
    pub warn_after_seconds: u64,
    /// Inactivity after which the stream is force-terminated.
    #[serde(default = "default_kill_after_seconds")]
    pub kill_after_seconds: u64,
    /// Inactivity after which consumers see the session flagged as stuck.
    #[serde(default = "default_stuck_warning_seconds")]
    pub stuck_warning_seconds: u64,
}

fn default_hard_timeout_seconds() -> u64 {
    600
}

fn default_check_interval_seconds() -> u64 {
    5
}

fn default_warn_after_seconds() -> u64 {
    60
}

fn default_kill_after_seconds() -> u64 {
    300
}

fn default_stuck_warning_seconds() -> u64 {
    10
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            hard_timeout_seconds: default_hard_timeout_seconds(),
            check_interval_seconds: default_check_interval_seconds(),
            warn_after_seconds: default_warn_after_seconds(),
            kill_after_seconds: default_kill_after_seconds(),
            stuck_warning_seconds: default_stuck_warning_seconds(),
        }
    }
}

/// Checkpoint cadence.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct CheckpointConfig {
    /// Write the task after this many events even without a forcing event.
    #[serde(default = "default_every_events")]
    pub every_events: u32,
}

fn default_every_events() -> u32 {
    10
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            every_events: default_every_events(),
        }
    }
}

fn default_http_port() -> u16 {
    4080
}

fn default_ipc_name() -> String {
    "session-relay".into()
}

fn default_retention_days() -> u32 {
    30
}

/// Global configuration parsed from `config.toml`.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct GlobalConfig {
    /// HTTP port for the submit/inspect/kill transport.
    #[serde(default = "default_http_port")]
    pub http_port: u16,
    /// Named pipe / Unix socket identifier.
    #[serde(default = "default_ipc_name")]
    pub ipc_name: String,
    /// `SQLite` file holding the task records.
    pub db_path: PathBuf,
    /// Days after which finished tasks are purged.
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
    /// Engine process settings.
    pub engine: EngineConfig,
    /// Session registry settings.
    #[serde(default)]
    pub sessions: SessionConfig,
    /// Heartbeat thresholds.
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,
    /// Checkpoint cadence.
    #[serde(default)]
    pub checkpoint: CheckpointConfig,
}

impl GlobalConfig {
    /// Load and validate configuration from a TOML file path.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the file cannot be read or contains
    /// invalid TOML, or if validation fails.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|err| AppError::Config(format!("failed to read config: {err}")))?;
        Self::from_toml_str(&raw)
    }

    /// Parse configuration from a TOML string and validate it.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if parsing or validation fails.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Load the engine credential from OS keychain with env-var fallback.
    ///
    /// A missing credential is only an error when `engine.require_credential`
    /// is set; otherwise the engine runs without one.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if a required credential is absent.
    pub async fn load_credentials(&mut self) -> Result<()> {
        match load_credential("engine_api_key", &self.engine.credential_env).await {
            Ok(value) => self.engine.credential = Some(value),
            Err(err) if self.engine.require_credential => return Err(err),
            Err(err) => {
                warn!(%err, "engine credential not found; continuing without one");
            }
        }
        Ok(())
    }

    /// Ensure the engine credential is present when one is required.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the credential is required but missing.
    pub fn ensure_credentials(&self) -> Result<()> {
        if self.engine.require_credential && self.engine.credential.is_none() {
            return Err(AppError::Config(format!(
                "missing engine credential ({})",
                self.engine.credential_env
            )));
        }
        Ok(())
    }

    /// Directory holding runtime artifacts (database, IPC token).
    #[must_use]
    pub fn data_dir(&self) -> PathBuf {
        self.db_path
            .parent()
            .map_or_else(|| PathBuf::from("."), Path::to_path_buf)
    }

    /// Session inactivity TTL.
    #[must_use]
    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.sessions.ttl_seconds)
    }

    /// Settle delay after a forced cancellation.
    #[must_use]
    pub fn force_settle(&self) -> Duration {
        Duration::from_millis(self.sessions.force_settle_millis)
    }

    fn validate(&self) -> Result<()> {
        if self.engine.host_cli.trim().is_empty() {
            return Err(AppError::Config("engine.host_cli must not be empty".into()));
        }

        if self.sessions.ttl_seconds == 0 || self.sessions.sweep_interval_seconds == 0 {
            return Err(AppError::Config(
                "sessions.ttl_seconds and sessions.sweep_interval_seconds must be greater than zero"
                    .into(),
            ));
        }

        let hb = &self.heartbeat;
        if hb.check_interval_seconds == 0 || hb.hard_timeout_seconds == 0 {
            return Err(AppError::Config(
                "heartbeat intervals must be greater than zero".into(),
            ));
        }
        if hb.warn_after_seconds >= hb.kill_after_seconds {
            return Err(AppError::Config(
                "heartbeat.warn_after_seconds must be less than kill_after_seconds".into(),
            ));
        }

        if self.checkpoint.every_events == 0 {
            return Err(AppError::Config(
                "checkpoint.every_events must be greater than zero".into(),
            ));
        }

        Ok(())
    }
}

/// Load a single credential from OS keychain with env-var fallback.
async fn load_credential(keyring_key: &str, env_key: &str) -> Result<String> {
    let key = keyring_key.to_owned();

    // keyring is synchronous I/O.
    let keychain_result = tokio::task::spawn_blocking(move || {
        keyring::Entry::new(KEYRING_SERVICE, &key).and_then(|entry| entry.get_password())
    })
    .await
    .map_err(|err| AppError::Config(format!("keychain task panicked: {err}")))?;

    match keychain_result {
        Ok(value) if !value.is_empty() => return Ok(value),
        Ok(_) => {
            warn!(key = keyring_key, "keychain entry is empty, trying env var");
        }
        Err(err) => {
            warn!(
                key = keyring_key,
                ?err,
                "keychain lookup failed, trying env var"
            );
        }
    }

    match env::var(env_key) {
        Ok(value) if !value.is_empty() => Ok(value),
        _ => Err(AppError::Config(format!(
            "credential {keyring_key} not found in keychain or {env_key} env var"
        ))),
    }
}
