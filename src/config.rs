//! Global configuration parsing and validation.
//!
//! Every field carries a default so the bridge can start without a config
//! file; `config.toml` only needs to name the values it overrides.

use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::{AppError, Result};

/// Placeholder substituted with the allocated debug port in `debug_command`.
pub const PORT_PLACEHOLDER: &str = "{port}";

/// Placeholder substituted with the session's entry file in `debug_command`.
pub const MAIN_PLACEHOLDER: &str = "{main}";

/// Readiness polling used when connecting to a freshly started debuggee.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct ConnectConfig {
    /// Number of connection attempts before the session gives up.
    #[serde(default = "default_connect_attempts")]
    pub attempts: u32,
    /// Delay before the second attempt; doubled after every failure.
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    /// Upper bound on the delay between two attempts.
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

impl ConnectConfig {
    /// Delay before the first retry.
    #[must_use]
    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    /// Ceiling for the exponential backoff.
    #[must_use]
    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }
}

impl Default for ConnectConfig {
    fn default() -> Self {
        Self {
            attempts: default_connect_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

fn default_connect_attempts() -> u32 {
    20
}

fn default_initial_backoff_ms() -> u64 {
    50
}

fn default_max_backoff_ms() -> u64 {
    1000
}

/// Docker sandbox settings.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct SandboxConfig {
    /// Base image pulled before the container is created (`name:tag`).
    #[serde(default = "default_image")]
    pub image: String,
    /// Name of the shared container.
    #[serde(default = "default_container_name")]
    pub container_name: String,
    /// Path inside the container where the workspace root is mounted.
    ///
    /// Defaults to the workspace root so that uploaded paths resolve the
    /// same on both sides of the bind mount.
    #[serde(default)]
    pub mount_path: Option<PathBuf>,
    /// One-time command that installs the debuggee runtime.
    #[serde(default = "default_provision_command")]
    pub provision_command: Vec<String>,
    /// Debug invocation template; `{port}` and `{main}` are substituted.
    #[serde(default = "default_debug_command")]
    pub debug_command: Vec<String>,
    /// Bring the sandbox up at startup instead of on the first session.
    #[serde(default = "default_true")]
    pub prewarm: bool,
    /// Docker daemon socket; local defaults are used when absent.
    #[serde(default)]
    pub docker_socket: Option<String>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            image: default_image(),
            container_name: default_container_name(),
            mount_path: None,
            provision_command: default_provision_command(),
            debug_command: default_debug_command(),
            prewarm: default_true(),
            docker_socket: None,
        }
    }
}

impl SandboxConfig {
    /// Render `debug_command` for one session.
    #[must_use]
    pub fn render_debug_command(&self, main: &str, port: u16) -> Vec<String> {
        let port = port.to_string();
        self.debug_command
            .iter()
            .map(|arg| {
                arg.replace(PORT_PLACEHOLDER, &port)
                    .replace(MAIN_PLACEHOLDER, main)
            })
            .collect()
    }
}

fn default_image() -> String {
    "debian:bookworm-slim".into()
}

fn default_container_name() -> String {
    "dap-bridge-sandbox".into()
}

fn default_provision_command() -> Vec<String> {
    vec![
        "sh".into(),
        "-c".into(),
        "apt-get update -qq && apt-get install -y -qq --no-install-recommends nodejs".into(),
    ]
}

fn default_debug_command() -> Vec<String> {
    vec![
        "node".into(),
        "--inspect-brk=127.0.0.1:{port}".into(),
        "{main}".into(),
    ]
}

fn default_true() -> bool {
    true
}

fn default_bind_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 4711))
}

fn default_workspace_root() -> PathBuf {
    PathBuf::from("/tmp")
}

/// Global configuration parsed from `config.toml`.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct GlobalConfig {
    /// Address the WebSocket endpoint listens on.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: SocketAddr,
    /// Directory uploaded session files are written under.
    #[serde(default = "default_workspace_root")]
    pub workspace_root: PathBuf,
    /// Debuggee readiness polling.
    #[serde(default)]
    pub connect: ConnectConfig,
    /// Shared sandbox settings.
    #[serde(default)]
    pub sandbox: SandboxConfig,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            workspace_root: default_workspace_root(),
            connect: ConnectConfig::default(),
            sandbox: SandboxConfig::default(),
        }
    }
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

    /// Path inside the container that mirrors `workspace_root`.
    #[must_use]
    pub fn container_mount_path(&self) -> &Path {
        self.sandbox
            .mount_path
            .as_deref()
            .unwrap_or(&self.workspace_root)
    }

    /// Path inside the container for a host file under `workspace_root`.
    ///
    /// Paths outside the workspace root are returned unchanged.
    #[must_use]
    pub fn container_path(&self, host_file: &Path) -> PathBuf {
        host_file
            .strip_prefix(&self.workspace_root)
            .map_or_else(
                |_| host_file.to_path_buf(),
                |rel| self.container_mount_path().join(rel),
            )
    }

    /// Check cross-field constraints.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` describing the first violated constraint.
    pub fn validate(&self) -> Result<()> {
        if !self.workspace_root.is_absolute() {
            return Err(AppError::Config(
                "workspace_root must be an absolute path".into(),
            ));
        }

        if self.connect.attempts == 0 {
            return Err(AppError::Config(
                "connect.attempts must be greater than zero".into(),
            ));
        }

        if self.connect.max_backoff_ms < self.connect.initial_backoff_ms {
            return Err(AppError::Config(
                "connect.max_backoff_ms must not be below connect.initial_backoff_ms".into(),
            ));
        }

        if self.sandbox.image.trim().is_empty() {
            return Err(AppError::Config("sandbox.image must not be empty".into()));
        }

        if self.sandbox.container_name.trim().is_empty() {
            return Err(AppError::Config(
                "sandbox.container_name must not be empty".into(),
            ));
        }

        if self.sandbox.debug_command.is_empty() {
            return Err(AppError::Config(
                "sandbox.debug_command must not be empty".into(),
            ));
        }

        if !self
            .sandbox
            .debug_command
            .iter()
            .any(|arg| arg.contains(PORT_PLACEHOLDER))
        {
            return Err(AppError::Config(format!(
                "sandbox.debug_command must reference the debug port via {PORT_PLACEHOLDER}"
            )));
        }

        Ok(())
    }
}
