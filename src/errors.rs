//! Error types shared across the application.

use std::fmt::{Display, Formatter};

/// Shared application result type.
pub type Result<T> = std::result::Result<T, AppError>;

/// Application error enumeration covering all domain failure modes.
#[derive(Debug)]
pub enum AppError {
    /// Configuration parsing or validation failure.
    Config(String),
    /// File-system or socket I/O failure.
    Io(String),
    /// Outbound payload could not be framed (body over the size limit).
    Framing(String),
    /// Session initialization payload was invalid or could not be applied.
    Init(String),
    /// Docker sandbox lifecycle or exec failure.
    Sandbox(String),
    /// Client transport or debuggee connection failure.
    Transport(String),
    /// Uploaded file path failed validation against the workspace root.
    PathViolation(String),
    /// Sequential handler queue failure (worker gone or handler panicked).
    Queue(String),
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "config: {msg}"),
            Self::Io(msg) => write!(f, "io: {msg}"),
            Self::Framing(msg) => write!(f, "framing: {msg}"),
            Self::Init(msg) => write!(f, "init: {msg}"),
            Self::Sandbox(msg) => write!(f, "sandbox: {msg}"),
            Self::Transport(msg) => write!(f, "transport: {msg}"),
            Self::PathViolation(msg) => write!(f, "path violation: {msg}"),
            Self::Queue(msg) => write!(f, "queue: {msg}"),
        }
    }
}

impl std::error::Error for AppError {}

impl From<toml::de::Error> for AppError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(format!("invalid config: {err}"))
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        Self::Init(format!("invalid json: {err}"))
    }
}

impl From<bollard::errors::Error> for AppError {
    fn from(err: bollard::errors::Error) -> Self {
        Self::Sandbox(err.to_string())
    }
}
