//! Shared execution sandbox for debuggee processes.
//!
//! The [`Sandbox`] trait decouples session handling from the container
//! runtime so that sessions receive the sandbox by injection and tests can
//! substitute an in-process fake. [`docker::DockerSandbox`] is the
//! production implementation.

pub mod docker;

use std::fmt;
use std::future::Future;
use std::pin::Pin;

use bytes::Bytes;
use futures_util::Stream;

use crate::dap::OutputCategory;
use crate::Result;

/// Boxed future returned by [`Sandbox`] methods.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Demultiplexed output of one exec'd process.
pub type OutputStream = Pin<Box<dyn Stream<Item = Result<OutputChunk>> + Send>>;

/// Lifecycle position of the shared sandbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SandboxState {
    /// Nothing has been done yet.
    Unprovisioned,
    /// Base image pull in progress.
    PullingImage,
    /// Container exists but is not running.
    Created,
    /// Container is running; runtime not yet installed.
    Started,
    /// Runtime installed; sessions may exec.
    Ready,
    /// Container has been removed.
    Removed,
}

/// Parameters for one debuggee launch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecRequest {
    /// Entry file, as a path valid inside the sandbox.
    pub main: String,
    /// Port the debuggee must bind its debug server to.
    pub port: u16,
}

/// One chunk of output, tagged with the stream it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputChunk {
    /// `stdout` or `stderr`.
    pub category: OutputCategory,
    /// Raw bytes as written by the process.
    pub data: Bytes,
}

impl OutputChunk {
    /// Chunk written to standard output.
    pub fn stdout(data: impl Into<Bytes>) -> Self {
        Self {
            category: OutputCategory::Stdout,
            data: data.into(),
        }
    }

    /// Chunk written to standard error.
    pub fn stderr(data: impl Into<Bytes>) -> Self {
        Self {
            category: OutputCategory::Stderr,
            data: data.into(),
        }
    }

    /// Output as text, replacing invalid UTF-8 sequences.
    #[must_use]
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.data).into_owned()
    }
}

/// A debuggee process running inside the sandbox.
///
/// The output stream ends when the process exits.
pub struct ExecProcess {
    /// Runtime-assigned identifier of the exec instance.
    pub id: String,
    /// Command line that was launched.
    pub command: Vec<String>,
    /// Demultiplexed stdout / stderr chunks in the order they were produced.
    pub output: OutputStream,
}

impl fmt::Debug for ExecProcess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecProcess")
            .field("id", &self.id)
            .field("command", &self.command)
            .finish_non_exhaustive()
    }
}

/// Long-lived environment shared by every session of the process.
pub trait Sandbox: Send + Sync {
    /// Bring the sandbox to [`SandboxState::Ready`].
    ///
    /// Idempotent; concurrent callers share a single provisioning run.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Sandbox`](crate::AppError::Sandbox) if any
    /// provisioning step fails.
    fn acquire(&self) -> BoxFuture<'_, Result<()>>;

    /// Launch the debug invocation described by `request`.
    ///
    /// Acquires the sandbox first if necessary.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Sandbox`](crate::AppError::Sandbox) if the
    /// sandbox is unavailable or the process cannot be started.
    fn exec(&self, request: ExecRequest) -> BoxFuture<'_, Result<ExecProcess>>;

    /// Session-level cleanup after a process's output has ended.
    fn release(&self, exec_id: &str) -> BoxFuture<'_, ()>;

    /// Remove the sandbox. Safe to call repeatedly; failures are logged.
    fn shutdown(&self) -> BoxFuture<'_, ()>;

    /// Current lifecycle position.
    fn state(&self) -> SandboxState;
}
