//! Per-connection debug session.
//!
//! A [`SessionBridge`] moves through
//! `Uninitialized → Initializing → Bridged → Closed` and never returns to
//! `Uninitialized`. The first client message is the initialization payload;
//! every later message is relayed verbatim to the debuggee once bridged.
//!
//! The state leaves `Uninitialized` before the initialization work starts.
//! If that work fails the session stays in `Initializing` and ignores all
//! further client messages.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use futures_util::StreamExt;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::BridgeContext;
use crate::dap::{MessageFramer, OutputEvent};
use crate::sandbox::{ExecProcess, ExecRequest, Sandbox};
use crate::workspace;
use crate::{AppError, Result};

/// Lifecycle position of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeState {
    /// Waiting for the initialization payload.
    Uninitialized,
    /// Initialization started (and possibly failed).
    Initializing,
    /// Debuggee connected; client messages are relayed.
    Bridged,
    /// Connection or debuggee gone.
    Closed,
}

/// First client message: entry point plus the files to materialize.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct InitPayload {
    /// Entry file path, as seen on the bridge host.
    pub main: String,
    /// Relative path → file content.
    #[serde(default)]
    pub files: BTreeMap<String, String>,
}

impl InitPayload {
    /// Parse the initialization payload.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Init` if `text` is not a valid payload.
    pub fn parse(text: &str) -> Result<Self> {
        serde_json::from_str(text)
            .map_err(|err| AppError::Init(format!("invalid initialization payload: {err}")))
    }
}

/// Orchestrates one client connection and its debuggee.
pub struct SessionBridge {
    id: String,
    ctx: Arc<BridgeContext>,
    state: BridgeState,
    framer: MessageFramer,
    port: Option<u16>,
    exec_id: Option<String>,
    outbound: mpsc::Sender<String>,
    close: CancellationToken,
    pump: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for SessionBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionBridge")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("port", &self.port)
            .field("exec_id", &self.exec_id)
            .finish_non_exhaustive()
    }
}

impl SessionBridge {
    /// Create a session writing client-bound frames to `outbound`.
    ///
    /// `close` is cancelled when the debuggee's output ends; the connection
    /// handler treats that as a request to close the client connection.
    #[must_use]
    pub fn new(
        id: impl Into<String>,
        ctx: Arc<BridgeContext>,
        outbound: mpsc::Sender<String>,
        close: CancellationToken,
    ) -> Self {
        Self {
            id: id.into(),
            framer: MessageFramer::new(outbound.clone()),
            ctx,
            state: BridgeState::Uninitialized,
            port: None,
            exec_id: None,
            outbound,
            close,
            pump: None,
        }
    }

    /// Session identifier used in logs.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Current lifecycle position.
    #[must_use]
    pub fn state(&self) -> BridgeState {
        self.state
    }

    /// Debug port allocated for this session, once initialization got that far.
    #[must_use]
    pub fn port(&self) -> Option<u16> {
        self.port
    }

    /// Handle one inbound client text frame.
    ///
    /// # Errors
    ///
    /// Returns the initialization error for a failed first message, or
    /// `AppError::Transport` if relaying to the debuggee fails.
    pub async fn handle_message(&mut self, text: String) -> Result<()> {
        match self.state {
            BridgeState::Uninitialized => {
                self.state = BridgeState::Initializing;
                if let Err(err) = self.initialize(&text).await {
                    error!(session_id = %self.id, %err, "session initialization failed");
                    return Err(err);
                }
                self.state = BridgeState::Bridged;
                info!(session_id = %self.id, port = ?self.port, "session bridged");
                Ok(())
            }
            BridgeState::Initializing => {
                warn!(
                    session_id = %self.id,
                    "dropping message for session whose initialization failed"
                );
                Ok(())
            }
            BridgeState::Bridged => self.framer.send_message(&text).await,
            BridgeState::Closed => {
                debug!(session_id = %self.id, "dropping message for closed session");
                Ok(())
            }
        }
    }

    async fn initialize(&mut self, text: &str) -> Result<()> {
        let payload = InitPayload::parse(text)?;

        let written =
            workspace::write_files(self.ctx.config.workspace_root.clone(), payload.files).await?;
        debug!(session_id = %self.id, files = written.len(), "session files written");

        let port = self.ctx.ports.allocate().await?;
        self.port = Some(port);

        let main = self
            .ctx
            .config
            .container_path(Path::new(&payload.main))
            .to_string_lossy()
            .into_owned();
        let process = self.ctx.sandbox.exec(ExecRequest { main, port }).await?;
        info!(session_id = %self.id, port, exec_id = %process.id, "debuggee launched");

        self.exec_id = Some(process.id.clone());
        self.pump = Some(tokio::spawn(pump_output(
            self.id.clone(),
            process,
            self.outbound.clone(),
            Arc::clone(&self.ctx.sandbox),
            self.close.clone(),
        )));

        let close = self.close.clone();
        tokio::select! {
            connected = self.framer.connect_with_retry(port, &self.ctx.config.connect) => connected,
            () = close.cancelled() => Err(AppError::Transport(
                "debuggee exited before its debug port became reachable".into(),
            )),
        }
    }

    /// Tear down the session: stop relaying, release the port, stop the
    /// output pump. Idempotent.
    pub fn close(&mut self) {
        if self.state == BridgeState::Closed {
            return;
        }
        self.state = BridgeState::Closed;
        self.close.cancel();
        self.framer.close();
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
        if let Some(port) = self.port {
            self.ctx.ports.release(port);
        }
        info!(session_id = %self.id, "session closed");
    }
}

impl Drop for SessionBridge {
    fn drop(&mut self) {
        self.close();
    }
}

/// Forward debuggee output to the client as `output` events until the
/// process's output ends, then request the client connection be closed.
async fn pump_output(
    session_id: String,
    process: ExecProcess,
    outbound: mpsc::Sender<String>,
    sandbox: Arc<dyn Sandbox>,
    close: CancellationToken,
) {
    let ExecProcess {
        id: exec_id,
        mut output,
        ..
    } = process;

    while let Some(chunk) = output.next().await {
        match chunk {
            Ok(chunk) => {
                let event = OutputEvent::new(chunk.category, chunk.text());
                if outbound.send(event.to_json()).await.is_err() {
                    debug!(session_id = %session_id, "client gone, stopping output pump");
                    break;
                }
            }
            Err(err) => {
                warn!(session_id = %session_id, %err, "debuggee output stream failed");
                break;
            }
        }
    }

    debug!(session_id = %session_id, exec_id = %exec_id, "debuggee output ended");
    sandbox.release(&exec_id).await;
    close.cancel();
}
