//! Shared test helpers for session-level integration tests.
//!
//! Provides an in-process [`FakeSandbox`] that records launches, lets tests
//! feed debuggee output, and can stand in for the debuggee's debug port.

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::stream;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

use dap_bridge::bridge::BridgeContext;
use dap_bridge::config::{ConnectConfig, SandboxConfig};
use dap_bridge::sandbox::{
    BoxFuture, ExecProcess, ExecRequest, OutputChunk, Sandbox, SandboxState,
};
use dap_bridge::{AppError, GlobalConfig, Result};

type OutputSender = mpsc::UnboundedSender<Result<OutputChunk>>;

/// How a launched fake debuggee behaves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Debuggee {
    /// Binds the debug port and hands every accepted connection to the test.
    Listening,
    /// Never binds the debug port; output stays open until the test ends it.
    Silent,
    /// Exits immediately: the output stream ends before any port is bound.
    Exiting,
    /// The launch itself fails.
    Failing,
}

/// Sandbox double used in place of Docker.
pub struct FakeSandbox {
    mode: Debuggee,
    config: SandboxConfig,
    state: Mutex<SandboxState>,
    requests: Mutex<Vec<ExecRequest>>,
    commands: Mutex<Vec<Vec<String>>>,
    outputs: Mutex<Vec<OutputSender>>,
    released: Mutex<Vec<String>>,
    connections: mpsc::UnboundedSender<TcpStream>,
    shutdowns: AtomicUsize,
    acquire_stalls: AtomicBool,
    acquire_fails: AtomicBool,
}

impl FakeSandbox {
    /// Build a fake and the receiver of debuggee-side connections.
    pub fn new(mode: Debuggee) -> (Arc<Self>, mpsc::UnboundedReceiver<TcpStream>) {
        let (connections, accepted) = mpsc::unbounded_channel();
        let fake = Arc::new(Self {
            mode,
            config: SandboxConfig::default(),
            state: Mutex::new(SandboxState::Unprovisioned),
            requests: Mutex::new(Vec::new()),
            commands: Mutex::new(Vec::new()),
            outputs: Mutex::new(Vec::new()),
            released: Mutex::new(Vec::new()),
            connections,
            shutdowns: AtomicUsize::new(0),
            acquire_stalls: AtomicBool::new(false),
            acquire_fails: AtomicBool::new(false),
        });
        (fake, accepted)
    }

    pub fn requests(&self) -> Vec<ExecRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn commands(&self) -> Vec<Vec<String>> {
        self.commands.lock().unwrap().clone()
    }

    pub fn released(&self) -> Vec<String> {
        self.released.lock().unwrap().clone()
    }

    pub fn shutdown_count(&self) -> usize {
        self.shutdowns.load(Ordering::SeqCst)
    }

    /// Make `acquire` hang while pulling the image until it is dropped.
    pub fn stall_acquire(&self) {
        self.acquire_stalls.store(true, Ordering::SeqCst);
    }

    /// Make `acquire` fail.
    pub fn fail_acquire(&self) {
        self.acquire_fails.store(true, Ordering::SeqCst);
    }

    /// Emit a chunk on the output stream of the most recent launch.
    pub fn emit(&self, chunk: OutputChunk) {
        let outputs = self.outputs.lock().unwrap();
        outputs
            .last()
            .expect("no process launched")
            .send(Ok(chunk))
            .expect("output stream closed");
    }

    /// End the output stream of every launched process.
    pub fn finish_output(&self) {
        self.outputs.lock().unwrap().clear();
    }

    async fn launch(&self, request: ExecRequest) -> Result<ExecProcess> {
        if self.mode == Debuggee::Failing {
            return Err(AppError::Sandbox("exec refused".into()));
        }
        *self.state.lock().unwrap() = SandboxState::Ready;

        let command = self
            .config
            .render_debug_command(&request.main, request.port);
        let id = {
            let mut requests = self.requests.lock().unwrap();
            requests.push(request.clone());
            format!("exec-{}", requests.len())
        };
        self.commands.lock().unwrap().push(command.clone());

        if self.mode == Debuggee::Listening {
            let listener = TcpListener::bind(("127.0.0.1", request.port))
                .await
                .map_err(|err| AppError::Sandbox(format!("fake debuggee bind: {err}")))?;
            let connections = self.connections.clone();
            tokio::spawn(async move {
                while let Ok((stream, _)) = listener.accept().await {
                    if connections.send(stream).is_err() {
                        break;
                    }
                }
            });
        }

        let (tx, rx) = mpsc::unbounded_channel();
        if self.mode != Debuggee::Exiting {
            self.outputs.lock().unwrap().push(tx);
        }

        let output = stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        });

        Ok(ExecProcess {
            id,
            command,
            output: Box::pin(output),
        })
    }
}

impl Sandbox for FakeSandbox {
    fn acquire(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            *self.state.lock().unwrap() = SandboxState::PullingImage;
            if self.acquire_fails.load(Ordering::SeqCst) {
                return Err(AppError::Sandbox("image pull refused".into()));
            }
            if self.acquire_stalls.load(Ordering::SeqCst) {
                std::future::pending::<()>().await;
            }
            *self.state.lock().unwrap() = SandboxState::Ready;
            Ok(())
        })
    }

    fn exec(&self, request: ExecRequest) -> BoxFuture<'_, Result<ExecProcess>> {
        Box::pin(self.launch(request))
    }

    fn release(&self, exec_id: &str) -> BoxFuture<'_, ()> {
        let exec_id = exec_id.to_owned();
        Box::pin(async move {
            self.released.lock().unwrap().push(exec_id);
        })
    }

    fn shutdown(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.shutdowns.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(50)).await;
            *self.state.lock().unwrap() = SandboxState::Removed;
        })
    }

    fn state(&self) -> SandboxState {
        *self.state.lock().unwrap()
    }
}

/// Configuration rooted at `workspace_root` with fast connection retries.
pub fn test_config(workspace_root: &Path) -> GlobalConfig {
    GlobalConfig {
        workspace_root: workspace_root.canonicalize().expect("canonical workspace"),
        connect: ConnectConfig {
            attempts: 5,
            initial_backoff_ms: 10,
            max_backoff_ms: 50,
        },
        ..GlobalConfig::default()
    }
}

/// Bridge context backed by `sandbox`.
pub fn test_context(config: GlobalConfig, sandbox: Arc<FakeSandbox>) -> Arc<BridgeContext> {
    let sandbox: Arc<dyn Sandbox> = sandbox;
    Arc::new(BridgeContext::new(Arc::new(config), sandbox))
}

/// Initialization payload writing `a.js` and naming it as the entry point.
pub fn init_payload(config: &GlobalConfig) -> String {
    serde_json::json!({
        "main": config.workspace_root.join("a.js"),
        "files": { "a.js": "console.log(1)" },
    })
    .to_string()
}

/// Wait for the next value on `rx`, failing the test after two seconds.
pub async fn recv_within<T>(rx: &mut mpsc::Receiver<T>) -> T {
    tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("timed out waiting for message")
        .expect("channel closed")
}
