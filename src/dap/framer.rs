//! Debuggee connection: framed reads into a channel, framed writes on demand.
//!
//! A [`MessageFramer`] owns one TCP connection to a debuggee's debug port.
//! Inbound bytes are decoded by a dedicated reader task driving
//! [`FramedRead`] over [`DapCodec`]; each decoded body is pushed into the
//! `on_message` channel in receipt order. Outbound payloads are framed by
//! [`FramedWrite`] on the caller's task.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ConnectConfig;
use crate::dap::codec::DapCodec;
use crate::{AppError, Result};

type BoxedWrite = WriteHalf<Box<dyn DuplexStream>>;

/// Byte stream usable as a debuggee connection.
pub trait DuplexStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> DuplexStream for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

/// `Content-Length` framed connection to a debuggee.
pub struct MessageFramer {
    on_message: mpsc::Sender<String>,
    writer: Option<FramedWrite<BoxedWrite, DapCodec>>,
    reader: Option<JoinHandle<()>>,
    cancel: CancellationToken,
}

impl std::fmt::Debug for MessageFramer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageFramer")
            .field("connected", &self.is_connected())
            .finish_non_exhaustive()
    }
}

impl MessageFramer {
    /// Create an unconnected framer delivering decoded bodies to `on_message`.
    #[must_use]
    pub fn new(on_message: mpsc::Sender<String>) -> Self {
        Self {
            on_message,
            writer: None,
            reader: None,
            cancel: CancellationToken::new(),
        }
    }

    /// Whether a stream is attached.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.writer.is_some()
    }

    /// Open a TCP connection to a debuggee listening on `127.0.0.1:port`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Transport` if the connection is refused or fails.
    pub async fn connect(&mut self, port: u16) -> Result<()> {
        let stream = TcpStream::connect(("127.0.0.1", port))
            .await
            .map_err(|err| AppError::Transport(format!("connect to port {port} failed: {err}")))?;
        if let Err(err) = stream.set_nodelay(true) {
            debug!(port, %err, "failed to set TCP_NODELAY on debuggee socket");
        }
        self.attach(stream);
        info!(port, "connected to debuggee");
        Ok(())
    }

    /// Connect to `port`, retrying with exponential backoff while the
    /// debuggee is still binding its debug port.
    ///
    /// # Errors
    ///
    /// Returns the last `AppError::Transport` once `policy.attempts`
    /// attempts have failed.
    pub async fn connect_with_retry(&mut self, port: u16, policy: &ConnectConfig) -> Result<()> {
        let mut delay = policy.initial_backoff();
        let mut attempt = 1;
        loop {
            match self.connect(port).await {
                Ok(()) => return Ok(()),
                Err(err) if attempt >= policy.attempts => {
                    warn!(port, attempt, %err, "debuggee never became reachable");
                    return Err(err);
                }
                Err(err) => {
                    debug!(port, attempt, ?delay, %err, "debuggee not ready, retrying");
                }
            }
            tokio::time::sleep(delay).await;
            delay = next_backoff(delay, policy.max_backoff());
            attempt += 1;
        }
    }

    /// Start framing over an already-connected stream.
    ///
    /// Any previously attached stream is closed first.
    pub fn attach<S>(&mut self, stream: S)
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        self.close();
        self.cancel = CancellationToken::new();

        let boxed: Box<dyn DuplexStream> = Box::new(stream);
        let (read_half, write_half) = tokio::io::split(boxed);

        self.writer = Some(FramedWrite::new(write_half, DapCodec::new()));
        self.reader = Some(tokio::spawn(run_reader(
            read_half,
            self.on_message.clone(),
            self.cancel.clone(),
        )));
    }

    /// Frame `payload` and write it to the debuggee.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Framing` if `payload` exceeds the body limit and
    /// `AppError::Transport` if no stream is attached or the write fails.
    pub async fn send_message(&mut self, payload: &str) -> Result<()> {
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| AppError::Transport("framer is not connected".into()))?;
        writer.send(payload).await.map_err(|err| match err {
            AppError::Framing(_) => err,
            other => AppError::Transport(format!("debuggee write failed: {other}")),
        })
    }

    /// Stop the reader task and drop the write half.
    pub fn close(&mut self) {
        self.cancel.cancel();
        self.writer = None;
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }
}

impl Drop for MessageFramer {
    fn drop(&mut self) {
        self.close();
    }
}

/// Double `current`, capped at `max`.
#[must_use]
pub fn next_backoff(current: Duration, max: Duration) -> Duration {
    current.saturating_mul(2).min(max)
}

/// Reader task: decode bodies from `stream` and forward them to `on_message`.
async fn run_reader<R>(stream: R, on_message: mpsc::Sender<String>, cancel: CancellationToken)
where
    R: AsyncRead + Unpin + Send,
{
    let mut framed = FramedRead::new(stream, DapCodec::new());

    loop {
        tokio::select! {
            biased;

            () = cancel.cancelled() => {
                debug!("dap reader: cancellation received, stopping");
                break;
            }

            item = framed.next() => {
                match item {
                    None => {
                        debug!("dap reader: debuggee closed the connection");
                        break;
                    }
                    Some(Err(err)) => {
                        warn!(%err, "dap reader: read error, stopping");
                        break;
                    }
                    Some(Ok(body)) => {
                        if on_message.send(body).await.is_err() {
                            debug!("dap reader: on_message closed, stopping");
                            break;
                        }
                    }
                }
            }
        }
    }
}
