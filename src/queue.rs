//! Strictly ordered execution of an async handler.
//!
//! [`SequentialQueue`] owns a worker task that runs one handler invocation
//! at a time in the order calls were made. A call is enqueued the moment
//! [`SequentialQueue::call`] returns, so ordering does not depend on when
//! the returned future is first polled.

use std::future::Future;

use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use crate::{AppError, Result};

type Job<T, O> = (T, oneshot::Sender<Result<O>>);

/// FIFO wrapper around an async handler.
pub struct SequentialQueue<T, O> {
    tx: mpsc::UnboundedSender<Job<T, O>>,
}

impl<T, O> Clone for SequentialQueue<T, O> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<T, O> std::fmt::Debug for SequentialQueue<T, O> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SequentialQueue")
            .field("closed", &self.tx.is_closed())
            .finish()
    }
}

impl<T, O> SequentialQueue<T, O>
where
    T: Send + 'static,
    O: Send + 'static,
{
    /// Spawn the worker for `handler`.
    ///
    /// Each invocation starts only after the previous one settled. An
    /// invocation that returns `Err` or panics does not stop the worker.
    ///
    /// Must be called from within a tokio runtime.
    pub fn wrap<F, Fut>(handler: F) -> Self
    where
        F: Fn(T) -> Fut + Send + 'static,
        Fut: Future<Output = Result<O>> + Send + 'static,
    {
        let (tx, mut rx) = mpsc::unbounded_channel::<Job<T, O>>();

        tokio::spawn(async move {
            while let Some((arg, reply)) = rx.recv().await {
                // Running the invocation as its own task contains panics.
                let outcome = match tokio::spawn(handler(arg)).await {
                    Ok(result) => result,
                    Err(err) => Err(AppError::Queue(format!("handler did not complete: {err}"))),
                };
                if reply.send(outcome).is_err() {
                    debug!("sequential queue: caller dropped before completion");
                }
            }
            debug!("sequential queue: all handles dropped, worker exiting");
        });

        Self { tx }
    }

    /// Enqueue `arg` and wait for its invocation to settle.
    ///
    /// The returned future yields exactly what the handler returned.
    ///
    /// # Errors
    ///
    /// Passes through the handler's error. Returns `AppError::Queue` if the
    /// handler panicked or the worker is gone.
    pub fn call(&self, arg: T) -> impl Future<Output = Result<O>> + Send + 'static {
        let (reply_tx, reply_rx) = oneshot::channel();
        let enqueued = self
            .tx
            .send((arg, reply_tx))
            .map_err(|_| AppError::Queue("queue worker has stopped".into()));

        async move {
            enqueued?;
            reply_rx
                .await
                .map_err(|_| AppError::Queue("queue worker dropped the job".into()))?
        }
    }
}
