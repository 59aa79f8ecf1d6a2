//! Process-level teardown.
//!
//! The sandbox must be removed exactly once no matter which exit path runs
//! first: an interrupt or termination signal, a user signal, normal server
//! completion, or a panic in the server task. Signals arriving while the
//! sandbox is still being provisioned at startup count too.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::OnceCell;
use tracing::{error, info, warn};

use crate::sandbox::Sandbox;
use crate::Result;

/// Resolve once the process receives SIGINT, SIGTERM, SIGUSR1 or SIGUSR2.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(%err, "ctrl-c signal handler failed");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let wait_for = |kind: SignalKind, name: &'static str| async move {
            match signal(kind) {
                Ok(mut stream) => {
                    stream.recv().await;
                    info!(signal = name, "signal received");
                }
                Err(err) => {
                    warn!(%err, signal = name, "failed to register signal handler");
                    std::future::pending::<()>().await;
                }
            }
        };

        tokio::select! {
            () = ctrl_c => info!(signal = "SIGINT", "signal received"),
            () = wait_for(SignalKind::terminate(), "SIGTERM") => {}
            () = wait_for(SignalKind::user_defined1(), "SIGUSR1") => {}
            () = wait_for(SignalKind::user_defined2(), "SIGUSR2") => {}
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await;
        info!(signal = "ctrl-c", "signal received");
    }
}

/// Single-flight sandbox teardown.
///
/// Concurrent callers of [`TeardownGuard::teardown`] all wait for the one
/// in-flight removal; later callers return immediately.
pub struct TeardownGuard {
    sandbox: Arc<dyn Sandbox>,
    done: OnceCell<()>,
}

impl std::fmt::Debug for TeardownGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TeardownGuard")
            .field("sandbox_state", &self.sandbox.state())
            .field("done", &self.has_run())
            .finish()
    }
}

impl TeardownGuard {
    /// Guard the teardown of `sandbox`.
    #[must_use]
    pub fn new(sandbox: Arc<dyn Sandbox>) -> Self {
        Self {
            sandbox,
            done: OnceCell::new(),
        }
    }

    /// Remove the sandbox if no other caller has done so yet.
    pub async fn teardown(&self) {
        self.done
            .get_or_init(|| async {
                info!("tearing down sandbox");
                self.sandbox.shutdown().await;
            })
            .await;
    }

    /// Whether the teardown has completed.
    #[must_use]
    pub fn has_run(&self) -> bool {
        self.done.initialized()
    }
}

/// How startup provisioning ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Startup {
    /// The sandbox is ready; start serving.
    Ready,
    /// `shutdown` fired first; the sandbox has been torn down.
    Interrupted,
}

/// Bring the sandbox up while watching `shutdown`.
///
/// Pass the process's long-lived shutdown future (pinned, by `&mut`) so
/// that its signal handlers are installed before provisioning begins and
/// stay installed afterwards. If it resolves first, provisioning is
/// abandoned and the sandbox is torn down through `guard`.
///
/// # Errors
///
/// Returns the provisioning error after tearing the sandbox down.
pub async fn prewarm<F>(sandbox: &dyn Sandbox, guard: &TeardownGuard, shutdown: F) -> Result<Startup>
where
    F: Future<Output = ()>,
{
    tokio::select! {
        acquired = sandbox.acquire() => match acquired {
            Ok(()) => Ok(Startup::Ready),
            Err(err) => {
                error!(%err, "sandbox provisioning failed");
                guard.teardown().await;
                Err(err)
            }
        },
        () = shutdown => {
            info!("shutdown requested while provisioning the sandbox");
            guard.teardown().await;
            Ok(Startup::Interrupted)
        }
    }
}

/// Route panic reports through tracing so they reach the configured sink.
///
/// The previous hook still runs afterwards.
pub fn install_panic_hook() {
    let previous = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        let location = panic_info
            .location()
            .map(|loc| format!("{}:{}", loc.file(), loc.line()));
        let payload = panic_info
            .payload()
            .downcast_ref::<&str>()
            .map(|s| (*s).to_owned())
            .or_else(|| panic_info.payload().downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "<non-string panic payload>".to_owned());
        error!(location = ?location, %payload, "panic");
        previous(panic_info);
    }));
}
