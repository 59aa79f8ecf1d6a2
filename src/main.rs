#![forbid(unsafe_code)]

//! `dap-bridge` — debug adapter bridge server binary.
//!
//! Loads configuration, prepares the shared Docker sandbox, serves the
//! WebSocket endpoint and removes the sandbox on the way out.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

use dap_bridge::bridge::BridgeContext;
use dap_bridge::sandbox::docker::DockerSandbox;
use dap_bridge::sandbox::Sandbox;
use dap_bridge::server;
use dap_bridge::shutdown::{install_panic_hook, prewarm, shutdown_signal, Startup, TeardownGuard};
use dap_bridge::{AppError, GlobalConfig, Result};

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "dap-bridge", about = "WebSocket to DAP debug bridge", version, long_about = None)]
struct Cli {
    /// Path to the TOML configuration file. Built-in defaults apply when omitted.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override the listen address.
    #[arg(long)]
    bind: Option<SocketAddr>,

    /// Override the workspace root that session files are written to.
    #[arg(long)]
    workspace: Option<PathBuf>,

    /// Log output format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
}

fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(args.log_format)?;
    install_panic_hook();
    info!("dap-bridge bootstrap");

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| AppError::Config(format!("failed to build tokio runtime: {err}")))?
        .block_on(run(args))
}

async fn run(args: Cli) -> Result<()> {
    let config = Arc::new(load_config(&args)?);
    info!(
        bind = %config.bind_addr,
        workspace = %config.workspace_root.display(),
        image = %config.sandbox.image,
        "configuration loaded"
    );

    let sandbox: Arc<dyn Sandbox> = Arc::new(DockerSandbox::connect(&config)?);
    let guard = TeardownGuard::new(Arc::clone(&sandbox));

    // Polled from here on so signal handlers are in place during provisioning.
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    if config.sandbox.prewarm
        && prewarm(sandbox.as_ref(), &guard, &mut shutdown).await? == Startup::Interrupted
    {
        info!("dap-bridge shut down before serving");
        return Ok(());
    }

    let ctx = Arc::new(BridgeContext::new(Arc::clone(&config), Arc::clone(&sandbox)));
    let ct = CancellationToken::new();

    let mut server_task = tokio::spawn(server::serve(ctx, config.bind_addr, ct.clone()));

    let finished = tokio::select! {
        joined = &mut server_task => Some(joined),
        () = &mut shutdown => None,
    };
    ct.cancel();

    let outcome = match finished {
        Some(joined) => joined,
        None => {
            info!("shutdown signal received");
            server_task.await
        }
    };

    guard.teardown().await;

    match outcome {
        Ok(Ok(())) => {
            info!("dap-bridge shut down");
            Ok(())
        }
        Ok(Err(err)) => {
            error!(%err, "server failed");
            Err(err)
        }
        Err(join_err) => {
            error!(%join_err, panicked = join_err.is_panic(), "server task aborted");
            Err(AppError::Transport(format!("server task failed: {join_err}")))
        }
    }
}

fn load_config(args: &Cli) -> Result<GlobalConfig> {
    let mut config = match &args.config {
        Some(path) => GlobalConfig::load_from_path(path)?,
        None => GlobalConfig::default(),
    };

    if let Some(bind) = args.bind {
        config.bind_addr = bind;
    }

    if let Some(ws) = &args.workspace {
        config.workspace_root = ws
            .canonicalize()
            .map_err(|err| AppError::Config(format!("invalid workspace override: {err}")))?;
    }

    config.validate()?;
    Ok(config)
}

fn init_tracing(log_format: LogFormat) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = fmt().with_env_filter(env_filter);

    match log_format {
        LogFormat::Text => subscriber
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
        LogFormat::Json => subscriber
            .json()
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
    }

    Ok(())
}
