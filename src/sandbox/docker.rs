//! Docker-backed sandbox.
//!
//! One named container per bridge process, created from the configured base
//! image with host networking (so debuggees bind ports directly on the host
//! loopback) and the workspace root bind-mounted. The container idles on
//! `sleep infinity`; every session runs as a separate exec instance.

use std::path::PathBuf;
use std::sync::{Mutex, PoisonError};

use bollard::container::{
    Config, CreateContainerOptions, LogOutput, RemoveContainerOptions, StartContainerOptions,
};
use bollard::errors::Error as BollardError;
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::image::CreateImageOptions;
use bollard::models::HostConfig;
use bollard::{Docker, API_DEFAULT_VERSION};
use futures_util::StreamExt;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use super::{BoxFuture, ExecProcess, ExecRequest, OutputChunk, Sandbox, SandboxState};
use crate::config::{GlobalConfig, SandboxConfig};
use crate::{AppError, Result};

/// Timeout applied to Docker API calls over an explicit socket.
const DOCKER_TIMEOUT_SECS: u64 = 120;

/// Entrypoint that keeps the container alive between execs.
const IDLE_ENTRYPOINT: [&str; 2] = ["sleep", "infinity"];

/// Shared Docker container hosting every debuggee of this process.
pub struct DockerSandbox {
    docker: Docker,
    config: SandboxConfig,
    host_workspace: PathBuf,
    mount_path: PathBuf,
    ready: OnceCell<()>,
    state: Mutex<SandboxState>,
}

impl std::fmt::Debug for DockerSandbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DockerSandbox")
            .field("container", &self.config.container_name)
            .field("image", &self.config.image)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl DockerSandbox {
    /// Build a sandbox client from the global configuration.
    ///
    /// No Docker API call is made until the sandbox is acquired.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Sandbox` if the Docker client cannot be created.
    pub fn connect(config: &GlobalConfig) -> Result<Self> {
        let docker = match config.sandbox.docker_socket.as_deref() {
            Some(socket) => {
                Docker::connect_with_socket(socket, DOCKER_TIMEOUT_SECS, API_DEFAULT_VERSION)
            }
            None => Docker::connect_with_local_defaults(),
        }
        .map_err(|err| AppError::Sandbox(format!("failed to create docker client: {err}")))?;

        Ok(Self {
            docker,
            config: config.sandbox.clone(),
            host_workspace: config.workspace_root.clone(),
            mount_path: config.container_mount_path().to_path_buf(),
            ready: OnceCell::new(),
            state: Mutex::new(SandboxState::Unprovisioned),
        })
    }

    fn set_state(&self, next: SandboxState) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        debug!(from = ?*state, to = ?next, "sandbox state transition");
        *state = next;
    }

    fn container(&self) -> &str {
        &self.config.container_name
    }

    async fn provision(&self) -> Result<()> {
        self.set_state(SandboxState::PullingImage);
        self.pull_image().await?;

        // A container left behind by a crashed predecessor would block creation.
        self.remove_container().await?;

        self.create_container().await?;
        self.set_state(SandboxState::Created);

        self.docker
            .start_container(self.container(), None::<StartContainerOptions<String>>)
            .await
            .map_err(|err| operation_error("start_container", self.container(), &err))?;
        self.set_state(SandboxState::Started);
        info!(container = self.container(), "sandbox container started");

        self.install_runtime().await?;
        self.set_state(SandboxState::Ready);
        info!(container = self.container(), "sandbox ready");
        Ok(())
    }

    async fn pull_image(&self) -> Result<()> {
        let (from_image, tag) = split_image_reference(&self.config.image);
        info!(image = %self.config.image, "pulling sandbox image");

        let mut progress = self.docker.create_image(
            Some(CreateImageOptions::<String> {
                from_image: from_image.to_owned(),
                tag: tag.to_owned(),
                ..Default::default()
            }),
            None,
            None,
        );

        while let Some(update) = progress.next().await {
            let update =
                update.map_err(|err| operation_error("pull_image", &self.config.image, &err))?;
            if let Some(error) = update.error {
                return Err(AppError::Sandbox(format!(
                    "pull_image {}: {error}",
                    self.config.image
                )));
            }
            if let Some(status) = update.status {
                debug!(
                    image = %self.config.image,
                    status = %status,
                    progress = update.progress.as_deref().unwrap_or_default(),
                    "image pull progress"
                );
            }
        }

        info!(image = %self.config.image, "sandbox image pulled");
        Ok(())
    }

    async fn create_container(&self) -> Result<()> {
        let bind = format!(
            "{}:{}",
            self.host_workspace.display(),
            self.mount_path.display()
        );

        let config = Config::<String> {
            image: Some(self.config.image.clone()),
            entrypoint: Some(IDLE_ENTRYPOINT.iter().map(|s| (*s).to_owned()).collect()),
            working_dir: Some(self.mount_path.to_string_lossy().into_owned()),
            host_config: Some(HostConfig {
                network_mode: Some("host".to_owned()),
                binds: Some(vec![bind]),
                auto_remove: Some(true),
                ..HostConfig::default()
            }),
            ..Config::default()
        };

        self.docker
            .create_container(
                Some(CreateContainerOptions {
                    name: self.container().to_owned(),
                    platform: None,
                }),
                config,
            )
            .await
            .map_err(|err| operation_error("create_container", self.container(), &err))?;
        info!(container = self.container(), "sandbox container created");
        Ok(())
    }

    async fn install_runtime(&self) -> Result<()> {
        if self.config.provision_command.is_empty() {
            debug!("no provision command configured");
            return Ok(());
        }

        info!(command = ?self.config.provision_command, "installing debuggee runtime");
        let mut process = self
            .start_exec(self.config.provision_command.clone())
            .await?;

        while let Some(chunk) = process.output.next().await {
            let chunk = chunk?;
            debug!(category = ?chunk.category, output = %chunk.text().trim_end(), "provision output");
        }

        match self.exit_code(&process.id).await? {
            Some(0) => Ok(()),
            Some(code) => Err(AppError::Sandbox(format!(
                "runtime provisioning exited with code {code}"
            ))),
            None => Err(AppError::Sandbox(
                "runtime provisioning finished without an exit code".into(),
            )),
        }
    }

    async fn start_exec(&self, command: Vec<String>) -> Result<ExecProcess> {
        let created = self
            .docker
            .create_exec(
                self.container(),
                CreateExecOptions::<String> {
                    cmd: Some(command.clone()),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    working_dir: Some(self.mount_path.to_string_lossy().into_owned()),
                    ..Default::default()
                },
            )
            .await
            .map_err(|err| operation_error("create_exec", self.container(), &err))?;

        let started = self
            .docker
            .start_exec(&created.id, None)
            .await
            .map_err(|err| operation_error("start_exec", self.container(), &err))?;

        let StartExecResults::Attached { output, .. } = started else {
            return Err(AppError::Sandbox(format!(
                "exec {} started detached; output is unavailable",
                created.id
            )));
        };

        let output = output.filter_map(|item| std::future::ready(demux_log_output(item)));

        Ok(ExecProcess {
            id: created.id,
            command,
            output: Box::pin(output),
        })
    }

    async fn exit_code(&self, exec_id: &str) -> Result<Option<i64>> {
        let inspected = self
            .docker
            .inspect_exec(exec_id)
            .await
            .map_err(|err| operation_error("inspect_exec", exec_id, &err))?;
        Ok(inspected.exit_code)
    }

    async fn remove_container(&self) -> Result<()> {
        match self
            .docker
            .remove_container(
                self.container(),
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
        {
            Ok(()) => {
                debug!(container = self.container(), "container removed");
                Ok(())
            }
            Err(err) if is_not_found(&err) => Ok(()),
            Err(err) => Err(operation_error("remove_container", self.container(), &err)),
        }
    }
}

impl Sandbox for DockerSandbox {
    fn acquire(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.ready
                .get_or_try_init(|| self.provision())
                .await
                .map(|&()| ())
        })
    }

    fn exec(&self, request: ExecRequest) -> BoxFuture<'_, Result<ExecProcess>> {
        Box::pin(async move {
            self.acquire().await?;
            let command = self.config.render_debug_command(&request.main, request.port);
            info!(port = request.port, main = %request.main, ?command, "launching debuggee");
            self.start_exec(command).await
        })
    }

    fn release(&self, exec_id: &str) -> BoxFuture<'_, ()> {
        let exec_id = exec_id.to_owned();
        Box::pin(async move {
            match self.exit_code(&exec_id).await {
                Ok(code) => info!(exec_id = %exec_id, exit_code = ?code, "debuggee exited"),
                Err(err) => debug!(exec_id = %exec_id, %err, "could not inspect finished exec"),
            }
        })
    }

    fn shutdown(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            info!(container = self.container(), "removing sandbox container");
            match self.remove_container().await {
                Ok(()) => self.set_state(SandboxState::Removed),
                Err(err) => warn!(%err, "sandbox teardown failed"),
            }
        })
    }

    fn state(&self) -> SandboxState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Map one multiplexed log frame to a tagged output chunk.
///
/// Console frames (TTY mode) count as stdout; stdin echoes are dropped.
#[must_use]
pub fn demux_log_output(
    item: std::result::Result<LogOutput, BollardError>,
) -> Option<Result<OutputChunk>> {
    match item {
        Ok(LogOutput::StdOut { message } | LogOutput::Console { message }) => {
            Some(Ok(OutputChunk::stdout(message)))
        }
        Ok(LogOutput::StdErr { message }) => Some(Ok(OutputChunk::stderr(message))),
        Ok(LogOutput::StdIn { .. }) => None,
        Err(err) => Some(Err(AppError::Sandbox(format!("exec stream failed: {err}")))),
    }
}

/// Split `name[:tag]` into image and tag, defaulting the tag to `latest`.
///
/// A colon inside a registry host (`host:5000/image`) is not a tag separator.
#[must_use]
pub fn split_image_reference(image: &str) -> (&str, &str) {
    match image.rsplit_once(':') {
        Some((name, tag)) if !tag.contains('/') => (name, tag),
        _ => (image, "latest"),
    }
}

fn is_not_found(err: &BollardError) -> bool {
    matches!(
        err,
        BollardError::DockerResponseServerError {
            status_code: 404,
            ..
        }
    )
}

fn operation_error(operation: &str, target: &str, err: &BollardError) -> AppError {
    AppError::Sandbox(format!("{operation} {target}: {err}"))
}
