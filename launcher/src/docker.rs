// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Docker daemon implementation of the container runtime seam.

use anyhow::{Context, Result};
use async_trait::async_trait;
use bollard::auth::DockerCredentials;
use bollard::container::{
    Config, CreateContainerOptions, LogOutput, LogsOptions, RemoveContainerOptions,
    StartContainerOptions, WaitContainerOptions,
};
use bollard::errors::Error as DockerError;
use bollard::image::CreateImageOptions;
use bollard::models::HostConfig;
use bollard::Docker;
use futures_util::StreamExt;
use tokio::sync::oneshot;
use tracing::{info, warn};

use crate::image::MEDIA_TYPE_DOCKER_CONFIG;
use crate::runtime::{
    ContainerRuntime, CreateContainerRequest, ExitStatus, ImageConfig, ImageHandle, ProcessSpec,
    RegistryAuth, Task, TaskStdio,
};

/// Container runtime backed by the local Docker daemon.
#[derive(Debug, Clone)]
pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    pub fn connect() -> Result<Self> {
        let docker =
            Docker::connect_with_local_defaults().context("failed to connect to Docker daemon")?;
        Ok(Self { docker })
    }
}

fn is_not_found(err: &DockerError) -> bool {
    matches!(
        err,
        DockerError::DockerResponseServerError {
            status_code: 404,
            ..
        }
    )
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn pull_image(
        &self,
        image_ref: &str,
        credential: Option<RegistryAuth>,
    ) -> Result<ImageHandle> {
        let options = CreateImageOptions {
            from_image: image_ref.to_string(),
            ..Default::default()
        };
        let credentials = credential.map(|c| DockerCredentials {
            username: Some(c.username),
            password: Some(c.password),
            ..Default::default()
        });

        let mut pulling = self.docker.create_image(Some(options), None, credentials);
        while let Some(progress) = pulling.next().await {
            progress.context("image pull failed")?;
        }

        let inspect = self
            .docker
            .inspect_image(image_ref)
            .await
            .context("failed to inspect pulled image")?;
        let digest = inspect
            .repo_digests
            .unwrap_or_default()
            .first()
            .and_then(|d| d.split('@').nth(1))
            .map(str::to_string)
            .or_else(|| inspect.id.clone())
            .context("pulled image has no digest")?;

        Ok(ImageHandle {
            reference: image_ref.to_string(),
            digest,
            id: inspect.id,
        })
    }

    async fn image_config(&self, image: &ImageHandle) -> Result<ImageConfig> {
        let inspect = self
            .docker
            .inspect_image(&image.reference)
            .await
            .context("failed to inspect image")?;
        let config = inspect.config.context("image has no config")?;

        // The daemon stores legacy Docker schema-2 image configs.
        let content = serde_json::to_vec(&serde_json::json!({
            "config": {
                "Labels": config.labels,
                "Entrypoint": config.entrypoint,
                "Cmd": config.cmd,
                "Env": config.env,
            }
        }))
        .context("failed to serialize image config")?;

        Ok(ImageConfig {
            media_type: MEDIA_TYPE_DOCKER_CONFIG.to_string(),
            content,
        })
    }

    async fn container_exists(&self, container_id: &str) -> Result<bool> {
        match self.docker.inspect_container(container_id, None).await {
            Ok(_) => Ok(true),
            Err(err) if is_not_found(&err) => Ok(false),
            Err(err) => Err(err).context("failed to inspect container"),
        }
    }

    async fn delete_container(&self, container_id: &str) -> Result<()> {
        let options = RemoveContainerOptions {
            force: true,
            // Snapshot cleanup: drop the container's anonymous volumes too.
            v: true,
            ..Default::default()
        };
        match self.docker.remove_container(container_id, Some(options)).await {
            Ok(()) => Ok(()),
            Err(err) if is_not_found(&err) => Ok(()),
            Err(err) => Err(err).context("failed to remove container"),
        }
    }

    async fn create_container(&self, request: CreateContainerRequest) -> Result<()> {
        let binds: Vec<String> = request
            .mounts
            .iter()
            .map(|m| {
                let mode = if m.read_only { "ro" } else { "rw" };
                format!("{}:{}:{}", m.source, m.destination, mode)
            })
            .collect();

        let host_config = HostConfig {
            binds: Some(binds),
            network_mode: request.host_network.then(|| "host".to_string()),
            ..Default::default()
        };

        let labels = [("tee.snapshot".to_string(), request.snapshot_id.clone())]
            .into_iter()
            .collect();

        let config = Config {
            image: Some(request.image.reference.clone()),
            cmd: (!request.cmd_override.is_empty()).then(|| request.cmd_override.clone()),
            env: Some(request.envs.clone()),
            labels: Some(labels),
            host_config: Some(host_config),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: request.container_id.clone(),
            platform: None,
        };
        self.docker
            .create_container(Some(options), config)
            .await
            .context("failed to create container")?;
        Ok(())
    }

    async fn container_spec(&self, container_id: &str) -> Result<ProcessSpec> {
        let inspect = self
            .docker
            .inspect_container(container_id, None)
            .await
            .context("failed to inspect container")?;
        let config = inspect.config.context("container has no config")?;

        let mut args = config.entrypoint.unwrap_or_default();
        args.extend(config.cmd.unwrap_or_default());

        Ok(ProcessSpec {
            args,
            env: config.env.unwrap_or_default(),
        })
    }

    async fn create_task(&self, container_id: &str, stdio: TaskStdio) -> Result<Box<dyn Task>> {
        Ok(Box::new(DockerTask {
            docker: self.docker.clone(),
            container_id: container_id.to_string(),
            stdio,
            log_task: None,
        }))
    }
}

/// A task over a created Docker container. Starting the task starts the
/// container; deleting the task stops it but leaves the container for
/// [`ContainerRuntime::delete_container`].
struct DockerTask {
    docker: Docker,
    container_id: String,
    stdio: TaskStdio,
    log_task: Option<tokio::task::JoinHandle<()>>,
}

#[async_trait]
impl Task for DockerTask {
    async fn wait(&mut self) -> Result<oneshot::Receiver<ExitStatus>> {
        let (tx, rx) = oneshot::channel();
        let docker = self.docker.clone();
        let container_id = self.container_id.clone();
        tokio::spawn(async move {
            let mut waiting = docker.wait_container(
                &container_id,
                Some(WaitContainerOptions {
                    condition: "next-exit",
                }),
            );
            let status = match waiting.next().await {
                Some(Ok(response)) => ExitStatus {
                    code: response.status_code,
                },
                // The daemon reports a non-zero exit as a wait error.
                Some(Err(DockerError::DockerContainerWaitError { code, .. })) => {
                    ExitStatus { code }
                }
                Some(Err(err)) => {
                    warn!("container wait failed: {err}");
                    return;
                }
                None => {
                    warn!("container wait stream ended unexpectedly");
                    return;
                }
            };
            let _ = tx.send(status);
        });
        // Let the watcher issue its request before the caller starts the task.
        tokio::task::yield_now().await;
        Ok(rx)
    }

    async fn start(&mut self) -> Result<()> {
        self.docker
            .start_container(&self.container_id, None::<StartContainerOptions<String>>)
            .await
            .context("failed to start container task")?;

        if self.stdio == TaskStdio::Logged {
            let docker = self.docker.clone();
            let container_id = self.container_id.clone();
            self.log_task = Some(tokio::spawn(async move {
                let mut logs = docker.logs(
                    &container_id,
                    Some(LogsOptions::<String> {
                        follow: true,
                        stdout: true,
                        stderr: true,
                        ..Default::default()
                    }),
                );
                while let Some(entry) = logs.next().await {
                    match entry {
                        Ok(LogOutput::StdOut { message }) | Ok(LogOutput::StdErr { message }) => {
                            info!(target: "workload", "{}", String::from_utf8_lossy(&message).trim_end());
                        }
                        Ok(_) => {}
                        Err(err) => {
                            warn!("workload log stream failed: {err}");
                            break;
                        }
                    }
                }
            }));
        }
        Ok(())
    }

    async fn delete(&mut self) -> Result<()> {
        if let Some(log_task) = self.log_task.take() {
            log_task.abort();
        }
        match self.docker.stop_container(&self.container_id, None).await {
            Ok(()) => Ok(()),
            Err(err) if is_not_found(&err) => Ok(()),
            Err(err) => Err(err).context("failed to stop container task"),
        }
    }
}
