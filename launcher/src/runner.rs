// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Orchestration of a single measured workload container.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::anyhow;
use cos_eventlog::{format_env_var, CosEvent, CosEventType};
use tokio_util::sync::CancellationToken;
use tpm_quote::Quoter;
use tracing::{info, warn};

use crate::agent::AttestationAgent;
use crate::error::LauncherError;
use crate::identity::PrincipalFetcher;
use crate::image;
use crate::policy::LaunchPolicy;
use crate::refresher::{RetryPolicy, TokenRefresher, HOST_TOKEN_DIR};
use crate::runtime::{
    ContainerRuntime, CreateContainerRequest, ImageHandle, Mount, Task, TaskStdio, CONTAINER_ID,
    SNAPSHOT_ID,
};
use crate::spec::LaunchSpec;
use crate::verifier::VerifierClient;

/// Mount point of the token directory inside the workload.
pub const CONTAINER_TOKEN_MOUNT_PATH: &str = "/run/container_launcher";

#[derive(Debug, Clone)]
pub struct RunnerOptions {
    /// Host directory the attestation tokens are written to.
    pub token_dir: PathBuf,
    pub retry_policy: RetryPolicy,
}

impl Default for RunnerOptions {
    fn default() -> Self {
        Self {
            token_dir: PathBuf::from(HOST_TOKEN_DIR),
            retry_policy: RetryPolicy::default(),
        }
    }
}

/// Supervises the measured workload container and its token refresher.
pub struct ContainerRunner {
    runtime: Arc<dyn ContainerRuntime>,
    launch_spec: LaunchSpec,
    agent: Arc<AttestationAgent>,
    image: ImageHandle,
    token_dir: PathBuf,
    retry_policy: RetryPolicy,
}

impl std::fmt::Debug for ContainerRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContainerRunner")
            .field("launch_spec", &self.launch_spec)
            .field("image", &self.image)
            .field("token_dir", &self.token_dir)
            .field("retry_policy", &self.retry_policy)
            .finish()
    }
}

fn format_envs(spec: &LaunchSpec) -> Result<Vec<String>, LauncherError> {
    spec.envs
        .iter()
        .map(|env| format_env_var(&env.name, &env.value).map_err(LauncherError::Spec))
        .collect()
}

impl ContainerRunner {
    /// Build the runner: pull the image, enforce the launch policy, create
    /// the container, and wire up the attestation agent.
    pub async fn new(
        runtime: Arc<dyn ContainerRuntime>,
        quoter: Box<dyn Quoter>,
        verifier: Box<dyn VerifierClient>,
        principals: Box<dyn PrincipalFetcher>,
        launch_spec: LaunchSpec,
        options: RunnerOptions,
    ) -> Result<Self, LauncherError> {
        let image = image::pull(runtime.as_ref(), &launch_spec).await?;

        let mounts = vec![Mount {
            source: options.token_dir.to_string_lossy().into_owned(),
            destination: CONTAINER_TOKEN_MOUNT_PATH.to_string(),
            read_only: true,
        }];
        let mut envs = format_envs(&launch_spec)?;

        // A stale container from a previous run holds the reserved id.
        if runtime
            .container_exists(CONTAINER_ID)
            .await
            .map_err(LauncherError::retryable)?
        {
            info!("deleting stale container {CONTAINER_ID}");
            runtime
                .delete_container(CONTAINER_ID)
                .await
                .map_err(LauncherError::retryable)?;
        }

        info!("operator input image ref   : {}", image.reference);
        info!("image digest               : {}", image.digest);
        info!("operator override env vars : {envs:?}");
        info!("operator override cmd      : {:?}", launch_spec.cmd);

        let labels = image::read_labels(runtime.as_ref(), &image).await?;
        info!("image labels               : {labels:?}");

        let policy = LaunchPolicy::from_labels(&labels)?;
        policy.verify(&launch_spec)?;

        let hostname = gethostname::gethostname()
            .into_string()
            .map_err(|_| LauncherError::retryable(anyhow!("hostname is not valid UTF-8")))?;
        envs.push(format!("HOSTNAME={hostname}"));

        let request = CreateContainerRequest {
            container_id: CONTAINER_ID.to_string(),
            snapshot_id: SNAPSHOT_ID.to_string(),
            image: image.clone(),
            cmd_override: launch_spec.cmd.clone(),
            envs,
            mounts,
            host_network: true,
        };
        if let Err(err) = runtime.create_container(request).await {
            let _ = runtime.delete_container(CONTAINER_ID).await;
            return Err(LauncherError::retryable(
                err.context("failed to create a container"),
            ));
        }

        // Args = entrypoint + cmd, so a strictly longer args list is the
        // sign the image actually has an entrypoint to extend.
        let process_spec = runtime
            .container_spec(CONTAINER_ID)
            .await
            .map_err(LauncherError::retryable)?;
        if process_spec.args.len() <= launch_spec.cmd.len() {
            let _ = runtime.delete_container(CONTAINER_ID).await;
            return Err(LauncherError::EntrypointMissing {
                args: process_spec.args.len(),
                cmd: launch_spec.cmd.len(),
            });
        }

        let agent = Arc::new(AttestationAgent::new(quoter, verifier, principals));

        Ok(Self {
            runtime,
            launch_spec,
            agent,
            image,
            token_dir: options.token_dir,
            retry_policy: options.retry_policy,
        })
    }

    /// Measure the workload's identifying claims, in the fixed order the
    /// verifier replays them: image ref, image digest, restart policy, image
    /// id, process args, process env, operator env overrides, operator arg
    /// overrides, and finally the launch separator. Nothing else may be
    /// measured between the first claim and the separator.
    async fn measure_container_claims(&self) -> Result<(), LauncherError> {
        let measure = |ty: CosEventType, content: Vec<u8>| {
            self.agent
                .measure_event(CosEvent::new(ty, content))
                .map_err(LauncherError::Attestation)
        };

        measure(CosEventType::ImageRef, self.image.reference.clone().into_bytes())?;
        measure(CosEventType::ImageDigest, self.image.digest.clone().into_bytes())?;
        measure(
            CosEventType::RestartPolicy,
            self.launch_spec.restart_policy.as_str().as_bytes().to_vec(),
        )?;
        if let Some(id) = &self.image.id {
            measure(CosEventType::ImageId, id.clone().into_bytes())?;
        }

        let process_spec = self
            .runtime
            .container_spec(CONTAINER_ID)
            .await
            .map_err(LauncherError::retryable)?;
        for arg in &process_spec.args {
            measure(CosEventType::Arg, arg.clone().into_bytes())?;
        }
        for env in &process_spec.env {
            measure(CosEventType::EnvVar, env.clone().into_bytes())?;
        }

        // Operator overrides are measured separately; they are subsets of
        // the args and env above.
        for env in format_envs(&self.launch_spec)? {
            measure(CosEventType::OverrideEnv, env.into_bytes())?;
        }
        for arg in &self.launch_spec.cmd {
            measure(CosEventType::OverrideArg, arg.clone().into_bytes())?;
        }

        self.agent
            .measure_event(CosEvent::launch_separator())
            .map_err(LauncherError::Attestation)
    }

    /// Run the workload to completion: measure claims, obtain the first
    /// token, start the task, and wait for it to exit. The refresher keeps
    /// running in the background until this returns.
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), LauncherError> {
        let run_token = cancel.child_token();
        let _stop_refresher = run_token.clone().drop_guard();

        self.measure_container_claims().await?;

        TokenRefresher::new(self.agent.clone(), self.token_dir.clone())
            .with_retry_policy(self.retry_policy.clone())
            .fetch_and_write(run_token.clone())
            .await?;

        let stdio = if self.launch_spec.log_redirect {
            info!("container stdout/stderr will be redirected");
            TaskStdio::Logged
        } else {
            info!("container stdout/stderr will not be redirected");
            TaskStdio::Discarded
        };

        let mut task = self
            .runtime
            .create_task(CONTAINER_ID, stdio)
            .await
            .map_err(LauncherError::retryable)?;

        let result = Self::run_task(task.as_mut(), &run_token).await;
        if let Err(err) = task.delete().await {
            warn!("failed to delete task: {err:#}");
        }
        result
    }

    async fn run_task(
        task: &mut dyn Task,
        cancel: &CancellationToken,
    ) -> Result<(), LauncherError> {
        // Register the exit watcher before starting, or a fast-exiting
        // workload could be missed.
        let exit_rx = task.wait().await.map_err(LauncherError::retryable)?;
        info!("workload task started");
        task.start().await.map_err(LauncherError::retryable)?;

        let status = tokio::select! {
            _ = cancel.cancelled() => {
                return Err(LauncherError::retryable(anyhow!("run canceled")));
            }
            status = exit_rx => status
                .map_err(|_| LauncherError::retryable(anyhow!("task exit channel closed")))?,
        };

        if status.code != 0 {
            warn!("workload task ended and returned non-zero");
            return Err(LauncherError::Workload { code: status.code });
        }
        info!("workload task ended and returned 0");
        Ok(())
    }

    /// Delete the container and its snapshot. Safe to call more than once.
    pub async fn close(&self) {
        if let Err(err) = self.runtime.delete_container(CONTAINER_ID).await {
            warn!("failed to delete container: {err:#}");
        }
    }
}
