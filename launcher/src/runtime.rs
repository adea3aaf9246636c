// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Seam for the container runtime daemon.
//!
//! The launcher treats the runtime as an opaque service with image pull,
//! container, and task operations. The production implementation talks to
//! the local Docker daemon (see [`crate::docker`]); tests drive an in-memory
//! fake.

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::oneshot;

/// Reserved container identity. One workload per VM, so a deterministic id
/// is fine; a stale container with this id is destroyed at construction.
pub const CONTAINER_ID: &str = "tee-container";
/// Reserved snapshot identity.
pub const SNAPSHOT_ID: &str = "tee-snapshot";

/// Opaque reference to a pulled, unpacked image.
#[derive(Debug, Clone)]
pub struct ImageHandle {
    /// The registry reference the image was pulled by.
    pub reference: String,
    /// Content digest of the image manifest.
    pub digest: String,
    /// Image config digest (the image ID), when the runtime exposes it.
    pub id: Option<String>,
}

/// Raw image config blob with its media type.
#[derive(Debug, Clone)]
pub struct ImageConfig {
    pub media_type: String,
    pub content: Vec<u8>,
}

/// Registry credential for authenticated pulls.
#[derive(Debug, Clone)]
pub struct RegistryAuth {
    pub username: String,
    pub password: String,
}

/// A bind mount from the host into the container.
#[derive(Debug, Clone)]
pub struct Mount {
    pub source: String,
    pub destination: String,
    pub read_only: bool,
}

/// Where the task's stdout/stderr go.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStdio {
    /// Forward container output into the launcher's log stream.
    Logged,
    /// Drop container output.
    Discarded,
}

#[derive(Debug, Clone)]
pub struct CreateContainerRequest {
    pub container_id: String,
    pub snapshot_id: String,
    pub image: ImageHandle,
    /// Operator Cmd override; empty means the image's own Cmd.
    pub cmd_override: Vec<String>,
    /// Extra environment in `KEY=VALUE` form.
    pub envs: Vec<String>,
    pub mounts: Vec<Mount>,
    /// Use the host network namespace, hosts file, and resolv.conf.
    pub host_network: bool,
}

/// The process spec the runtime generated for a container:
/// args = image entrypoint + (Cmd override or image Cmd).
#[derive(Debug, Clone)]
pub struct ProcessSpec {
    pub args: Vec<String>,
    pub env: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitStatus {
    pub code: i64,
}

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Pull and unpack an image, optionally with a registry credential.
    async fn pull_image(
        &self,
        image_ref: &str,
        credential: Option<RegistryAuth>,
    ) -> Result<ImageHandle>;

    /// Read the image's config blob.
    async fn image_config(&self, image: &ImageHandle) -> Result<ImageConfig>;

    async fn container_exists(&self, container_id: &str) -> Result<bool>;

    /// Delete a container and clean up its snapshot. Deleting a container
    /// that does not exist is not an error.
    async fn delete_container(&self, container_id: &str) -> Result<()>;

    async fn create_container(&self, request: CreateContainerRequest) -> Result<()>;

    /// The process spec the runtime generated for the container.
    async fn container_spec(&self, container_id: &str) -> Result<ProcessSpec>;

    async fn create_task(&self, container_id: &str, stdio: TaskStdio) -> Result<Box<dyn Task>>;
}

/// A created (not necessarily started) container task.
#[async_trait]
pub trait Task: Send {
    /// Register the exit watcher. Must be called before [`Task::start`] so
    /// the exit of a short-lived task cannot be missed.
    async fn wait(&mut self) -> Result<oneshot::Receiver<ExitStatus>>;

    async fn start(&mut self) -> Result<()>;

    /// Tear the task down. Safe to call whether or not the task ran.
    async fn delete(&mut self) -> Result<()>;
}
