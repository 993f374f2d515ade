//! Engine capabilities the CRI server delegates to.
//!
//! The server owns no sandbox, container or image state. It validates a
//! request, calls one of these capabilities and translates the result.
//! Implementations must be safe to call concurrently: the transport runs
//! one handler per inbound call.

use std::time::Duration;

use async_trait::async_trait;

use machined_core::error::Result;
use machined_core::exec::ExecOutput;

use crate::cri_api::{
    AttachRequest, AttachResponse, AuthConfig, Container, ContainerConfig, ContainerFilter,
    ContainerStatus, ExecRequest, ExecResponse, Image, ImageFilter, ImageSpec, PodSandbox,
    PodSandboxConfig, PodSandboxFilter, PodSandboxStatus, PortForwardRequest,
    PortForwardResponse, RuntimeConfig, RuntimeStatus, VersionResponse,
};

/// Pod sandbox and container lifecycle.
#[async_trait]
pub trait RuntimeService: Send + Sync {
    /// Runtime name and versions. `api_version` is the kubelet's version.
    async fn version(&self, api_version: &str) -> Result<VersionResponse>;

    /// Create and start a sandbox, returning its ID.
    async fn run_pod_sandbox(
        &self,
        config: PodSandboxConfig,
        runtime_handler: &str,
    ) -> Result<String>;

    async fn stop_pod_sandbox(&self, pod_sandbox_id: &str) -> Result<()>;

    async fn remove_pod_sandbox(&self, pod_sandbox_id: &str) -> Result<()>;

    async fn pod_sandbox_status(&self, pod_sandbox_id: &str) -> Result<PodSandboxStatus>;

    async fn list_pod_sandbox(&self, filter: Option<PodSandboxFilter>)
        -> Result<Vec<PodSandbox>>;

    /// Create a container inside an existing sandbox, returning its ID.
    async fn create_container(
        &self,
        pod_sandbox_id: &str,
        config: ContainerConfig,
        sandbox_config: Option<PodSandboxConfig>,
    ) -> Result<String>;

    async fn start_container(&self, container_id: &str) -> Result<()>;

    /// Stop a container, giving it `timeout_seconds` before it is killed.
    async fn stop_container(&self, container_id: &str, timeout_seconds: i64) -> Result<()>;

    async fn remove_container(&self, container_id: &str) -> Result<()>;

    async fn list_containers(&self, filter: Option<ContainerFilter>) -> Result<Vec<Container>>;

    async fn container_status(&self, container_id: &str) -> Result<ContainerStatus>;

    /// Run a command in a container and wait for it.
    ///
    /// A command that exits non-zero is reported as
    /// [`MachinedError::ProcessExit`](machined_core::MachinedError::ProcessExit)
    /// carrying its status and output.
    async fn exec_sync(
        &self,
        container_id: &str,
        cmd: &[String],
        timeout: Duration,
    ) -> Result<ExecOutput>;

    /// Prepare a streaming exec and return where to connect.
    async fn exec(&self, request: ExecRequest) -> Result<ExecResponse>;

    /// Prepare a streaming attach and return where to connect.
    async fn attach(&self, request: AttachRequest) -> Result<AttachResponse>;

    /// Prepare a streaming port-forward and return where to connect.
    async fn port_forward(&self, request: PortForwardRequest) -> Result<PortForwardResponse>;

    async fn update_runtime_config(&self, config: Option<RuntimeConfig>) -> Result<()>;

    async fn status(&self) -> Result<RuntimeStatus>;
}

/// Image lifecycle. Every read goes to the engine; nothing is cached here.
#[async_trait]
pub trait ImageService: Send + Sync {
    async fn list_images(&self, filter: Option<ImageFilter>) -> Result<Vec<Image>>;

    /// `Ok(None)` when the image is not present.
    async fn image_status(&self, image: ImageSpec) -> Result<Option<Image>>;

    /// Pull an image and return its resolved reference.
    async fn pull_image(&self, image: ImageSpec, auth: Option<AuthConfig>) -> Result<String>;

    async fn remove_image(&self, image: ImageSpec) -> Result<()>;
}

/// Transport for exec/attach/port-forward byte streams.
#[async_trait]
pub trait StreamingServer: Send + Sync {
    /// Serve streaming connections. Returns only when serving stops; an
    /// error is fatal to the shim.
    async fn start(&self) -> Result<()>;
}
