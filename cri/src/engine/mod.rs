//! Local reference engine.
//!
//! Keeps pod sandboxes, containers and images in memory. Exec commands run
//! as host processes, and only when host exec was switched on. It backs the shim when no external engine
//! is plugged in, and gives the RPC surface something real to drive.

pub mod container;
pub mod image;
pub mod sandbox;

use std::os::unix::process::ExitStatusExt;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio::process::Command;

use machined_core::error::{MachinedError, Result};
use machined_core::exec::{ExecOutput, DEFAULT_EXEC_TIMEOUT};

use crate::backend::{ImageService, RuntimeService};
use crate::cri_api::{
    self, AttachRequest, AttachResponse, AuthConfig, ContainerConfig, ContainerFilter,
    ContainerStatus, ExecRequest, ExecResponse, Image, ImageFilter, ImageSpec, PodSandboxConfig,
    PodSandboxFilter, PodSandboxStatus, PortForwardRequest, PortForwardResponse, RuntimeCondition,
    RuntimeConfig, RuntimeStatus, VersionResponse,
};
use crate::streaming::{DuplexStream, StreamRuntime, StreamingHandle};
use crate::CRI_API_VERSION;

use self::container::{Container, ContainerState, ContainerStore, EXIT_KILLED, EXIT_TERMINATED};
use self::image::ImageStore;
use self::sandbox::{PodSandbox, SandboxState, SandboxStore};

/// Version of the kubelet runtime API reported by `Version`.
const KUBELET_API_VERSION: &str = "0.1.0";

fn now_ns() -> i64 {
    chrono::Utc::now().timestamp_nanos_opt().unwrap_or(0)
}

fn new_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

/// In-memory engine implementing every capability the shim needs.
#[derive(Clone)]
pub struct LocalEngine {
    runtime_name: String,
    sandboxes: Arc<SandboxStore>,
    containers: Arc<ContainerStore>,
    images: Arc<ImageStore>,
    pod_cidr: Arc<parking_lot::RwLock<Option<String>>>,
    streaming: Option<StreamingHandle>,
    host_exec: bool,
}

impl LocalEngine {
    pub fn new(runtime_name: impl Into<String>) -> Self {
        Self {
            runtime_name: runtime_name.into(),
            sandboxes: Arc::new(SandboxStore::new()),
            containers: Arc::new(ContainerStore::new()),
            images: Arc::new(ImageStore::new()),
            pod_cidr: Arc::new(parking_lot::RwLock::new(None)),
            streaming: None,
            host_exec: false,
        }
    }

    /// Allow exec commands to run as host processes. Without this every
    /// exec-family call is refused.
    pub fn with_host_exec(mut self, enabled: bool) -> Self {
        self.host_exec = enabled;
        self
    }

    /// Route Exec/Attach/PortForward through `handle`.
    pub fn with_streaming(mut self, handle: StreamingHandle) -> Self {
        self.streaming = Some(handle);
        self
    }

    /// Pod CIDR last pushed by the kubelet.
    pub fn pod_cidr(&self) -> Option<String> {
        self.pod_cidr.read().clone()
    }

    fn streaming(&self) -> Result<&StreamingHandle> {
        self.streaming.as_ref().ok_or_else(|| {
            MachinedError::FailedPrecondition("streaming server is not configured".to_string())
        })
    }

    async fn sandbox(&self, id: &str) -> Result<PodSandbox> {
        self.sandboxes
            .get(id)
            .await
            .ok_or_else(|| MachinedError::NotFound(format!("pod sandbox {}", id)))
    }

    async fn ready_sandbox(&self, id: &str) -> Result<PodSandbox> {
        let sandbox = self.sandbox(id).await?;
        if sandbox.state != SandboxState::Ready {
            return Err(MachinedError::FailedPrecondition(format!(
                "pod sandbox {} is not ready",
                id
            )));
        }
        Ok(sandbox)
    }

    async fn container(&self, id: &str) -> Result<Container> {
        self.containers
            .get(id)
            .await
            .ok_or_else(|| MachinedError::NotFound(format!("container {}", id)))
    }

    async fn running_container(&self, id: &str) -> Result<Container> {
        let container = self.container(id).await?;
        if container.state != ContainerState::Running {
            return Err(MachinedError::FailedPrecondition(format!(
                "container {} is not running",
                id
            )));
        }
        Ok(container)
    }

    fn host_exec_allowed(&self) -> Result<()> {
        if self.host_exec {
            Ok(())
        } else {
            Err(MachinedError::Unimplemented(
                "host command execution is disabled; start with --allow-host-exec".to_string(),
            ))
        }
    }

    /// Run `cmd` as a host process with the container's environment.
    async fn run_command(
        &self,
        container: &Container,
        cmd: &[String],
        timeout: Duration,
    ) -> Result<ExecOutput> {
        self.host_exec_allowed()?;
        let (program, args) = cmd
            .split_first()
            .ok_or_else(|| MachinedError::InvalidArgument("command is empty".to_string()))?;

        let mut command = Command::new(program);
        command
            .args(args)
            .envs(container.envs.iter().map(|kv| (&kv.key, &kv.value)))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        tracing::debug!(container_id = %container.id, cmd = ?cmd, "Running exec command");

        let output = match tokio::time::timeout(timeout, command.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(MachinedError::EngineError(format!(
                    "failed to exec {}: {}",
                    program, e
                )));
            }
            Err(_) => {
                return Err(MachinedError::TimeoutError(format!(
                    "command {} in container {} timed out after {:?}",
                    program, container.id, timeout
                )));
            }
        };

        let exit_code = output
            .status
            .code()
            .or_else(|| output.status.signal().map(|sig| 128 + sig))
            .unwrap_or(-1);
        let output = ExecOutput {
            stdout: output.stdout,
            stderr: output.stderr,
            exit_code,
        }
        .truncated();

        if output.success() {
            Ok(output)
        } else {
            Err(MachinedError::ProcessExit {
                exit_code: output.exit_code,
                stdout: output.stdout,
                stderr: output.stderr,
            })
        }
    }
}

#[async_trait]
impl RuntimeService for LocalEngine {
    async fn version(&self, api_version: &str) -> Result<VersionResponse> {
        tracing::debug!(kubelet_api_version = %api_version, "Version requested");
        Ok(VersionResponse {
            version: KUBELET_API_VERSION.to_string(),
            runtime_name: self.runtime_name.clone(),
            runtime_version: machined_core::VERSION.to_string(),
            runtime_api_version: CRI_API_VERSION.to_string(),
        })
    }

    // ── Pod Sandbox ──────────────────────────────────────────────────

    async fn run_pod_sandbox(
        &self,
        config: PodSandboxConfig,
        runtime_handler: &str,
    ) -> Result<String> {
        let metadata = config
            .metadata
            .ok_or_else(|| MachinedError::InvalidArgument("sandbox metadata required".to_string()))?;

        let sandbox = PodSandbox {
            id: new_id(),
            name: metadata.name,
            namespace: metadata.namespace,
            uid: metadata.uid,
            attempt: metadata.attempt,
            state: SandboxState::Ready,
            created_at: now_ns(),
            hostname: config.hostname,
            labels: config.labels,
            annotations: config.annotations,
            log_directory: config.log_directory,
            runtime_handler: runtime_handler.to_string(),
        };
        let id = sandbox.id.clone();

        tracing::info!(
            sandbox_id = %id,
            name = %sandbox.name,
            namespace = %sandbox.namespace,
            "Sandbox created"
        );
        self.sandboxes.add(sandbox).await;

        Ok(id)
    }

    async fn stop_pod_sandbox(&self, pod_sandbox_id: &str) -> Result<()> {
        if !self
            .sandboxes
            .update_state(pod_sandbox_id, SandboxState::NotReady)
            .await
        {
            return Err(MachinedError::NotFound(format!("pod sandbox {}", pod_sandbox_id)));
        }

        let stopped = self
            .containers
            .exit_by_sandbox(pod_sandbox_id, now_ns(), EXIT_KILLED)
            .await;
        tracing::info!(sandbox_id = %pod_sandbox_id, containers = stopped, "Sandbox stopped");
        Ok(())
    }

    async fn remove_pod_sandbox(&self, pod_sandbox_id: &str) -> Result<()> {
        // Sandbox first: a concurrent create re-checks it after inserting.
        let sandbox = self.sandboxes.remove(pod_sandbox_id).await;
        let removed = self.containers.remove_by_sandbox(pod_sandbox_id).await;
        if sandbox.is_none() {
            // Removing an absent sandbox is not an error.
            tracing::debug!(sandbox_id = %pod_sandbox_id, "Sandbox already removed");
            return Ok(());
        }
        tracing::info!(
            sandbox_id = %pod_sandbox_id,
            containers = removed.len(),
            "Sandbox removed"
        );
        Ok(())
    }

    async fn pod_sandbox_status(&self, pod_sandbox_id: &str) -> Result<PodSandboxStatus> {
        Ok(self.sandbox(pod_sandbox_id).await?.to_status())
    }

    async fn list_pod_sandbox(
        &self,
        filter: Option<PodSandboxFilter>,
    ) -> Result<Vec<cri_api::PodSandbox>> {
        Ok(self
            .sandboxes
            .list(filter.as_ref())
            .await
            .iter()
            .map(PodSandbox::to_cri)
            .collect())
    }

    // ── Container ────────────────────────────────────────────────────

    async fn create_container(
        &self,
        pod_sandbox_id: &str,
        config: ContainerConfig,
        _sandbox_config: Option<PodSandboxConfig>,
    ) -> Result<String> {
        self.ready_sandbox(pod_sandbox_id).await?;

        let metadata = config.metadata.ok_or_else(|| {
            MachinedError::InvalidArgument("container metadata required".to_string())
        })?;
        let image = config
            .image
            .map(|spec| spec.image)
            .filter(|image| !image.is_empty())
            .ok_or_else(|| MachinedError::InvalidArgument("container image required".to_string()))?;
        let image_ref = match self.images.get(&image).await {
            Some(stored) => stored.id,
            None => image.clone(),
        };

        let container = Container {
            id: new_id(),
            sandbox_id: pod_sandbox_id.to_string(),
            name: metadata.name,
            attempt: metadata.attempt,
            image,
            image_ref,
            command: config.command,
            args: config.args,
            working_dir: config.working_dir,
            envs: config.envs,
            mounts: config.mounts,
            state: ContainerState::Created,
            created_at: now_ns(),
            started_at: 0,
            finished_at: 0,
            exit_code: 0,
            reason: "Created".to_string(),
            labels: config.labels,
            annotations: config.annotations,
            log_path: config.log_path,
        };
        let id = container.id.clone();
        let name = container.name.clone();
        self.containers.add(container).await;

        // The sandbox may have been stopped or removed since the first check.
        if let Err(e) = self.ready_sandbox(pod_sandbox_id).await {
            self.containers.remove(&id).await;
            return Err(e);
        }

        tracing::info!(
            sandbox_id = %pod_sandbox_id,
            container_id = %id,
            name = %name,
            "Container created"
        );

        Ok(id)
    }

    async fn start_container(&self, container_id: &str) -> Result<()> {
        self.containers.mark_started(container_id, now_ns()).await?;
        tracing::info!(container_id = %container_id, "Container started");
        Ok(())
    }

    async fn stop_container(&self, container_id: &str, timeout_seconds: i64) -> Result<()> {
        self.container(container_id).await?;

        let exit_code = if timeout_seconds > 0 {
            EXIT_TERMINATED
        } else {
            EXIT_KILLED
        };
        if self
            .containers
            .mark_exited(container_id, now_ns(), exit_code)
            .await
        {
            tracing::info!(container_id = %container_id, exit_code, "Container stopped");
        }
        Ok(())
    }

    async fn remove_container(&self, container_id: &str) -> Result<()> {
        match self.containers.remove(container_id).await {
            Some(_) => tracing::info!(container_id = %container_id, "Container removed"),
            None => tracing::debug!(container_id = %container_id, "Container already removed"),
        }
        Ok(())
    }

    async fn list_containers(
        &self,
        filter: Option<ContainerFilter>,
    ) -> Result<Vec<cri_api::Container>> {
        Ok(self
            .containers
            .list(filter.as_ref())
            .await
            .iter()
            .map(Container::to_cri)
            .collect())
    }

    async fn container_status(&self, container_id: &str) -> Result<ContainerStatus> {
        Ok(self.container(container_id).await?.to_status())
    }

    // ── Exec / Attach / PortForward ──────────────────────────────────

    async fn exec_sync(
        &self,
        container_id: &str,
        cmd: &[String],
        timeout: Duration,
    ) -> Result<ExecOutput> {
        let container = self.running_container(container_id).await?;
        self.run_command(&container, cmd, timeout).await
    }

    async fn exec(&self, request: ExecRequest) -> Result<ExecResponse> {
        if request.cmd.is_empty() {
            return Err(MachinedError::InvalidArgument("command is empty".to_string()));
        }
        self.running_container(&request.container_id).await?;
        self.host_exec_allowed()?;
        self.streaming()?.get_exec(&request).await
    }

    async fn attach(&self, request: AttachRequest) -> Result<AttachResponse> {
        self.running_container(&request.container_id).await?;
        self.streaming()?.get_attach(&request).await
    }

    async fn port_forward(&self, request: PortForwardRequest) -> Result<PortForwardResponse> {
        if let Some(port) = request.port.iter().find(|p| !(1..=65535).contains(*p)) {
            return Err(MachinedError::InvalidArgument(format!("invalid port {}", port)));
        }
        self.ready_sandbox(&request.pod_sandbox_id).await?;
        self.streaming()?.get_port_forward(&request).await
    }

    // ── Status ───────────────────────────────────────────────────────

    async fn update_runtime_config(&self, config: Option<RuntimeConfig>) -> Result<()> {
        let Some(pod_cidr) = config
            .and_then(|c| c.network_config)
            .map(|n| n.pod_cidr)
            .filter(|cidr| !cidr.is_empty())
        else {
            return Ok(());
        };

        tracing::info!(pod_cidr = %pod_cidr, "Runtime config updated");
        *self.pod_cidr.write() = Some(pod_cidr);
        Ok(())
    }

    async fn status(&self) -> Result<RuntimeStatus> {
        let conditions = vec![
            RuntimeCondition {
                r#type: "RuntimeReady".to_string(),
                status: true,
                reason: String::new(),
                message: String::new(),
            },
            RuntimeCondition {
                r#type: "NetworkReady".to_string(),
                status: true,
                reason: String::new(),
                message: String::new(),
            },
        ];
        Ok(RuntimeStatus { conditions })
    }
}

#[async_trait]
impl ImageService for LocalEngine {
    async fn list_images(&self, filter: Option<ImageFilter>) -> Result<Vec<Image>> {
        let wanted = filter
            .and_then(|f| f.image)
            .map(|spec| spec.image)
            .filter(|image| !image.is_empty());

        let images = match wanted {
            Some(reference) => self.images.get(&reference).await.into_iter().collect(),
            None => self.images.list().await,
        };
        Ok(images.iter().map(|img| img.to_cri()).collect())
    }

    async fn image_status(&self, image: ImageSpec) -> Result<Option<Image>> {
        Ok(self.images.get(&image.image).await.map(|img| img.to_cri()))
    }

    async fn pull_image(&self, image: ImageSpec, auth: Option<AuthConfig>) -> Result<String> {
        if image.image.trim().is_empty() {
            return Err(MachinedError::InvalidArgument("image reference is empty".to_string()));
        }

        let stored = self.images.add(&image.image, now_ns()).await;
        tracing::info!(
            image = %stored.reference,
            id = %stored.id,
            authenticated = auth.is_some(),
            "Image recorded"
        );
        Ok(stored.id)
    }

    async fn remove_image(&self, image: ImageSpec) -> Result<()> {
        let removed = self
            .images
            .remove(&image.image)
            .await
            .ok_or_else(|| MachinedError::NotFound(format!("image {}", image.image)))?;
        tracing::info!(image = %removed.reference, "Image removed");
        Ok(())
    }
}

#[async_trait]
impl StreamRuntime for LocalEngine {
    async fn exec(&self, container_id: &str, cmd: &[String], _tty: bool) -> Result<ExecOutput> {
        let container = self.running_container(container_id).await?;
        self.run_command(&container, cmd, DEFAULT_EXEC_TIMEOUT).await
    }

    async fn attach(&self, container_id: &str, _tty: bool) -> Result<Box<dyn DuplexStream>> {
        self.running_container(container_id).await?;
        Err(MachinedError::Unimplemented(
            "attach is not supported by the local engine".to_string(),
        ))
    }

    async fn port_forward(&self, sandbox_id: &str, port: i32) -> Result<Box<dyn DuplexStream>> {
        self.ready_sandbox(sandbox_id).await?;
        let port = u16::try_from(port)
            .map_err(|_| MachinedError::InvalidArgument(format!("invalid port {}", port)))?;
        let stream = TcpStream::connect(("127.0.0.1", port)).await.map_err(|e| {
            MachinedError::EngineError(format!("failed to connect to port {}: {}", port, e))
        })?;
        Ok(Box::new(stream))
    }
}
