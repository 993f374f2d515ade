//! CRI RuntimeService implementation.
//!
//! Every handler traces the request, forwards it to the injected
//! [`backend::RuntimeService`] and wraps the result. Engine errors are
//! logged and returned unchanged in meaning; nothing is retried here.

use std::sync::Arc;

use tonic::{Request, Response, Status};

use machined_core::error::MachinedError;
use machined_core::exec::exec_timeout;

use crate::backend;
use crate::backend::RuntimeService as _;
use crate::cri_api::runtime_service_server;
use crate::cri_api::*;
use crate::error::call_failed;

/// gRPC front of the runtime lifecycle service.
pub struct CriRuntimeService {
    runtime: Arc<dyn backend::RuntimeService>,
}

impl CriRuntimeService {
    pub fn new(runtime: Arc<dyn backend::RuntimeService>) -> Self {
        Self { runtime }
    }
}

#[tonic::async_trait]
impl runtime_service_server::RuntimeService for CriRuntimeService {
    // ── Version ──────────────────────────────────────────────────────

    async fn version(
        &self,
        request: Request<VersionRequest>,
    ) -> Result<Response<VersionResponse>, Status> {
        let req = request.into_inner();
        tracing::trace!(request = ?req, "CRI Version");

        let version = self
            .runtime
            .version(&req.version)
            .await
            .map_err(|e| call_failed("Version", e))?;

        Ok(Response::new(version))
    }

    // ── Pod Sandbox ──────────────────────────────────────────────────

    async fn run_pod_sandbox(
        &self,
        request: Request<RunPodSandboxRequest>,
    ) -> Result<Response<RunPodSandboxResponse>, Status> {
        let req = request.into_inner();
        tracing::trace!(request = ?req, "CRI RunPodSandbox");

        let config = req.config.ok_or_else(|| {
            call_failed(
                "RunPodSandbox",
                MachinedError::InvalidArgument("sandbox config required".to_string()),
            )
        })?;

        let pod_sandbox_id = self
            .runtime
            .run_pod_sandbox(config, &req.runtime_handler)
            .await
            .map_err(|e| call_failed("RunPodSandbox", e))?;

        tracing::info!(sandbox_id = %pod_sandbox_id, "Pod sandbox running");

        Ok(Response::new(RunPodSandboxResponse { pod_sandbox_id }))
    }

    async fn stop_pod_sandbox(
        &self,
        request: Request<StopPodSandboxRequest>,
    ) -> Result<Response<StopPodSandboxResponse>, Status> {
        let req = request.into_inner();
        tracing::trace!(request = ?req, "CRI StopPodSandbox");

        self.runtime
            .stop_pod_sandbox(&req.pod_sandbox_id)
            .await
            .map_err(|e| call_failed("StopPodSandbox", e))?;

        Ok(Response::new(StopPodSandboxResponse {}))
    }

    async fn remove_pod_sandbox(
        &self,
        request: Request<RemovePodSandboxRequest>,
    ) -> Result<Response<RemovePodSandboxResponse>, Status> {
        let req = request.into_inner();
        tracing::trace!(request = ?req, "CRI RemovePodSandbox");

        self.runtime
            .remove_pod_sandbox(&req.pod_sandbox_id)
            .await
            .map_err(|e| call_failed("RemovePodSandbox", e))?;

        tracing::info!(sandbox_id = %req.pod_sandbox_id, "Pod sandbox removed");

        Ok(Response::new(RemovePodSandboxResponse {}))
    }

    async fn pod_sandbox_status(
        &self,
        request: Request<PodSandboxStatusRequest>,
    ) -> Result<Response<PodSandboxStatusResponse>, Status> {
        let req = request.into_inner();
        tracing::trace!(request = ?req, "CRI PodSandboxStatus");

        let status = self
            .runtime
            .pod_sandbox_status(&req.pod_sandbox_id)
            .await
            .map_err(|e| call_failed("PodSandboxStatus", e))?;

        Ok(Response::new(PodSandboxStatusResponse {
            status: Some(status),
            info: Default::default(),
        }))
    }

    async fn list_pod_sandbox(
        &self,
        request: Request<ListPodSandboxRequest>,
    ) -> Result<Response<ListPodSandboxResponse>, Status> {
        let req = request.into_inner();
        tracing::trace!(request = ?req, "CRI ListPodSandbox");

        let items = self
            .runtime
            .list_pod_sandbox(req.filter)
            .await
            .map_err(|e| call_failed("ListPodSandbox", e))?;

        Ok(Response::new(ListPodSandboxResponse { items }))
    }

    // ── Container ────────────────────────────────────────────────────

    async fn create_container(
        &self,
        request: Request<CreateContainerRequest>,
    ) -> Result<Response<CreateContainerResponse>, Status> {
        let req = request.into_inner();
        tracing::trace!(request = ?req, "CRI CreateContainer");

        let config = req.config.ok_or_else(|| {
            call_failed(
                "CreateContainer",
                MachinedError::InvalidArgument("container config required".to_string()),
            )
        })?;

        let container_id = self
            .runtime
            .create_container(&req.pod_sandbox_id, config, req.sandbox_config)
            .await
            .map_err(|e| call_failed("CreateContainer", e))?;

        tracing::info!(
            sandbox_id = %req.pod_sandbox_id,
            container_id = %container_id,
            "Container created"
        );

        Ok(Response::new(CreateContainerResponse { container_id }))
    }

    async fn start_container(
        &self,
        request: Request<StartContainerRequest>,
    ) -> Result<Response<StartContainerResponse>, Status> {
        let req = request.into_inner();
        tracing::trace!(request = ?req, "CRI StartContainer");

        self.runtime
            .start_container(&req.container_id)
            .await
            .map_err(|e| call_failed("StartContainer", e))?;

        Ok(Response::new(StartContainerResponse {}))
    }

    async fn stop_container(
        &self,
        request: Request<StopContainerRequest>,
    ) -> Result<Response<StopContainerResponse>, Status> {
        let req = request.into_inner();
        tracing::trace!(request = ?req, "CRI StopContainer");

        self.runtime
            .stop_container(&req.container_id, req.timeout)
            .await
            .map_err(|e| call_failed("StopContainer", e))?;

        Ok(Response::new(StopContainerResponse {}))
    }

    async fn remove_container(
        &self,
        request: Request<RemoveContainerRequest>,
    ) -> Result<Response<RemoveContainerResponse>, Status> {
        let req = request.into_inner();
        tracing::trace!(request = ?req, "CRI RemoveContainer");

        self.runtime
            .remove_container(&req.container_id)
            .await
            .map_err(|e| call_failed("RemoveContainer", e))?;

        Ok(Response::new(RemoveContainerResponse {}))
    }

    async fn list_containers(
        &self,
        request: Request<ListContainersRequest>,
    ) -> Result<Response<ListContainersResponse>, Status> {
        let req = request.into_inner();
        tracing::trace!(request = ?req, "CRI ListContainers");

        let containers = self
            .runtime
            .list_containers(req.filter)
            .await
            .map_err(|e| call_failed("ListContainers", e))?;

        Ok(Response::new(ListContainersResponse { containers }))
    }

    async fn container_status(
        &self,
        request: Request<ContainerStatusRequest>,
    ) -> Result<Response<ContainerStatusResponse>, Status> {
        let req = request.into_inner();
        tracing::trace!(request = ?req, "CRI ContainerStatus");

        let status = self
            .runtime
            .container_status(&req.container_id)
            .await
            .map_err(|e| call_failed("ContainerStatus", e))?;

        Ok(Response::new(ContainerStatusResponse {
            status: Some(status),
            info: Default::default(),
        }))
    }

    // ── Exec / Attach / PortForward ──────────────────────────────────

    async fn exec_sync(
        &self,
        request: Request<ExecSyncRequest>,
    ) -> Result<Response<ExecSyncResponse>, Status> {
        let req = request.into_inner();
        tracing::trace!(request = ?req, "CRI ExecSync");

        let result = self
            .runtime
            .exec_sync(&req.container_id, &req.cmd, exec_timeout(req.timeout))
            .await;

        // A non-zero exit is the command's answer, not a failed call.
        let response = match result {
            Ok(output) => ExecSyncResponse {
                stdout: output.stdout,
                stderr: output.stderr,
                exit_code: output.exit_code,
            },
            Err(MachinedError::ProcessExit {
                exit_code,
                stdout,
                stderr,
            }) => {
                tracing::debug!(
                    container_id = %req.container_id,
                    exit_code,
                    "ExecSync command exited non-zero"
                );
                ExecSyncResponse {
                    stdout,
                    stderr,
                    exit_code,
                }
            }
            Err(e) => return Err(call_failed("ExecSync", e)),
        };

        Ok(Response::new(response))
    }

    async fn exec(
        &self,
        request: Request<ExecRequest>,
    ) -> Result<Response<ExecResponse>, Status> {
        let req = request.into_inner();
        tracing::trace!(request = ?req, "CRI Exec");

        let response = self
            .runtime
            .exec(req)
            .await
            .map_err(|e| call_failed("Exec", e))?;

        Ok(Response::new(response))
    }

    async fn attach(
        &self,
        request: Request<AttachRequest>,
    ) -> Result<Response<AttachResponse>, Status> {
        let req = request.into_inner();
        tracing::trace!(request = ?req, "CRI Attach");

        let response = self
            .runtime
            .attach(req)
            .await
            .map_err(|e| call_failed("Attach", e))?;

        Ok(Response::new(response))
    }

    async fn port_forward(
        &self,
        request: Request<PortForwardRequest>,
    ) -> Result<Response<PortForwardResponse>, Status> {
        let req = request.into_inner();
        tracing::trace!(request = ?req, "CRI PortForward");

        let response = self
            .runtime
            .port_forward(req)
            .await
            .map_err(|e| call_failed("PortForward", e))?;

        Ok(Response::new(response))
    }

    // ── Status ───────────────────────────────────────────────────────

    async fn update_runtime_config(
        &self,
        request: Request<UpdateRuntimeConfigRequest>,
    ) -> Result<Response<UpdateRuntimeConfigResponse>, Status> {
        let req = request.into_inner();
        tracing::trace!(request = ?req, "CRI UpdateRuntimeConfig");

        self.runtime
            .update_runtime_config(req.runtime_config)
            .await
            .map_err(|e| call_failed("UpdateRuntimeConfig", e))?;

        Ok(Response::new(UpdateRuntimeConfigResponse {}))
    }

    async fn status(
        &self,
        request: Request<StatusRequest>,
    ) -> Result<Response<StatusResponse>, Status> {
        let req = request.into_inner();
        tracing::trace!(request = ?req, "CRI Status");

        let status = self
            .runtime
            .status()
            .await
            .map_err(|e| call_failed("Status", e))?;

        Ok(Response::new(StatusResponse {
            status: Some(status),
            info: Default::default(),
        }))
    }
}
