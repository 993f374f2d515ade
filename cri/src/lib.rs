//! machined CRI - Kubernetes Container Runtime Interface shim.
//!
//! Serves the CRI RuntimeService and ImageService on a Unix domain socket
//! and forwards every call to injected engine capabilities:
//! - [`backend::RuntimeService`] for pod sandbox and container lifecycle
//! - [`backend::ImageService`] for image lifecycle
//! - [`backend::StreamingServer`] for exec/attach/port-forward transport

pub mod app;
pub mod backend;
pub mod engine;
pub mod error;
pub mod image_service;
pub mod runtime_service;
pub mod server;
pub mod streaming;

/// Generated CRI v1 protobuf types.
pub mod cri_api {
    tonic::include_proto!("runtime.v1");
}

/// CRI API version served by this shim.
pub const CRI_API_VERSION: &str = "v1";
