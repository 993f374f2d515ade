//! gRPC server setup for CRI services.
//!
//! Listens on a Unix domain socket for CRI RuntimeService and ImageService
//! RPCs and supervises the streaming server alongside it.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::net::UnixListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::UnixListenerStream;
use tonic::transport::Server;

use machined_core::error::{MachinedError, Result};

use crate::backend::{self, StreamingServer};
use crate::cri_api::image_service_server::ImageServiceServer;
use crate::cri_api::runtime_service_server::RuntimeServiceServer;
use crate::image_service::CriImageService;
use crate::runtime_service::CriRuntimeService;

/// Lifecycle of the local endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    /// Constructed, nothing bound yet.
    Unbound,
    /// Socket bound, transport not yet running.
    Bound,
    /// Accepting RPCs.
    Serving,
    /// Endpoint torn down. Terminal.
    Stopped,
}

/// CRI gRPC server.
pub struct CriServer {
    runtime_service: RuntimeServiceServer<CriRuntimeService>,
    image_service: ImageServiceServer<CriImageService>,
    streaming: Option<Arc<dyn StreamingServer>>,
    started: AtomicBool,
    state: watch::Sender<ServerState>,
}

impl CriServer {
    /// Create a new CRI server. Performs no I/O.
    pub fn new(
        runtime: Arc<dyn backend::RuntimeService>,
        images: Arc<dyn backend::ImageService>,
        streaming: Option<Arc<dyn StreamingServer>>,
    ) -> Self {
        let (state, _) = watch::channel(ServerState::Unbound);
        Self {
            runtime_service: RuntimeServiceServer::new(CriRuntimeService::new(runtime)),
            image_service: ImageServiceServer::new(CriImageService::new(images)),
            streaming,
            started: AtomicBool::new(false),
            state,
        }
    }

    /// Current endpoint state.
    pub fn state(&self) -> ServerState {
        *self.state.borrow()
    }

    /// Observe endpoint state changes.
    pub fn subscribe(&self) -> watch::Receiver<ServerState> {
        self.state.subscribe()
    }

    /// Serve until the transport or the streaming server fails.
    pub async fn serve(&self, address: impl AsRef<Path>) -> Result<()> {
        self.serve_with_shutdown(address, std::future::pending()).await
    }

    /// Serve until `signal` resolves or the transport or the streaming
    /// server fails.
    ///
    /// A server serves at most once. The socket file is removed on every
    /// exit path, including cancellation of the returned future.
    pub async fn serve_with_shutdown<F>(&self, address: impl AsRef<Path>, signal: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let address = address.as_ref();

        if self.started.swap(true, Ordering::AcqRel) {
            return Err(MachinedError::bind(address, "server already started"));
        }

        match std::fs::remove_file(address) {
            Ok(()) => {
                tracing::debug!(socket = %address.display(), "Removed stale socket");
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(MachinedError::bind(
                    address,
                    format!("failed to remove stale socket: {}", e),
                ));
            }
        }

        if let Some(parent) = address.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    MachinedError::bind(address, format!("failed to create socket directory: {}", e))
                })?;
            }
        }

        let uds = UnixListener::bind(address)
            .map_err(|e| MachinedError::bind(address, format!("failed to bind: {}", e)))?;
        let _guard = EndpointGuard {
            path: address.to_path_buf(),
            state: &self.state,
        };
        self.state.send_replace(ServerState::Bound);

        let mut streaming_task = self.streaming.clone().map(|streaming| {
            tracing::info!("Starting streaming server");
            tokio::spawn(async move { streaming.start().await })
        });

        tracing::info!(socket = %address.display(), "CRI server listening");
        self.state.send_replace(ServerState::Serving);

        let serve = Server::builder()
            .add_service(self.runtime_service.clone())
            .add_service(self.image_service.clone())
            .serve_with_incoming_shutdown(UnixListenerStream::new(uds), signal);

        let outcome = tokio::select! {
            served = serve => served.map_err(|e| MachinedError::TransportError(e.to_string())),
            err = supervise_streaming(streaming_task.as_mut()) => {
                tracing::error!(error = %err, "Streaming server failed");
                Err(err)
            }
        };

        if let Some(task) = streaming_task {
            task.abort();
        }

        tracing::info!(socket = %address.display(), "CRI server stopped");
        outcome
    }
}

/// Resolve only when the streaming server fails. A clean exit is logged and
/// serving continues without it.
async fn supervise_streaming(task: Option<&mut JoinHandle<Result<()>>>) -> MachinedError {
    let Some(task) = task else {
        return std::future::pending().await;
    };

    match task.await {
        Ok(Ok(())) => {
            tracing::info!("Streaming server exited");
            std::future::pending().await
        }
        Ok(Err(err @ MachinedError::StreamingError(_))) => err,
        Ok(Err(err)) => MachinedError::StreamingError(err.to_string()),
        Err(join_err) => {
            MachinedError::StreamingError(format!("streaming server panicked: {}", join_err))
        }
    }
}

/// Removes the socket file and publishes [`ServerState::Stopped`] when the
/// serving scope ends.
struct EndpointGuard<'a> {
    path: PathBuf,
    state: &'a watch::Sender<ServerState>,
}

impl Drop for EndpointGuard<'_> {
    fn drop(&mut self) {
        match std::fs::remove_file(&self.path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                tracing::warn!(
                    socket = %self.path.display(),
                    error = %e,
                    "Failed to remove socket"
                );
            }
        }
        self.state.send_replace(ServerState::Stopped);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::FileTypeExt;

    use async_trait::async_trait;
    use tokio::sync::oneshot;

    use crate::engine::LocalEngine;

    enum StreamingOutcome {
        Fail,
        Exit,
        Panic,
    }

    struct StubStreaming(StreamingOutcome);

    #[async_trait]
    impl StreamingServer for StubStreaming {
        async fn start(&self) -> Result<()> {
            match self.0 {
                StreamingOutcome::Fail => {
                    Err(MachinedError::IoError(std::io::Error::new(
                        std::io::ErrorKind::AddrInUse,
                        "port taken",
                    )))
                }
                StreamingOutcome::Exit => Ok(()),
                StreamingOutcome::Panic => panic!("streaming crashed"),
            }
        }
    }

    fn server(streaming: Option<Arc<dyn StreamingServer>>) -> Arc<CriServer> {
        let engine = Arc::new(LocalEngine::new("machined"));
        Arc::new(CriServer::new(engine.clone(), engine, streaming))
    }

    async fn wait_for_state(server: &CriServer, wanted: ServerState) {
        let mut rx = server.subscribe();
        tokio::time::timeout(
            std::time::Duration::from_secs(5),
            rx.wait_for(|state| *state == wanted),
        )
        .await
        .expect("state change timed out")
        .expect("state channel closed");
    }

    #[test]
    fn test_new_server_is_unbound() {
        let server = server(None);
        assert_eq!(server.state(), ServerState::Unbound);
    }

    #[tokio::test]
    async fn test_serve_replaces_stale_socket_and_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("run").join("machined.sock");
        std::fs::create_dir_all(socket.parent().unwrap()).unwrap();
        std::fs::write(&socket, b"stale").unwrap();

        let server = server(None);
        let (tx, rx) = oneshot::channel::<()>();
        let task = {
            let server = server.clone();
            let socket = socket.clone();
            tokio::spawn(async move {
                server
                    .serve_with_shutdown(&socket, async {
                        let _ = rx.await;
                    })
                    .await
            })
        };

        wait_for_state(&server, ServerState::Serving).await;
        let meta = std::fs::symlink_metadata(&socket).unwrap();
        assert!(meta.file_type().is_socket());

        tx.send(()).unwrap();
        task.await.unwrap().unwrap();

        assert!(!socket.exists());
        assert_eq!(server.state(), ServerState::Stopped);
    }

    #[tokio::test]
    async fn test_serve_creates_parent_directory() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("a").join("b").join("cri.sock");

        let server = server(None);
        let (tx, rx) = oneshot::channel::<()>();
        let task = {
            let server = server.clone();
            let socket = socket.clone();
            tokio::spawn(async move {
                server
                    .serve_with_shutdown(&socket, async {
                        let _ = rx.await;
                    })
                    .await
            })
        };

        wait_for_state(&server, ServerState::Serving).await;
        assert!(socket.exists());

        tx.send(()).unwrap();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_serve_is_not_reentrant() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("cri.sock");

        let server = server(None);
        let (tx, rx) = oneshot::channel::<()>();
        let task = {
            let server = server.clone();
            let socket = socket.clone();
            tokio::spawn(async move {
                server
                    .serve_with_shutdown(&socket, async {
                        let _ = rx.await;
                    })
                    .await
            })
        };
        wait_for_state(&server, ServerState::Serving).await;

        let err = server.serve(dir.path().join("other.sock")).await.unwrap_err();
        assert!(matches!(err, MachinedError::BindError { .. }));

        tx.send(()).unwrap();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_unremovable_stale_artifact_is_bind_error() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("cri.sock");
        std::fs::create_dir_all(socket.join("occupied")).unwrap();

        let server = server(None);
        let err = server.serve(&socket).await.unwrap_err();
        assert!(matches!(err, MachinedError::BindError { .. }));
        assert_eq!(server.state(), ServerState::Unbound);
    }

    #[tokio::test]
    async fn test_streaming_failure_stops_serving() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("cri.sock");

        let server = server(Some(Arc::new(StubStreaming(StreamingOutcome::Fail))));
        let err = server.serve(&socket).await.unwrap_err();

        assert!(matches!(err, MachinedError::StreamingError(_)));
        assert!(err.to_string().contains("port taken"));
        assert!(!socket.exists());
        assert_eq!(server.state(), ServerState::Stopped);
    }

    #[tokio::test]
    async fn test_streaming_panic_stops_serving() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("cri.sock");

        let server = server(Some(Arc::new(StubStreaming(StreamingOutcome::Panic))));
        let err = server.serve(&socket).await.unwrap_err();
        assert!(matches!(err, MachinedError::StreamingError(_)));
        assert!(!socket.exists());
    }

    #[tokio::test]
    async fn test_streaming_clean_exit_keeps_serving() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("cri.sock");

        let server = server(Some(Arc::new(StubStreaming(StreamingOutcome::Exit))));
        let (tx, rx) = oneshot::channel::<()>();
        let task = {
            let server = server.clone();
            let socket = socket.clone();
            tokio::spawn(async move {
                server
                    .serve_with_shutdown(&socket, async {
                        let _ = rx.await;
                    })
                    .await
            })
        };

        wait_for_state(&server, ServerState::Serving).await;
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        assert!(!task.is_finished());
        assert_eq!(server.state(), ServerState::Serving);

        tx.send(()).unwrap();
        task.await.unwrap().unwrap();
        assert_eq!(server.state(), ServerState::Stopped);
    }

    #[tokio::test]
    async fn test_cancelled_serve_removes_socket() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("cri.sock");

        let server = server(None);
        let task = {
            let server = server.clone();
            let socket = socket.clone();
            tokio::spawn(async move { server.serve(&socket).await })
        };

        wait_for_state(&server, ServerState::Serving).await;
        assert!(socket.exists());

        task.abort();
        let _ = task.await;

        assert!(!socket.exists());
        assert_eq!(server.state(), ServerState::Stopped);
    }
}
