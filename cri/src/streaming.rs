//! CRI streaming server for exec, attach, and port-forward.
//!
//! Kubernetes CRI uses a two-phase protocol for interactive operations:
//! 1. gRPC call returns a streaming URL
//! 2. Kubelet connects to the URL over HTTP for the actual I/O
//!
//! The gRPC side registers a single-use session under a random token via
//! [`StreamingHandle`]; [`TokenStreamingServer`] accepts the follow-up
//! connection, consumes the token and bridges it to a [`StreamRuntime`].

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use base64::Engine as _;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, RwLock};

use machined_core::error::{MachinedError, Result};
use machined_core::exec::ExecOutput;

use crate::backend::StreamingServer;
use crate::cri_api::{
    AttachRequest, AttachResponse, ExecRequest, ExecResponse, PortForwardRequest,
    PortForwardResponse,
};

/// How long a registered session may wait for its connection.
pub const SESSION_TTL: Duration = Duration::from_secs(60);

/// Maximum number of sessions waiting for a connection.
pub const MAX_IN_FLIGHT: usize = 1000;

/// Largest request head read from a streaming client.
const MAX_REQUEST_HEAD: usize = 8192;

/// Type of CRI streaming session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionKind {
    Exec,
    Attach,
    PortForward,
}

impl SessionKind {
    /// URL path segment for this kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionKind::Exec => "exec",
            SessionKind::Attach => "attach",
            SessionKind::PortForward => "portforward",
        }
    }
}

/// A pending streaming session registered by a CRI gRPC call.
#[derive(Debug, Clone)]
pub struct StreamingSession {
    pub kind: SessionKind,
    /// Container ID (exec, attach) or sandbox ID (port-forward).
    pub target_id: String,
    /// Command to execute (exec only).
    pub cmd: Vec<String>,
    pub tty: bool,
    pub stdin: bool,
    /// Ports to forward (port-forward only).
    pub ports: Vec<i32>,
    registered_at: Instant,
}

/// Byte stream bridged to a streaming client.
pub trait DuplexStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> DuplexStream for T {}

/// Runtime operations reachable through a streaming session.
#[async_trait]
pub trait StreamRuntime: Send + Sync {
    /// Run a command to completion. A non-zero exit may be reported either
    /// in the output or as `ProcessExit`.
    async fn exec(&self, container_id: &str, cmd: &[String], tty: bool) -> Result<ExecOutput>;

    /// Connect to a container's main process I/O.
    async fn attach(&self, container_id: &str, tty: bool) -> Result<Box<dyn DuplexStream>>;

    /// Open a connection to `port` inside a sandbox.
    async fn port_forward(&self, sandbox_id: &str, port: i32) -> Result<Box<dyn DuplexStream>>;
}

struct Registry {
    configured: SocketAddr,
    bound: watch::Sender<Option<SocketAddr>>,
    sessions: RwLock<HashMap<String, StreamingSession>>,
    ttl: Duration,
    max_in_flight: usize,
}

/// Handle for registering streaming sessions from the CRI gRPC service.
#[derive(Clone)]
pub struct StreamingHandle {
    registry: Arc<Registry>,
}

impl StreamingHandle {
    /// Handle for a server that will listen on `addr`.
    pub fn new(addr: SocketAddr) -> Self {
        Self::with_limits(addr, SESSION_TTL, MAX_IN_FLIGHT)
    }

    pub fn with_limits(addr: SocketAddr, ttl: Duration, max_in_flight: usize) -> Self {
        let (bound, _) = watch::channel(None);
        Self {
            registry: Arc::new(Registry {
                configured: addr,
                bound,
                sessions: RwLock::new(HashMap::new()),
                ttl,
                max_in_flight,
            }),
        }
    }

    /// Address clients are directed to: the bound address once the server
    /// is listening, the configured one before that.
    pub fn addr(&self) -> SocketAddr {
        (*self.registry.bound.borrow()).unwrap_or(self.registry.configured)
    }

    /// Address the server is listening on, once bound.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.registry.bound.borrow()
    }

    /// Wait until the server has bound its listener.
    pub async fn bound(&self) -> SocketAddr {
        let mut rx = self.registry.bound.subscribe();
        loop {
            if let Some(addr) = *rx.borrow_and_update() {
                return addr;
            }
            // The sender lives in the registry this handle keeps alive.
            if rx.changed().await.is_err() {
                return self.registry.configured;
            }
        }
    }

    /// Number of sessions still waiting for a connection.
    pub async fn pending(&self) -> usize {
        self.registry.sessions.read().await.len()
    }

    pub async fn get_exec(&self, req: &ExecRequest) -> Result<ExecResponse> {
        let url = self
            .register(SessionKind::Exec, &req.container_id, req.cmd.clone(), req.tty, req.stdin, vec![])
            .await?;
        Ok(ExecResponse { url })
    }

    pub async fn get_attach(&self, req: &AttachRequest) -> Result<AttachResponse> {
        let url = self
            .register(SessionKind::Attach, &req.container_id, vec![], req.tty, req.stdin, vec![])
            .await?;
        Ok(AttachResponse { url })
    }

    pub async fn get_port_forward(&self, req: &PortForwardRequest) -> Result<PortForwardResponse> {
        let url = self
            .register(
                SessionKind::PortForward,
                &req.pod_sandbox_id,
                vec![],
                false,
                false,
                req.port.clone(),
            )
            .await?;
        Ok(PortForwardResponse { url })
    }

    async fn register(
        &self,
        kind: SessionKind,
        target_id: &str,
        cmd: Vec<String>,
        tty: bool,
        stdin: bool,
        ports: Vec<i32>,
    ) -> Result<String> {
        let token = uuid::Uuid::new_v4().to_string();
        let ttl = self.registry.ttl;

        {
            let mut sessions = self.registry.sessions.write().await;
            sessions.retain(|_, s| s.registered_at.elapsed() < ttl);
            if sessions.len() >= self.registry.max_in_flight {
                return Err(MachinedError::ResourceExhausted(format!(
                    "maximum number of in-flight streaming sessions ({}) reached",
                    self.registry.max_in_flight
                )));
            }
            sessions.insert(
                token.clone(),
                StreamingSession {
                    kind,
                    target_id: target_id.to_string(),
                    cmd,
                    tty,
                    stdin,
                    ports,
                    registered_at: Instant::now(),
                },
            );
        }

        tracing::debug!(kind = kind.as_str(), target = %target_id, "Streaming session registered");
        Ok(format!("http://{}/{}/{}", self.addr(), kind.as_str(), token))
    }

    /// Take the session for `token` if it is of `kind` and still fresh.
    async fn consume(&self, kind: &str, token: &str) -> Option<StreamingSession> {
        let mut sessions = self.registry.sessions.write().await;
        if sessions.get(token)?.kind.as_str() != kind {
            return None;
        }
        let session = sessions.remove(token)?;
        (session.registered_at.elapsed() < self.registry.ttl).then_some(session)
    }
}

/// Streaming server that hands token-addressed connections to a runtime.
pub struct TokenStreamingServer {
    handle: StreamingHandle,
    runtime: Arc<dyn StreamRuntime>,
}

impl TokenStreamingServer {
    pub fn new(handle: StreamingHandle, runtime: Arc<dyn StreamRuntime>) -> Self {
        Self { handle, runtime }
    }

    pub fn handle(&self) -> StreamingHandle {
        self.handle.clone()
    }
}

#[async_trait]
impl StreamingServer for TokenStreamingServer {
    async fn start(&self) -> Result<()> {
        let addr = self.handle.registry.configured;
        let listener = TcpListener::bind(addr).await.map_err(|e| {
            MachinedError::StreamingError(format!("failed to bind {}: {}", addr, e))
        })?;
        let local = listener.local_addr()?;
        self.handle.registry.bound.send_replace(Some(local));
        tracing::info!(addr = %local, "CRI streaming server listening");

        loop {
            let (stream, peer) = listener
                .accept()
                .await
                .map_err(|e| MachinedError::StreamingError(format!("accept failed: {}", e)))?;
            let handle = self.handle.clone();
            let runtime = self.runtime.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, peer, handle, runtime).await {
                    tracing::warn!(peer = %peer, error = %e, "Streaming connection failed");
                }
            });
        }
    }
}

/// Client connection. Bytes read past the request head stay buffered and
/// reach the runtime once the connection is bridged.
type Conn = BufReader<TcpStream>;

/// Read the request head up to its blank line, across as many segments as
/// it arrives in, never more than [`MAX_REQUEST_HEAD`] bytes.
async fn read_request_head(stream: &mut Conn) -> std::io::Result<String> {
    let mut limited = (&mut *stream).take(MAX_REQUEST_HEAD as u64);
    let mut head = String::new();
    loop {
        let mut line = Vec::new();
        let n = limited.read_until(b'\n', &mut line).await?;
        head.push_str(&String::from_utf8_lossy(&line));
        if n == 0 || line == b"\r\n" || line == b"\n" {
            return Ok(head);
        }
    }
}

/// Handle an incoming HTTP connection from kubelet.
async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    handle: StreamingHandle,
    runtime: Arc<dyn StreamRuntime>,
) -> Result<()> {
    let mut stream = BufReader::new(stream);
    let request = read_request_head(&mut stream).await?;

    // Request line: GET /<kind>/<token> HTTP/1.1
    let first_line = request.lines().next().unwrap_or("");
    let parts: Vec<&str> = first_line.split_whitespace().collect();
    if parts.len() < 2 {
        send_response(&mut stream, 400, "Bad Request").await?;
        return Ok(());
    }

    let segments: Vec<&str> = parts[1].trim_start_matches('/').split('/').collect();
    if segments.len() != 2 {
        send_response(&mut stream, 404, "Not Found").await?;
        return Ok(());
    }
    let (kind, token) = (segments[0], segments[1]);

    let Some(session) = handle.consume(kind, token).await else {
        send_response(&mut stream, 404, "Session not found or expired").await?;
        return Ok(());
    };

    tracing::info!(
        peer = %peer,
        kind = kind,
        target = %session.target_id,
        "Streaming session started"
    );

    match session.kind {
        SessionKind::Exec => handle_exec(&mut stream, &session, runtime.as_ref()).await,
        SessionKind::Attach => {
            let conn = runtime.attach(&session.target_id, session.tty).await;
            bridge(&mut stream, conn).await
        }
        SessionKind::PortForward => {
            let Some(&port) = session.ports.first() else {
                send_response(&mut stream, 400, "No ports specified").await?;
                return Ok(());
            };
            let conn = runtime.port_forward(&session.target_id, port).await;
            bridge(&mut stream, conn).await
        }
    }
}

/// Run a one-shot exec and reply with its output as JSON.
async fn handle_exec(
    stream: &mut Conn,
    session: &StreamingSession,
    runtime: &dyn StreamRuntime,
) -> Result<()> {
    let output = match runtime
        .exec(&session.target_id, &session.cmd, session.tty)
        .await
    {
        Ok(output) => output,
        Err(MachinedError::ProcessExit {
            exit_code,
            stdout,
            stderr,
        }) => ExecOutput {
            stdout,
            stderr,
            exit_code,
        },
        Err(e) => return send_runtime_error(stream, e).await,
    };

    let body = exec_body(&output);
    let response = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        body.len(),
        body,
    );
    stream.write_all(response.as_bytes()).await?;
    Ok(())
}

fn exec_body(output: &ExecOutput) -> String {
    let engine = base64::engine::general_purpose::STANDARD;
    serde_json::json!({
        "exitCode": output.exit_code,
        "stdout": engine.encode(&output.stdout),
        "stderr": engine.encode(&output.stderr),
    })
    .to_string()
}

/// Upgrade the connection and copy bytes both ways until either side ends.
async fn bridge(stream: &mut Conn, conn: Result<Box<dyn DuplexStream>>) -> Result<()> {
    let mut conn = match conn {
        Ok(conn) => conn,
        Err(e) => return send_runtime_error(stream, e).await,
    };

    let upgrade =
        "HTTP/1.1 101 Switching Protocols\r\nConnection: Upgrade\r\nUpgrade: SPDY/3.1\r\n\r\n";
    stream.write_all(upgrade.as_bytes()).await?;

    match tokio::io::copy_bidirectional(stream, &mut conn).await {
        Ok((up, down)) => {
            tracing::debug!(bytes_in = up, bytes_out = down, "Streaming session finished");
        }
        Err(e) => {
            tracing::debug!(error = %e, "Streaming session ended");
        }
    }
    Ok(())
}

async fn send_runtime_error(stream: &mut Conn, err: MachinedError) -> Result<()> {
    tracing::warn!(error = %err, "Streaming runtime call failed");
    let status = match err {
        MachinedError::Unimplemented(_) => 501,
        MachinedError::NotFound(_) => 404,
        _ => 500,
    };
    send_response(stream, status, &err.to_string()).await?;
    Ok(())
}

/// Send a simple HTTP response.
async fn send_response(stream: &mut Conn, status: u16, body: &str) -> std::io::Result<()> {
    let status_text = match status {
        200 => "OK",
        400 => "Bad Request",
        404 => "Not Found",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        _ => "Error",
    };
    let response = format!(
        "HTTP/1.1 {} {}\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status,
        status_text,
        body.len(),
        body,
    );
    stream.write_all(response.as_bytes()).await
}
