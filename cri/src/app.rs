//! Shim startup: configuration check, instance lock, contention watch,
//! engine and streaming wiring, then serving until told to stop.

use std::future::Future;
use std::sync::Arc;

use machined_core::error::Result;
use machined_core::{watch_for_contention, DoneSignal, InstanceLock, ShimConfig};

use crate::backend::StreamingServer;
use crate::engine::LocalEngine;
use crate::server::CriServer;
use crate::streaming::{StreamingHandle, TokenStreamingServer};

/// Run the shim until `shutdown` resolves, lock contention is observed, or
/// a fatal error occurs.
///
/// Configuration is validated before anything else happens. The instance
/// lock, when configured, is held until this returns.
pub async fn run<F>(config: ShimConfig, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send,
{
    config.validate()?;

    tracing::info!(
        socket = %config.socket_path.display(),
        lock_file = ?config.lock_file,
        streaming_addr = ?config.streaming_addr,
        version = machined_core::VERSION,
        "Starting machined CRI shim"
    );

    let _lock = match config.lock_file {
        Some(ref path) => {
            let lock = InstanceLock::acquire(path)?;
            tracing::info!(path = %lock.path().display(), "Instance lock acquired");
            Some(lock)
        }
        None => None,
    };

    let done = DoneSignal::new();
    let _watch = match config.lock_file {
        Some(ref path) if config.exit_on_lock_contention => {
            Some(watch_for_contention(path, done.clone())?)
        }
        _ => None,
    };

    if config.allow_host_exec {
        tracing::warn!("Host exec enabled: exec requests run as host processes with shim privileges");
    }
    let mut engine =
        LocalEngine::new(config.runtime_name.clone()).with_host_exec(config.allow_host_exec);
    let streaming: Option<Arc<dyn StreamingServer>> = match config.streaming_addr {
        Some(addr) => {
            let handle = StreamingHandle::new(addr);
            engine = engine.with_streaming(handle.clone());
            Some(Arc::new(TokenStreamingServer::new(
                handle,
                Arc::new(engine.clone()),
            )))
        }
        None => {
            tracing::info!("Streaming server disabled");
            None
        }
    };

    let engine = Arc::new(engine);
    let server = CriServer::new(engine.clone(), engine, streaming);

    let stop = async move {
        tokio::select! {
            _ = shutdown => tracing::info!("Shutdown requested"),
            _ = done.wait() => tracing::warn!("Giving up instance ownership after lock contention"),
        }
    };

    server.serve_with_shutdown(&config.socket_path, stop).await?;

    tracing::info!("machined CRI shim stopped");
    Ok(())
}
