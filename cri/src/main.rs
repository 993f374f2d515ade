//! machined CRI - Kubernetes Container Runtime Interface binary.
//!
//! Serves CRI RuntimeService and ImageService over a Unix domain socket,
//! optionally guarded by a single-instance lock file.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tracing_subscriber::EnvFilter;

use machined_core::config::{DEFAULT_RUNTIME_NAME, DEFAULT_SOCKET_PATH, DEFAULT_STREAMING_ADDR};
use machined_core::ShimConfig;
use machined_cri::app;

/// machined CRI runtime shim
#[derive(Parser, Debug)]
#[command(name = "machined-cri", version, about = "machined CRI runtime shim")]
struct Args {
    /// Path to the Unix domain socket for CRI communication.
    #[arg(long, default_value = DEFAULT_SOCKET_PATH)]
    socket: PathBuf,

    /// Lock file marking the single live instance.
    #[arg(long)]
    lock_file: Option<PathBuf>,

    /// Exit when another process opens or deletes the lock file.
    #[arg(long)]
    exit_on_lock_contention: bool,

    /// Listen address of the exec/attach/port-forward streaming server.
    #[arg(long, default_value = DEFAULT_STREAMING_ADDR)]
    streaming_addr: SocketAddr,

    /// Do not start the streaming server.
    #[arg(long)]
    disable_streaming: bool,

    /// Runtime name reported to the kubelet.
    #[arg(long, default_value = DEFAULT_RUNTIME_NAME)]
    runtime_name: String,

    /// Run exec commands as host processes with this shim's privileges.
    #[arg(long)]
    allow_host_exec: bool,

    /// Emit logs as JSON lines.
    #[arg(long)]
    log_json: bool,
}

impl Args {
    fn into_config(self) -> ShimConfig {
        ShimConfig {
            socket_path: self.socket,
            lock_file: self.lock_file,
            exit_on_lock_contention: self.exit_on_lock_contention,
            streaming_addr: (!self.disable_streaming).then_some(self.streaming_addr),
            runtime_name: self.runtime_name,
            allow_host_exec: self.allow_host_exec,
        }
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

/// Resolve on SIGINT or SIGTERM.
async fn shutdown_signal() {
    let interrupt = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "Failed to listen for SIGINT");
            std::future::pending::<()>().await;
        }
    };

    let terminate = async {
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = interrupt => tracing::info!("Received SIGINT"),
        _ = terminate => tracing::info!("Received SIGTERM"),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_tracing(args.log_json);

    match app::run(args.into_config(), shutdown_signal()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "machined CRI shim failed");
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_flags() {
        let config = Args::parse_from(["machined-cri"]).into_config();
        assert_eq!(config.socket_path, PathBuf::from(DEFAULT_SOCKET_PATH));
        assert!(config.lock_file.is_none());
        assert!(!config.exit_on_lock_contention);
        assert_eq!(
            config.streaming_addr,
            Some(DEFAULT_STREAMING_ADDR.parse().unwrap())
        );
        assert_eq!(config.runtime_name, DEFAULT_RUNTIME_NAME);
        assert!(!config.allow_host_exec);
    }

    #[test]
    fn test_allow_host_exec_flag() {
        let config = Args::parse_from(["machined-cri", "--allow-host-exec"]).into_config();
        assert!(config.allow_host_exec);
    }

    #[test]
    fn test_flags_map_to_config() {
        let config = Args::parse_from([
            "machined-cri",
            "--socket",
            "/tmp/cri.sock",
            "--lock-file",
            "/tmp/cri.lock",
            "--exit-on-lock-contention",
            "--disable-streaming",
        ])
        .into_config();
        assert_eq!(config.socket_path, PathBuf::from("/tmp/cri.sock"));
        assert_eq!(config.lock_file, Some(PathBuf::from("/tmp/cri.lock")));
        assert!(config.exit_on_lock_contention);
        assert!(config.streaming_addr.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_contention_without_lock_file_is_rejected() {
        let config = Args::parse_from(["machined-cri", "--exit-on-lock-contention"]).into_config();
        assert!(config.validate().is_err());
    }
}
