use std::net::SocketAddr;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{MachinedError, Result};

/// Default CRI socket path.
pub const DEFAULT_SOCKET_PATH: &str = "/var/run/machined/machined.sock";

/// Default streaming server address.
pub const DEFAULT_STREAMING_ADDR: &str = "127.0.0.1:10010";

/// Runtime name reported by the Version RPC.
pub const DEFAULT_RUNTIME_NAME: &str = "machined";

/// Shim startup configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShimConfig {
    /// Unix socket the CRI services are served on
    pub socket_path: PathBuf,

    /// Advisory lock marking the single live instance
    pub lock_file: Option<PathBuf>,

    /// Exit when another actor opens or deletes the lock file
    pub exit_on_lock_contention: bool,

    /// Listen address of the exec/attach/port-forward streaming server.
    /// `None` disables streaming.
    pub streaming_addr: Option<SocketAddr>,

    /// Runtime name reported to the kubelet
    pub runtime_name: String,

    /// Let the local engine run exec commands as host processes with the
    /// shim's own privileges. Off unless explicitly requested.
    #[serde(default)]
    pub allow_host_exec: bool,
}

impl Default for ShimConfig {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from(DEFAULT_SOCKET_PATH),
            lock_file: None,
            exit_on_lock_contention: false,
            streaming_addr: DEFAULT_STREAMING_ADDR.parse().ok(),
            runtime_name: DEFAULT_RUNTIME_NAME.to_string(),
            allow_host_exec: false,
        }
    }
}

impl ShimConfig {
    /// Reject option combinations that cannot work. Called before any
    /// lock, watch or socket is touched.
    pub fn validate(&self) -> Result<()> {
        if self.exit_on_lock_contention && self.lock_file.is_none() {
            return Err(MachinedError::ConfigError(
                "cannot exit on lock file contention: no lock file specified".to_string(),
            ));
        }

        if self.socket_path.as_os_str().is_empty() {
            return Err(MachinedError::ConfigError(
                "socket path must not be empty".to_string(),
            ));
        }

        if let Some(addr) = self.streaming_addr {
            // The address is handed to clients verbatim in streaming URLs.
            if addr.ip().is_unspecified() {
                return Err(MachinedError::ConfigError(format!(
                    "streaming address {} is not reachable by clients; use a concrete IP",
                    addr
                )));
            }
            // An ephemeral port is only useful when the URL never leaves the host.
            if addr.port() == 0 && !addr.ip().is_loopback() {
                return Err(MachinedError::ConfigError(format!(
                    "streaming address {} needs an explicit port",
                    addr
                )));
            }
        }

        if self.runtime_name.trim().is_empty() {
            return Err(MachinedError::ConfigError(
                "runtime name must not be empty".to_string(),
            ));
        }

        Ok(())
    }
}
