//! Exec types shared by ExecSync and the streaming exec path.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Timeout applied when an ExecSync request carries none.
pub const DEFAULT_EXEC_TIMEOUT: Duration = Duration::from_secs(60);

/// Maximum output size per stream (stdout/stderr): 16 MiB.
pub const MAX_OUTPUT_BYTES: usize = 16 * 1024 * 1024;

/// Output from an executed command.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecOutput {
    /// Captured stdout bytes.
    pub stdout: Vec<u8>,
    /// Captured stderr bytes.
    pub stderr: Vec<u8>,
    /// Process exit code.
    pub exit_code: i32,
}

impl ExecOutput {
    /// Clamp both streams to [`MAX_OUTPUT_BYTES`].
    pub fn truncated(mut self) -> Self {
        self.stdout.truncate(MAX_OUTPUT_BYTES);
        self.stderr.truncate(MAX_OUTPUT_BYTES);
        self
    }

    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Effective timeout for an ExecSync request given in seconds; zero or
/// negative means "use the default".
pub fn exec_timeout(seconds: i64) -> Duration {
    if seconds > 0 {
        Duration::from_secs(seconds as u64)
    } else {
        DEFAULT_EXEC_TIMEOUT
    }
}
