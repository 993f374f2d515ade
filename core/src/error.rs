use std::path::PathBuf;

use thiserror::Error;

use crate::parallel::TaskPanic;

/// machined error types
#[derive(Error, Debug)]
pub enum MachinedError {
    /// Invalid combination of startup options
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// The singleton instance lock could not be taken
    #[error("Lock error: {}: {message}", path.display())]
    LockError { path: PathBuf, message: String },

    /// The lock contention watch could not be installed
    #[error("Watch error: {0}")]
    WatchError(String),

    /// The local endpoint could not be cleaned or bound
    #[error("Bind error: {}: {message}", address.display())]
    BindError { address: PathBuf, message: String },

    /// The streaming subsystem stopped with an error
    #[error("Streaming error: {0}")]
    StreamingError(String),

    /// The RPC transport failed while serving
    #[error("Transport error: {0}")]
    TransportError(String),

    /// Sandbox, container or image does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Request is missing a required field or carries a bad value
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Target is not in a state that allows the operation
    #[error("Failed precondition: {0}")]
    FailedPrecondition(String),

    /// Operation is not supported by this engine
    #[error("Unimplemented: {0}")]
    Unimplemented(String),

    /// Timeout error
    #[error("Timeout: {0}")]
    TimeoutError(String),

    /// A bounded resource is full
    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    /// Opaque failure reported by the runtime or image engine
    #[error("{0}")]
    EngineError(String),

    /// A command ran to completion with a non-zero exit status.
    ///
    /// Only produced by exec-family calls. This is an outcome of the
    /// command, not a failure of the call that ran it.
    #[error("Process exited with status {exit_code}")]
    ProcessExit {
        exit_code: i32,
        stdout: Vec<u8>,
        stderr: Vec<u8>,
    },

    /// An internal invariant did not hold
    #[error("Internal error: {0}")]
    Internal(String),

    /// A worker pool task panicked instead of returning
    #[error("Task {index} panicked: {message}")]
    TaskPanicked { index: usize, message: String },

    /// I/O error
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// gRPC status raised by an engine that already speaks gRPC
    #[error("gRPC error: {0}")]
    GrpcError(#[from] tonic::Status),
}

impl MachinedError {
    /// Exit status carried by the error, if it is a process exit.
    pub fn exit_status(&self) -> Option<i32> {
        match self {
            Self::ProcessExit { exit_code, .. } => Some(*exit_code),
            _ => None,
        }
    }

    pub fn lock(path: impl Into<PathBuf>, message: impl ToString) -> Self {
        Self::LockError {
            path: path.into(),
            message: message.to_string(),
        }
    }

    pub fn bind(address: impl Into<PathBuf>, message: impl ToString) -> Self {
        Self::BindError {
            address: address.into(),
            message: message.to_string(),
        }
    }
}

impl From<TaskPanic> for MachinedError {
    fn from(panic: TaskPanic) -> Self {
        MachinedError::TaskPanicked {
            index: panic.index,
            message: panic.message,
        }
    }
}

impl From<notify::Error> for MachinedError {
    fn from(err: notify::Error) -> Self {
        MachinedError::WatchError(err.to_string())
    }
}

/// Result type alias for machined operations
pub type Result<T> = std::result::Result<T, MachinedError>;
