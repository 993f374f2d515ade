//! CRI-specific error conversions.

use machined_core::error::MachinedError;
use tonic::Status;

/// Convert a MachinedError to a gRPC Status.
///
/// Engine errors keep their message unchanged; statuses raised by an
/// engine pass through as they are.
pub fn to_status(err: MachinedError) -> Status {
    match err {
        MachinedError::NotFound(msg) => Status::not_found(msg),
        MachinedError::InvalidArgument(msg) => Status::invalid_argument(msg),
        MachinedError::ConfigError(msg) => Status::invalid_argument(msg),
        MachinedError::FailedPrecondition(msg) => Status::failed_precondition(msg),
        MachinedError::Unimplemented(msg) => Status::unimplemented(msg),
        MachinedError::TimeoutError(msg) => Status::deadline_exceeded(msg),
        MachinedError::ResourceExhausted(msg) => Status::resource_exhausted(msg),
        MachinedError::EngineError(msg) => Status::unknown(msg),
        MachinedError::GrpcError(status) => status,
        other => Status::internal(other.to_string()),
    }
}

/// Log a failed capability call and convert it for the caller.
pub(crate) fn call_failed(method: &'static str, err: MachinedError) -> Status {
    tracing::error!(method, error = %err, "CRI call failed");
    to_status(err)
}
