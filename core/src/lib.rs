//! machined Core - building blocks for the machined CRI shim
//!
//! Everything here is independent of the RPC transport: the error
//! taxonomy, startup configuration, the single-instance lock and its
//! contention watch, and the bounded worker pool.

pub mod config;
pub mod contention;
pub mod error;
pub mod exec;
pub mod lock;
pub mod parallel;

// Re-export commonly used types
pub use config::ShimConfig;
pub use contention::{watch_for_contention, ContentionEvent, ContentionWatch, DoneSignal};
pub use error::{MachinedError, Result};
pub use exec::ExecOutput;
pub use lock::InstanceLock;
pub use parallel::{parallelize, TaskPanic};

/// machined version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
