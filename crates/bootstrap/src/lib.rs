pub mod chunk;
pub mod error;
pub mod executor;
pub mod failures;
pub mod lock;
pub mod state;

pub use chunk::{pack_batches, Batch, ChunkSource, SourceChunk, WorkspaceMemorySource};
pub use error::BootstrapError;
pub use executor::{
    run_bootstrap, run_bootstrap_retry, run_bootstrap_tick, BootstrapRun, RetryOptions, TickReport,
};
pub use failures::{FailureErrorType, FailureLog, FailureLogEntry};
pub use lock::{BootstrapLock, LockGuard};
pub use state::{BootstrapState, BootstrapStatus};
