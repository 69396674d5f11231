// Fleetbatch - run one shell command across many hosts over pooled SSH
//
// Batches are fanned out in parallel or sequentially, with per-host timeout,
// retry with backoff, live progress and mid-flight cancellation.

pub mod config;
pub mod executor;
pub mod inventory;
pub mod output;
pub mod store;

pub use config::EngineConfig;
pub use executor::{CommandResult, CommandRunner, ConnectionPool, ExecutionCoordinator, SshCommandRunner};
pub use inventory::{HostResolver, Inventory, ResolvedHost};
pub use output::{BatchError, ExecutionEvent, TerminalOutput};
pub use store::{ExecutionRequest, ExecutionStore, MemoryStore};

/// Version of the fleetbatch tool
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::EngineConfig;
    pub use crate::executor::{CommandResult, CommandRunner, ExecutionCoordinator};
    pub use crate::inventory::{GroupDirectory, HostDirectory, HostResolver, Inventory, ResolvedHost};
    pub use crate::output::{BatchError, ExecutionEvent};
    pub use crate::store::{
        BatchStatus, ExecutionPolicy, ExecutionRequest, ExecutionStore, HostStatus, MemoryStore,
    };
}
