// Executor module - batch command execution engine

use std::time::Duration;

use async_trait::async_trait;

use crate::inventory::ResolvedHost;
use crate::output::errors::Result;

pub mod coordinator;
pub mod pool;
pub mod retry;
pub mod ssh;

pub use coordinator::ExecutionCoordinator;
pub use pool::{PoolStats, PooledSession, SessionPool};
pub use retry::{calculate_delay, RetryOutcome, RetryPolicy};
pub use ssh::{ConnectionPool, SshCommandRunner, SshSession};

/// Runs one command, once, on one host.
///
/// Implementations own acquiring and returning the transport. A non-zero
/// exit is a normal `Ok` result; only timeouts (`CommandTimeout`) and
/// transport failures (`Connection`) are errors. No retrying happens here.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, host: &ResolvedHost, command: &str, timeout: Duration) -> Result<CommandResult>;
}

/// Result of executing a command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl CommandResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}
