// Execution store - durable record of batches and per-host results
//
// The coordinator talks to persistence only through `ExecutionStore`, so any
// backend that can create, update and read these rows will do.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::inventory::ResolvedHost;
use crate::output::errors::Result;

pub mod memory;
pub mod models;

pub use memory::MemoryStore;
pub use models::{
    BatchExecution, BatchSpec, BatchStatus, ExecutionDetails, ExecutionId, ExecutionPolicy,
    ExecutionRequest, ExecutionSummary, HostExecutionResult, HostStatus, TargetSpec,
};

/// Repository interface for batch executions
#[async_trait]
pub trait ExecutionStore: Send + Sync {
    /// Persist a new batch in `pending` and assign its id
    async fn create_execution(&self, spec: BatchSpec) -> Result<BatchExecution>;

    /// Move a pending batch to `running` and create one `pending` row per
    /// host, in resolved order
    async fn begin_execution(
        &self,
        id: ExecutionId,
        hosts: &[ResolvedHost],
        at: DateTime<Utc>,
    ) -> Result<BatchExecution>;

    /// Fail a pending batch whose targets could not be resolved
    async fn fail_execution(
        &self,
        id: ExecutionId,
        reason: String,
        at: DateTime<Utc>,
    ) -> Result<BatchExecution>;

    /// Overwrite a non-terminal host row (e.g. pending -> running)
    async fn update_host_result(&self, result: &HostExecutionResult) -> Result<()>;

    /// Freeze a host row in a terminal status and bump the batch counters.
    /// Both must happen as one atomic mutation via
    /// [`BatchExecution::record_host_terminal`].
    async fn finish_host(
        &self,
        result: &HostExecutionResult,
        cancel_requested: bool,
        at: DateTime<Utc>,
    ) -> Result<BatchExecution>;

    /// Close a batch that could not be driven to completion host by host.
    /// Open host rows are failed with `reason` and the batch becomes
    /// terminal. Already terminal batches are returned unchanged.
    async fn abort_execution(
        &self,
        id: ExecutionId,
        reason: String,
        cancel_requested: bool,
        at: DateTime<Utc>,
    ) -> Result<BatchExecution>;

    async fn get_execution(&self, id: ExecutionId) -> Result<Option<BatchExecution>>;

    /// Host rows ordered by their position in the resolved host list
    async fn get_host_results(&self, id: ExecutionId) -> Result<Vec<HostExecutionResult>>;

    /// A user's batches, newest first
    async fn list_executions(&self, user_id: &str) -> Result<Vec<BatchExecution>>;
}
