// In-memory execution store

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use uuid::Uuid;

use super::models::{BatchExecution, BatchSpec, ExecutionId, HostExecutionResult};
use super::ExecutionStore;
use crate::inventory::ResolvedHost;
use crate::output::errors::{BatchError, Result};

struct StoredExecution {
    execution: BatchExecution,
    hosts: Vec<HostExecutionResult>,
}

/// Process-local store; every mutation of a batch happens under one lock
#[derive(Default)]
pub struct MemoryStore {
    executions: Mutex<HashMap<ExecutionId, StoredExecution>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn host_index(stored: &StoredExecution, result: &HostExecutionResult) -> Result<usize> {
    stored
        .hosts
        .iter()
        .position(|h| h.host_id == result.host_id)
        .ok_or_else(|| {
            BatchError::Store(format!(
                "host {} is not part of execution {}",
                result.host_id, result.execution_id
            ))
        })
}

#[async_trait]
impl ExecutionStore for MemoryStore {
    async fn create_execution(&self, spec: BatchSpec) -> Result<BatchExecution> {
        let execution = BatchExecution::new(Uuid::new_v4(), spec, Utc::now());
        self.executions.lock().insert(
            execution.id,
            StoredExecution {
                execution: execution.clone(),
                hosts: Vec::new(),
            },
        );
        Ok(execution)
    }

    async fn begin_execution(
        &self,
        id: ExecutionId,
        hosts: &[ResolvedHost],
        at: DateTime<Utc>,
    ) -> Result<BatchExecution> {
        let mut executions = self.executions.lock();
        let stored = executions.get_mut(&id).ok_or(BatchError::NotFound(id))?;

        stored.execution.begin(hosts.len(), at)?;
        stored.hosts = hosts
            .iter()
            .enumerate()
            .map(|(seq, host)| HostExecutionResult::pending(id, host, seq))
            .collect();

        Ok(stored.execution.clone())
    }

    async fn fail_execution(
        &self,
        id: ExecutionId,
        reason: String,
        at: DateTime<Utc>,
    ) -> Result<BatchExecution> {
        let mut executions = self.executions.lock();
        let stored = executions.get_mut(&id).ok_or(BatchError::NotFound(id))?;
        stored.execution.fail_before_start(reason, at)?;
        Ok(stored.execution.clone())
    }

    async fn update_host_result(&self, result: &HostExecutionResult) -> Result<()> {
        let mut executions = self.executions.lock();
        let stored = executions
            .get_mut(&result.execution_id)
            .ok_or(BatchError::NotFound(result.execution_id))?;

        let idx = host_index(stored, result)?;
        if stored.hosts[idx].status.is_terminal() {
            return Err(BatchError::Store(format!(
                "host {} is already {}",
                result.host_id, stored.hosts[idx].status
            )));
        }
        stored.hosts[idx] = result.clone();
        Ok(())
    }

    async fn finish_host(
        &self,
        result: &HostExecutionResult,
        cancel_requested: bool,
        at: DateTime<Utc>,
    ) -> Result<BatchExecution> {
        let mut executions = self.executions.lock();
        let stored = executions
            .get_mut(&result.execution_id)
            .ok_or(BatchError::NotFound(result.execution_id))?;

        let idx = host_index(stored, result)?;
        if stored.hosts[idx].status.is_terminal() {
            return Err(BatchError::Store(format!(
                "host {} is already {}",
                result.host_id, stored.hosts[idx].status
            )));
        }

        stored
            .execution
            .record_host_terminal(result.status, cancel_requested, at)?;
        stored.hosts[idx] = result.clone();

        Ok(stored.execution.clone())
    }

    async fn abort_execution(
        &self,
        id: ExecutionId,
        reason: String,
        cancel_requested: bool,
        at: DateTime<Utc>,
    ) -> Result<BatchExecution> {
        let mut executions = self.executions.lock();
        let stored = executions.get_mut(&id).ok_or(BatchError::NotFound(id))?;
        if stored.execution.status.is_terminal() {
            return Ok(stored.execution.clone());
        }

        for row in stored.hosts.iter_mut().filter(|h| !h.status.is_terminal()) {
            row.abort(&reason, at);
        }
        stored.execution.abort(reason, cancel_requested, at)?;
        Ok(stored.execution.clone())
    }

    async fn get_execution(&self, id: ExecutionId) -> Result<Option<BatchExecution>> {
        Ok(self
            .executions
            .lock()
            .get(&id)
            .map(|stored| stored.execution.clone()))
    }

    async fn get_host_results(&self, id: ExecutionId) -> Result<Vec<HostExecutionResult>> {
        let executions = self.executions.lock();
        let stored = executions.get(&id).ok_or(BatchError::NotFound(id))?;
        Ok(stored.hosts.clone())
    }

    async fn list_executions(&self, user_id: &str) -> Result<Vec<BatchExecution>> {
        let mut list: Vec<BatchExecution> = self
            .executions
            .lock()
            .values()
            .filter(|stored| stored.execution.spec.user_id == user_id)
            .map(|stored| stored.execution.clone())
            .collect();
        list.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(list)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{BatchStatus, ExecutionRequest, HostStatus};

    fn hosts() -> Vec<ResolvedHost> {
        vec![ResolvedHost::for_test("a"), ResolvedHost::for_test("b")]
    }

    async fn started(store: &MemoryStore) -> BatchExecution {
        let spec = ExecutionRequest::new("u1", "true")
            .with_hosts(["a", "b"])
            .validate()
            .unwrap();
        let exec = store.create_execution(spec).await.unwrap();
        store
            .begin_execution(exec.id, &hosts(), Utc::now())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_begin_creates_pending_rows_in_order() {
        let store = MemoryStore::new();
        let exec = started(&store).await;
        assert_eq!(exec.status, BatchStatus::Running);
        assert_eq!(exec.total_hosts, 2);

        let rows = store.get_host_results(exec.id).await.unwrap();
        let ids: Vec<_> = rows.iter().map(|r| r.host_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert!(rows.iter().all(|r| r.status == HostStatus::Pending));
    }

    #[tokio::test]
    async fn test_terminal_rows_are_frozen() {
        let store = MemoryStore::new();
        let exec = started(&store).await;
        let mut row = store.get_host_results(exec.id).await.unwrap().remove(0);

        row.cancel_undispatched(Utc::now());
        store.finish_host(&row, false, Utc::now()).await.unwrap();

        assert!(store.update_host_result(&row).await.is_err());
        assert!(store.finish_host(&row, false, Utc::now()).await.is_err());

        let exec = store.get_execution(exec.id).await.unwrap().unwrap();
        assert_eq!(exec.failed_hosts, 1);
        assert_eq!(exec.status, BatchStatus::Running);
    }

    #[tokio::test]
    async fn test_abort_closes_open_rows() {
        let store = MemoryStore::new();
        let exec = started(&store).await;
        let mut rows = store.get_host_results(exec.id).await.unwrap();

        rows[0].mark_running(Utc::now());
        rows[0].cancel_undispatched(Utc::now());
        store.finish_host(&rows[0], false, Utc::now()).await.unwrap();
        rows[1].mark_running(Utc::now());
        store.update_host_result(&rows[1]).await.unwrap();

        let exec = store
            .abort_execution(exec.id, "lost track".into(), false, Utc::now())
            .await
            .unwrap();
        assert_eq!(exec.status, BatchStatus::Failed);
        assert_eq!(exec.failed_hosts, 2);
        assert!(exec.progress_consistent());

        let rows = store.get_host_results(exec.id).await.unwrap();
        assert_eq!(rows[0].status, HostStatus::Cancelled);
        assert_eq!(rows[1].status, HostStatus::Failed);
        assert_eq!(rows[1].error.as_deref(), Some("lost track"));
        assert!(rows[1].end_time.is_some());
    }

    #[tokio::test]
    async fn test_unknown_execution() {
        let store = MemoryStore::new();
        let id = Uuid::new_v4();
        assert!(store.get_execution(id).await.unwrap().is_none());
        assert!(matches!(
            store.get_host_results(id).await,
            Err(BatchError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_list_filters_by_user() {
        let store = MemoryStore::new();
        started(&store).await;
        started(&store).await;
        assert_eq!(store.list_executions("u1").await.unwrap().len(), 2);
        assert!(store.list_executions("u2").await.unwrap().is_empty());
    }
}
