// Execution coordinator - fans one command out over resolved hosts
//
// Batch start is fire-and-forget: `create_execution` validates, persists the
// pending batch and spawns the run. Progress is observed by polling the store
// or through an optional event channel.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use futures::future::join_all;
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::retry::RetryPolicy;
use super::CommandRunner;
use crate::config::EngineConfig;
use crate::inventory::{HostResolver, ResolvedHost};
use crate::output::errors::{BatchError, Result};
use crate::output::events::{create_event_channel, EventEmitter, ExecutionEvent};
use crate::store::{
    BatchExecution, BatchStatus, ExecutionDetails, ExecutionId, ExecutionPolicy,
    ExecutionRequest, ExecutionStore, HostExecutionResult, HostStatus,
};

/// Owns the batch state machine and the cancellation handles of running batches
#[derive(Clone)]
pub struct ExecutionCoordinator {
    store: Arc<dyn ExecutionStore>,
    resolver: HostResolver,
    runner: Arc<dyn CommandRunner>,
    config: Arc<EngineConfig>,
    cancellations: Arc<DashMap<ExecutionId, CancellationToken>>,
}

/// Per-run state shared by every host unit of one batch
struct BatchRun<'a> {
    execution: &'a BatchExecution,
    cancel: &'a CancellationToken,
    events: Option<&'a EventEmitter>,
    halted: AtomicBool,
}

impl BatchRun<'_> {
    fn emit(&self, event: ExecutionEvent) {
        if let Some(events) = self.events {
            events.emit(event);
        }
    }

    /// Whether a host that has not started yet may still be dispatched
    fn may_dispatch(&self) -> bool {
        !self.cancel.is_cancelled() && !self.halted.load(Ordering::SeqCst)
    }
}

impl ExecutionCoordinator {
    pub fn new(
        store: Arc<dyn ExecutionStore>,
        resolver: HostResolver,
        runner: Arc<dyn CommandRunner>,
        config: EngineConfig,
    ) -> Self {
        ExecutionCoordinator {
            store,
            resolver,
            runner,
            config: Arc::new(config),
            cancellations: Arc::new(DashMap::new()),
        }
    }

    /// Validate and persist a batch, then start it in the background
    pub async fn create_execution(&self, request: ExecutionRequest) -> Result<ExecutionId> {
        self.submit(request, None).await
    }

    /// Like `create_execution`, with a push channel of progress events. The
    /// channel closes after the batch's final event.
    pub async fn create_execution_with_events(
        &self,
        request: ExecutionRequest,
    ) -> Result<(ExecutionId, mpsc::UnboundedReceiver<ExecutionEvent>)> {
        let (emitter, rx) = create_event_channel();
        let id = self.submit(request, Some(emitter)).await?;
        Ok((id, rx))
    }

    async fn submit(&self, request: ExecutionRequest, events: Option<EventEmitter>) -> Result<ExecutionId> {
        let spec = request.validate()?;
        let execution = self.store.create_execution(spec).await?;
        let id = execution.id;

        let cancel = CancellationToken::new();
        self.cancellations.insert(id, cancel.clone());

        info!(
            execution_id = %id,
            user = %execution.spec.user_id,
            policy = ?execution.spec.policy,
            "batch execution submitted"
        );

        let coordinator = self.clone();
        tokio::spawn(async move {
            let run = BatchRun {
                execution: &execution,
                cancel: &cancel,
                events: events.as_ref(),
                halted: AtomicBool::new(false),
            };
            coordinator.run(&run).await;
            coordinator.cancellations.remove(&id);
        });

        Ok(id)
    }

    /// Request cancellation. A batch that is already terminal is left alone.
    pub async fn cancel_execution(&self, id: ExecutionId) -> Result<()> {
        let execution = self
            .store
            .get_execution(id)
            .await?
            .ok_or(BatchError::NotFound(id))?;

        if execution.status.is_terminal() {
            debug!(execution_id = %id, status = %execution.status, "cancel ignored, batch already finished");
            return Ok(());
        }

        match self.cancellations.get(&id) {
            Some(token) => {
                token.cancel();
                info!(execution_id = %id, "cancellation requested");
            }
            None => warn!(execution_id = %id, "no running batch to cancel"),
        }
        Ok(())
    }

    pub async fn get_execution_details(&self, id: ExecutionId) -> Result<ExecutionDetails> {
        let execution = self
            .store
            .get_execution(id)
            .await?
            .ok_or(BatchError::NotFound(id))?;
        let hosts = self.store.get_host_results(id).await?;
        Ok(ExecutionDetails { execution, hosts })
    }

    pub async fn list_executions(&self, user_id: &str) -> Result<Vec<BatchExecution>> {
        self.store.list_executions(user_id).await
    }

    /// Poll until the batch is terminal
    pub async fn wait_for_completion(&self, id: ExecutionId, poll: Duration) -> Result<ExecutionDetails> {
        loop {
            let details = self.get_execution_details(id).await?;
            if details.execution.status.is_terminal() {
                return Ok(details);
            }
            tokio::time::sleep(poll).await;
        }
    }

    /// Number of batches whose run task has not finished yet
    pub fn active_executions(&self) -> usize {
        self.cancellations.len()
    }

    /// Drive a batch to a terminal status. Store failures never leave it
    /// `running`: whatever could not be recorded host by host is closed out.
    async fn run(&self, run: &BatchRun<'_>) {
        let id = run.execution.id;
        let status = match self.execute(run).await {
            Ok(Some(status)) => status,
            Ok(None) => return,
            Err(e) => self.abandon(run, &e).await,
        };
        run.emit(ExecutionEvent::Finished {
            execution_id: id,
            status,
        });
    }

    /// Returns the final status, or `None` when target resolution failed
    async fn execute(&self, run: &BatchRun<'_>) -> Result<Option<BatchStatus>> {
        let execution = run.execution;
        let id = execution.id;

        let hosts = match self.resolver.resolve(&execution.spec.target).await {
            Ok(hosts) => hosts,
            Err(e) => {
                warn!(execution_id = %id, error = %e, "target resolution failed");
                self.store.fail_execution(id, e.to_string(), Utc::now()).await?;
                run.emit(ExecutionEvent::ResolutionFailed {
                    execution_id: id,
                    error: e.to_string(),
                });
                return Ok(None);
            }
        };

        self.store.begin_execution(id, &hosts, Utc::now()).await?;
        info!(execution_id = %id, hosts = hosts.len(), "batch execution started");
        run.emit(ExecutionEvent::Started {
            execution_id: id,
            total_hosts: hosts.len(),
        });

        match execution.spec.policy {
            ExecutionPolicy::Parallel => self.run_parallel(run, &hosts).await,
            ExecutionPolicy::Sequential => {
                for (sequence, host) in hosts.iter().enumerate() {
                    self.run_host(run, host, sequence).await;
                }
            }
        }

        let finished = self
            .store
            .get_execution(id)
            .await?
            .ok_or(BatchError::NotFound(id))?;
        if !finished.status.is_terminal() {
            return Err(BatchError::Store(format!(
                "only {} of {} host results were recorded",
                finished.finished_hosts(),
                finished.total_hosts
            )));
        }

        info!(
            execution_id = %id,
            status = %finished.status,
            completed = finished.completed_hosts,
            failed = finished.failed_hosts,
            duration_ms = finished.duration_ms.unwrap_or_default(),
            "batch execution finished"
        );
        Ok(Some(finished.status))
    }

    /// Force a batch terminal after its bookkeeping broke down
    async fn abandon(&self, run: &BatchRun<'_>, cause: &BatchError) -> BatchStatus {
        let id = run.execution.id;
        error!(execution_id = %id, error = %cause, "batch bookkeeping failed, closing batch");

        let reason = format!("execution aborted: {}", cause);
        match self
            .store
            .abort_execution(id, reason, run.cancel.is_cancelled(), Utc::now())
            .await
        {
            Ok(execution) => execution.status,
            Err(e) => {
                error!(execution_id = %id, error = %e, "could not close batch");
                BatchStatus::Failed
            }
        }
    }

    async fn run_parallel(&self, run: &BatchRun<'_>, hosts: &[ResolvedHost]) {
        // Only present when a fan-out cap is configured
        let semaphore = self.config.max_parallel_hosts.map(|max| Arc::new(Semaphore::new(max.max(1))));

        let futures: Vec<_> = hosts
            .iter()
            .enumerate()
            .map(|(sequence, host)| {
                let sem = semaphore.clone();
                async move {
                    let _permit = match &sem {
                        Some(sem) => sem.acquire().await.ok(),
                        None => None,
                    };
                    self.run_host(run, host, sequence).await
                }
            })
            .collect();

        join_all(futures).await;
    }

    /// Drive one host from pending to a terminal status and record it
    async fn run_host(&self, run: &BatchRun<'_>, host: &ResolvedHost, sequence: usize) {
        let spec = &run.execution.spec;
        let id = run.execution.id;
        let mut row = HostExecutionResult::pending(id, host, sequence);

        if run.may_dispatch() {
            row.mark_running(Utc::now());
            match self.store.update_host_result(&row).await {
                Ok(()) => self.attempt_host(run, host, &mut row).await,
                Err(e) => {
                    warn!(execution_id = %id, host = %host.name, error = %e, "could not record host start");
                    row.finish_with_error(&e, 0, Utc::now());
                }
            }
        } else {
            row.cancel_undispatched(Utc::now());
        }

        if spec.stop_on_first_error
            && matches!(row.status, HostStatus::Failed | HostStatus::Timeout)
            && !run.halted.swap(true, Ordering::SeqCst)
        {
            info!(execution_id = %id, host = %host.name, "host failed, remaining hosts will not be dispatched");
        }

        let batch = match self
            .store
            .finish_host(&row, run.cancel.is_cancelled(), Utc::now())
            .await
        {
            Ok(batch) => batch,
            Err(e) => {
                error!(execution_id = %id, host = %host.name, error = %e, "could not record host result");
                return;
            }
        };

        match row.status {
            HostStatus::Completed => debug!(execution_id = %id, host = %host.name, attempts = row.attempts, "host completed"),
            status => warn!(
                execution_id = %id,
                host = %host.name,
                status = %status,
                attempts = row.attempts,
                error = row.error.as_deref().unwrap_or_default(),
                "host did not complete"
            ),
        }

        run.emit(ExecutionEvent::HostFinished {
            execution_id: id,
            host_id: host.id.clone(),
            status: row.status,
            exit_code: row.exit_code,
            completed_hosts: batch.completed_hosts,
            failed_hosts: batch.failed_hosts,
        });
    }

    /// Run the command with retries and fold the outcome into `row`
    async fn attempt_host(&self, run: &BatchRun<'_>, host: &ResolvedHost, row: &mut HostExecutionResult) {
        let spec = &run.execution.spec;
        let id = run.execution.id;
        debug!(execution_id = %id, host = %host.name, "dispatching host");
        run.emit(ExecutionEvent::HostStarted {
            execution_id: id,
            host_id: host.id.clone(),
        });

        let policy = RetryPolicy::from_spec(spec, &self.config);
        let timeout = Duration::from_secs(spec.timeout_secs);
        let runner = self.runner.as_ref();
        let command = spec.command.as_str();
        let outcome = policy
            .execute(run.cancel, move |attempt| {
                if attempt > 1 {
                    run.emit(ExecutionEvent::HostRetrying {
                        execution_id: id,
                        host_id: host.id.clone(),
                        attempt,
                    });
                }
                runner.run(host, command, timeout)
            })
            .await;

        match outcome.result {
            Ok(output) => row.finish_with_output(output, outcome.attempts, Utc::now()),
            Err(e) => row.finish_with_error(&e, outcome.attempts, Utc::now()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::CommandResult;
    use crate::inventory::Inventory;
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::AtomicU32;

    /// Exit code per host id; hosts not listed exit 0
    struct ScriptedRunner {
        exits: HashMap<String, i32>,
        calls: AtomicU32,
    }

    #[async_trait]
    impl CommandRunner for ScriptedRunner {
        async fn run(&self, host: &ResolvedHost, command: &str, _timeout: Duration) -> Result<CommandResult> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(CommandResult {
                stdout: format!("{} ran {}", host.id, command),
                stderr: String::new(),
                exit_code: self.exits.get(&host.id).copied().unwrap_or(0),
            })
        }
    }

    fn coordinator(exits: &[(&str, i32)]) -> (ExecutionCoordinator, Arc<ScriptedRunner>) {
        let mut inventory = Inventory::new();
        for id in ["1", "2", "3"] {
            inventory.add_host(ResolvedHost::for_test(id));
        }
        let inventory = Arc::new(inventory);
        let runner = Arc::new(ScriptedRunner {
            exits: exits.iter().map(|(h, c)| (h.to_string(), *c)).collect(),
            calls: AtomicU32::new(0),
        });
        let coordinator = ExecutionCoordinator::new(
            Arc::new(MemoryStore::new()),
            HostResolver::new(inventory.clone(), inventory),
            runner.clone(),
            EngineConfig::default(),
        );
        (coordinator, runner)
    }

    #[tokio::test]
    async fn test_parallel_all_succeed() {
        let (coordinator, _) = coordinator(&[]);
        let id = coordinator
            .create_execution(ExecutionRequest::new("u", "echo hi").with_hosts(["1", "2", "3"]))
            .await
            .unwrap();

        let details = coordinator
            .wait_for_completion(id, Duration::from_millis(5))
            .await
            .unwrap();
        assert_eq!(details.execution.status, BatchStatus::Completed);
        assert_eq!(details.execution.completed_hosts, 3);
        assert_eq!(details.execution.failed_hosts, 0);
        assert!(details.hosts.iter().all(|h| h.exit_code == Some(0)));
    }

    #[tokio::test]
    async fn test_validation_error_creates_nothing() {
        let (coordinator, _) = coordinator(&[]);
        let err = coordinator
            .create_execution(ExecutionRequest::new("u", "  ").with_hosts(["1"]))
            .await
            .unwrap_err();
        assert!(matches!(err, BatchError::Validation(_)));
        assert!(coordinator.list_executions("u").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_host_fails_before_running() {
        let (coordinator, runner) = coordinator(&[]);
        let (id, mut events) = coordinator
            .create_execution_with_events(ExecutionRequest::new("u", "echo").with_hosts(["1", "nope"]))
            .await
            .unwrap();

        let event = events.recv().await.unwrap();
        assert!(matches!(event, ExecutionEvent::ResolutionFailed { .. }));

        let details = coordinator.get_execution_details(id).await.unwrap();
        assert_eq!(details.execution.status, BatchStatus::Failed);
        assert!(details.execution.start_time.is_none());
        assert!(details.hosts.is_empty());
        assert_eq!(runner.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_sequential_stop_on_first_error() {
        let (coordinator, runner) = coordinator(&[("2", 1)]);
        let request = ExecutionRequest::new("u", "deploy")
            .with_hosts(["1", "2", "3"])
            .with_policy(ExecutionPolicy::Sequential)
            .with_stop_on_first_error(true);
        let id = coordinator.create_execution(request).await.unwrap();

        let details = coordinator
            .wait_for_completion(id, Duration::from_millis(5))
            .await
            .unwrap();
        let statuses: Vec<_> = details.hosts.iter().map(|h| h.status).collect();
        assert_eq!(
            statuses,
            vec![HostStatus::Completed, HostStatus::Failed, HostStatus::Cancelled]
        );
        assert!(details.hosts[2].start_time.is_none());
        assert_eq!(details.execution.status, BatchStatus::Failed);
        assert_eq!(runner.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_cancel_unknown_and_finished() {
        let (coordinator, _) = coordinator(&[]);
        let err = coordinator.cancel_execution(uuid::Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, BatchError::NotFound(_)));

        let id = coordinator
            .create_execution(ExecutionRequest::new("u", "true").with_hosts(["1"]))
            .await
            .unwrap();
        coordinator
            .wait_for_completion(id, Duration::from_millis(5))
            .await
            .unwrap();
        coordinator.cancel_execution(id).await.unwrap();

        let details = coordinator.get_execution_details(id).await.unwrap();
        assert_eq!(details.execution.status, BatchStatus::Completed);
    }
}
