// Batch execution records and per-host results

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::executor::CommandResult;
use crate::inventory::{GroupId, HostId, ResolvedHost};
use crate::output::errors::{BatchError, Result};

/// Opaque batch identifier, assigned by the store
pub type ExecutionId = Uuid;

/// How resolved hosts are dispatched
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionPolicy {
    #[default]
    Parallel,
    Sequential,
}

/// Lifecycle of a batch job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl BatchStatus {
    pub fn is_terminal(self) -> bool {
        match self {
            BatchStatus::Pending | BatchStatus::Running => false,
            BatchStatus::Completed | BatchStatus::Failed | BatchStatus::Cancelled => true,
        }
    }

    /// Allowed edges of the batch state machine
    pub fn can_transition_to(self, next: BatchStatus) -> bool {
        use BatchStatus::*;

        match (self, next) {
            (Pending, Running) | (Pending, Failed) => true,
            (Running, Completed) | (Running, Failed) | (Running, Cancelled) => true,
            (Pending, _) | (Running, _) => false,
            (Completed, _) | (Failed, _) | (Cancelled, _) => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BatchStatus::Pending => "pending",
            BatchStatus::Running => "running",
            BatchStatus::Completed => "completed",
            BatchStatus::Failed => "failed",
            BatchStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of a single host within a batch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HostStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Timeout,
    Cancelled,
}

impl HostStatus {
    pub fn is_terminal(self) -> bool {
        match self {
            HostStatus::Pending | HostStatus::Running => false,
            HostStatus::Completed
            | HostStatus::Failed
            | HostStatus::Timeout
            | HostStatus::Cancelled => true,
        }
    }

    /// Terminal outcomes that count against the batch
    pub fn is_failure(self) -> bool {
        matches!(
            self,
            HostStatus::Failed | HostStatus::Timeout | HostStatus::Cancelled
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            HostStatus::Pending => "pending",
            HostStatus::Running => "running",
            HostStatus::Completed => "completed",
            HostStatus::Failed => "failed",
            HostStatus::Timeout => "timeout",
            HostStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for HostStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which hosts a batch targets
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetSpec {
    Group(GroupId),
    Hosts(Vec<HostId>),
}

/// A batch request as it arrives from the outside world, before validation
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ExecutionRequest {
    pub user_id: String,
    pub name: Option<String>,
    pub description: Option<String>,
    pub command: String,
    pub execution_type: ExecutionPolicy,
    /// Per-host timeout in seconds
    pub timeout: i64,
    pub retry_count: i32,
    /// Base retry delay in seconds
    pub retry_delay: f64,
    pub stop_on_first_error: bool,
    pub retry_on_failure: bool,
    pub server_group_id: Option<GroupId>,
    pub server_ids: Vec<HostId>,
}

impl Default for ExecutionRequest {
    fn default() -> Self {
        ExecutionRequest {
            user_id: String::new(),
            name: None,
            description: None,
            command: String::new(),
            execution_type: ExecutionPolicy::Parallel,
            timeout: 300,
            retry_count: 0,
            retry_delay: 5.0,
            stop_on_first_error: false,
            retry_on_failure: false,
            server_group_id: None,
            server_ids: Vec::new(),
        }
    }
}

impl ExecutionRequest {
    pub fn new(user_id: impl Into<String>, command: impl Into<String>) -> Self {
        ExecutionRequest {
            user_id: user_id.into(),
            command: command.into(),
            ..Default::default()
        }
    }

    pub fn with_hosts<I, S>(mut self, hosts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<HostId>,
    {
        self.server_ids = hosts.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_group(mut self, group: impl Into<GroupId>) -> Self {
        self.server_group_id = Some(group.into());
        self
    }

    pub fn with_policy(mut self, policy: ExecutionPolicy) -> Self {
        self.execution_type = policy;
        self
    }

    pub fn with_timeout(mut self, secs: i64) -> Self {
        self.timeout = secs;
        self
    }

    pub fn with_retries(mut self, count: i32, delay_secs: f64) -> Self {
        self.retry_count = count;
        self.retry_delay = delay_secs;
        self
    }

    pub fn with_stop_on_first_error(mut self, stop: bool) -> Self {
        self.stop_on_first_error = stop;
        self
    }

    pub fn with_retry_on_failure(mut self, retry: bool) -> Self {
        self.retry_on_failure = retry;
        self
    }

    /// Check the request shape and turn it into stored batch inputs
    pub fn validate(self) -> Result<BatchSpec> {
        if self.command.trim().is_empty() {
            return Err(BatchError::Validation("command must not be empty".into()));
        }
        if self.timeout <= 0 {
            return Err(BatchError::Validation(format!(
                "timeout must be positive, got {}",
                self.timeout
            )));
        }
        if self.retry_count < 0 {
            return Err(BatchError::Validation(format!(
                "retry count must not be negative, got {}",
                self.retry_count
            )));
        }
        if self.retry_delay <= 0.0 || Duration::try_from_secs_f64(self.retry_delay).is_err() {
            return Err(BatchError::Validation(format!(
                "retry delay must be a positive number of seconds, got {}",
                self.retry_delay
            )));
        }

        let group = self.server_group_id.filter(|g| !g.trim().is_empty());
        let target = match (group, self.server_ids.is_empty()) {
            (Some(group), true) => TargetSpec::Group(group),
            (None, false) => TargetSpec::Hosts(self.server_ids),
            (Some(_), false) => {
                return Err(BatchError::Validation(
                    "specify either a server group or explicit hosts, not both".into(),
                ))
            }
            (None, true) => {
                return Err(BatchError::Validation("no target hosts given".into()));
            }
        };

        Ok(BatchSpec {
            user_id: self.user_id,
            name: self.name,
            description: self.description,
            command: self.command,
            policy: self.execution_type,
            timeout_secs: self.timeout as u64,
            retry_count: self.retry_count as u32,
            retry_delay_secs: self.retry_delay,
            stop_on_first_error: self.stop_on_first_error,
            retry_on_failure: self.retry_on_failure,
            target,
        })
    }
}

/// Validated, immutable inputs of a batch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchSpec {
    pub user_id: String,
    pub name: Option<String>,
    pub description: Option<String>,
    pub command: String,
    pub policy: ExecutionPolicy,
    pub timeout_secs: u64,
    pub retry_count: u32,
    pub retry_delay_secs: f64,
    pub stop_on_first_error: bool,
    pub retry_on_failure: bool,
    pub target: TargetSpec,
}

/// One batch job and its aggregate progress
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchExecution {
    pub id: ExecutionId,
    pub spec: BatchSpec,
    pub status: BatchStatus,
    pub total_hosts: usize,
    pub completed_hosts: usize,
    pub failed_hosts: usize,
    pub created_at: DateTime<Utc>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    /// Why the batch ended early: a resolution failure, or bookkeeping that
    /// could not be completed
    pub error: Option<String>,
}

impl BatchExecution {
    pub fn new(id: ExecutionId, spec: BatchSpec, created_at: DateTime<Utc>) -> Self {
        BatchExecution {
            id,
            spec,
            status: BatchStatus::Pending,
            total_hosts: 0,
            completed_hosts: 0,
            failed_hosts: 0,
            created_at,
            start_time: None,
            end_time: None,
            duration_ms: None,
            error: None,
        }
    }

    fn transition(&mut self, next: BatchStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(BatchError::Store(format!(
                "execution {} cannot move from {} to {}",
                self.id, self.status, next
            )));
        }
        self.status = next;
        Ok(())
    }

    /// pending -> running once the host list is known
    pub fn begin(&mut self, total_hosts: usize, at: DateTime<Utc>) -> Result<()> {
        if total_hosts == 0 {
            return Err(BatchError::EmptyTarget);
        }
        self.transition(BatchStatus::Running)?;
        self.total_hosts = total_hosts;
        self.start_time = Some(at);
        Ok(())
    }

    /// pending -> failed when targets cannot be resolved
    pub fn fail_before_start(&mut self, reason: String, at: DateTime<Utc>) -> Result<()> {
        self.transition(BatchStatus::Failed)?;
        self.error = Some(reason);
        self.end_time = Some(at);
        Ok(())
    }

    /// Count one host reaching a terminal status. When the last host lands
    /// the batch itself becomes terminal in the same mutation, so pollers
    /// never observe full counters on a running batch.
    pub fn record_host_terminal(
        &mut self,
        status: HostStatus,
        cancel_requested: bool,
        at: DateTime<Utc>,
    ) -> Result<()> {
        if self.status != BatchStatus::Running {
            return Err(BatchError::Store(format!(
                "execution {} is {}, cannot record host results",
                self.id, self.status
            )));
        }
        if !status.is_terminal() {
            return Err(BatchError::Store(format!(
                "host status {} is not terminal",
                status
            )));
        }
        if self.finished_hosts() >= self.total_hosts {
            return Err(BatchError::Store(format!(
                "execution {} already accounted for all {} hosts",
                self.id, self.total_hosts
            )));
        }

        if status.is_failure() {
            self.failed_hosts += 1;
        } else {
            self.completed_hosts += 1;
        }

        if self.finished_hosts() == self.total_hosts {
            let next = if cancel_requested {
                BatchStatus::Cancelled
            } else if self.failed_hosts == 0 {
                BatchStatus::Completed
            } else {
                BatchStatus::Failed
            };
            self.transition(next)?;
            self.end_time = Some(at);
            self.duration_ms = self
                .start_time
                .map(|start| (at - start).num_milliseconds());
        }

        Ok(())
    }

    /// Force the batch terminal when its hosts can no longer be recorded one
    /// by one. Hosts not yet accounted for count as failed.
    pub fn abort(&mut self, reason: String, cancel_requested: bool, at: DateTime<Utc>) -> Result<()> {
        match self.status {
            BatchStatus::Pending => self.fail_before_start(reason, at),
            BatchStatus::Running => {
                let next = if cancel_requested {
                    BatchStatus::Cancelled
                } else {
                    BatchStatus::Failed
                };
                self.transition(next)?;
                self.failed_hosts = self.total_hosts.saturating_sub(self.completed_hosts);
                self.error = Some(reason);
                self.end_time = Some(at);
                self.duration_ms = self
                    .start_time
                    .map(|start| (at - start).num_milliseconds());
                Ok(())
            }
            BatchStatus::Completed | BatchStatus::Failed | BatchStatus::Cancelled => Ok(()),
        }
    }

    pub fn finished_hosts(&self) -> usize {
        self.completed_hosts + self.failed_hosts
    }

    /// `completed + failed <= total`, with equality exactly when terminal
    pub fn progress_consistent(&self) -> bool {
        let finished = self.finished_hosts();
        finished <= self.total_hosts && (finished == self.total_hosts) == self.status.is_terminal()
    }
}

/// One host's row within a batch
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostExecutionResult {
    pub execution_id: ExecutionId,
    pub host_id: HostId,
    pub host_name: String,
    /// Position in the resolved host list
    pub sequence: usize,
    pub status: HostStatus,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub attempts: u32,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub error: Option<String>,
}

impl HostExecutionResult {
    pub fn pending(execution_id: ExecutionId, host: &ResolvedHost, sequence: usize) -> Self {
        HostExecutionResult {
            execution_id,
            host_id: host.id.clone(),
            host_name: host.name.clone(),
            sequence,
            status: HostStatus::Pending,
            exit_code: None,
            stdout: String::new(),
            stderr: String::new(),
            attempts: 0,
            start_time: None,
            end_time: None,
            duration_ms: None,
            error: None,
        }
    }

    pub fn mark_running(&mut self, at: DateTime<Utc>) {
        self.status = HostStatus::Running;
        self.start_time = Some(at);
    }

    /// Record a command that ran to completion; exit 0 is success
    pub fn finish_with_output(&mut self, output: CommandResult, attempts: u32, at: DateTime<Utc>) {
        if output.success() {
            self.status = HostStatus::Completed;
            self.error = None;
        } else {
            self.status = HostStatus::Failed;
            self.error = Some(
                BatchError::NonZeroExit {
                    host: self.host_name.clone(),
                    exit_code: output.exit_code,
                }
                .to_string(),
            );
        }
        self.exit_code = Some(output.exit_code);
        self.stdout = output.stdout;
        self.stderr = output.stderr;
        self.finish(attempts, at);
    }

    /// Record an attempt sequence that ended without a process exit
    pub fn finish_with_error(&mut self, error: &BatchError, attempts: u32, at: DateTime<Utc>) {
        self.status = match error {
            BatchError::CommandTimeout { .. } => HostStatus::Timeout,
            BatchError::Cancelled => HostStatus::Cancelled,
            _ => HostStatus::Failed,
        };
        self.exit_code = None;
        self.error = Some(error.to_string());
        self.finish(attempts, at);
    }

    /// Mark a host that was never dispatched
    pub fn cancel_undispatched(&mut self, at: DateTime<Utc>) {
        self.status = HostStatus::Cancelled;
        self.error = Some(BatchError::Cancelled.to_string());
        self.end_time = Some(at);
    }

    /// Close a row left open when its batch was aborted
    pub fn abort(&mut self, reason: &str, at: DateTime<Utc>) {
        self.status = HostStatus::Failed;
        self.error = Some(reason.to_string());
        let attempts = self.attempts;
        self.finish(attempts, at);
    }

    fn finish(&mut self, attempts: u32, at: DateTime<Utc>) {
        self.attempts = attempts;
        self.end_time = Some(at);
        self.duration_ms = self
            .start_time
            .map(|start| (at - start).num_milliseconds());
    }
}

/// A batch together with its per-host rows, as returned to pollers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionDetails {
    pub execution: BatchExecution,
    pub hosts: Vec<HostExecutionResult>,
}

/// Read-side aggregate over a batch's host rows
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ExecutionSummary {
    pub total: usize,
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub timed_out: usize,
    pub cancelled: usize,
    pub success_rate: f64,
    pub average_host_duration_ms: Option<f64>,
}

impl ExecutionDetails {
    pub fn summary(&self) -> ExecutionSummary {
        let mut summary = ExecutionSummary {
            total: self.hosts.len(),
            ..Default::default()
        };

        for host in &self.hosts {
            match host.status {
                HostStatus::Pending => summary.pending += 1,
                HostStatus::Running => summary.running += 1,
                HostStatus::Completed => summary.completed += 1,
                HostStatus::Failed => summary.failed += 1,
                HostStatus::Timeout => summary.timed_out += 1,
                HostStatus::Cancelled => summary.cancelled += 1,
            }
        }

        if summary.total > 0 {
            summary.success_rate = summary.completed as f64 / summary.total as f64;
        }

        let durations: Vec<i64> = self.hosts.iter().filter_map(|h| h.duration_ms).collect();
        if !durations.is_empty() {
            summary.average_host_duration_ms =
                Some(durations.iter().sum::<i64>() as f64 / durations.len() as f64);
        }

        summary
    }
}
