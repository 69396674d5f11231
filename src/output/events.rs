// Event system for push-style progress updates

use tokio::sync::mpsc;

use crate::inventory::HostId;
use crate::store::{BatchStatus, ExecutionId, HostStatus};

/// Events emitted while a batch runs
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionEvent {
    /// Targets resolved, batch is running
    Started {
        execution_id: ExecutionId,
        total_hosts: usize,
    },

    /// Targets could not be resolved; batch failed before dispatch
    ResolutionFailed {
        execution_id: ExecutionId,
        error: String,
    },

    /// First attempt on a host is starting
    HostStarted {
        execution_id: ExecutionId,
        host_id: HostId,
    },

    /// A retry attempt on a host is starting
    HostRetrying {
        execution_id: ExecutionId,
        host_id: HostId,
        attempt: u32,
    },

    /// Host reached a terminal status
    HostFinished {
        execution_id: ExecutionId,
        host_id: HostId,
        status: HostStatus,
        exit_code: Option<i32>,
        completed_hosts: usize,
        failed_hosts: usize,
    },

    /// Batch reached a terminal status
    Finished {
        execution_id: ExecutionId,
        status: BatchStatus,
    },
}

impl ExecutionEvent {
    pub fn execution_id(&self) -> ExecutionId {
        match self {
            ExecutionEvent::Started { execution_id, .. }
            | ExecutionEvent::ResolutionFailed { execution_id, .. }
            | ExecutionEvent::HostStarted { execution_id, .. }
            | ExecutionEvent::HostRetrying { execution_id, .. }
            | ExecutionEvent::HostFinished { execution_id, .. }
            | ExecutionEvent::Finished { execution_id, .. } => *execution_id,
        }
    }

    /// Last event a subscriber will see for this batch
    pub fn is_final(&self) -> bool {
        matches!(
            self,
            ExecutionEvent::Finished { .. } | ExecutionEvent::ResolutionFailed { .. }
        )
    }
}

/// Event emitter for sending execution events; sends never block and a
/// dropped receiver is ignored
#[derive(Clone)]
pub struct EventEmitter {
    tx: mpsc::UnboundedSender<ExecutionEvent>,
}

impl EventEmitter {
    /// Create a new event emitter with the given channel
    pub fn new(tx: mpsc::UnboundedSender<ExecutionEvent>) -> Self {
        EventEmitter { tx }
    }

    pub fn emit(&self, event: ExecutionEvent) {
        let _ = self.tx.send(event);
    }
}

/// Create a new event channel
pub fn create_event_channel() -> (EventEmitter, mpsc::UnboundedReceiver<ExecutionEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (EventEmitter::new(tx), rx)
}
