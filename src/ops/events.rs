//! State-change events published by an operation.
//!
//! Observers (tests, a CLI, a GUI progress dialog) subscribe to the
//! operation's broadcast channel and render independently; the engine
//! never calls into UI code. The channel is lossy for slow receivers;
//! queries on the operation remain the source of truth.

use serde::{Deserialize, Serialize};

use crate::ops::item::{ItemState, Problem};
use crate::ops::types::{ChildCounts, OperationState};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "event")]
pub enum OperationEvent {
    /// One item changed state.
    ItemTransition {
        uid: u64,
        state: ItemState,
        problem: Option<Problem>,
    },
    /// Aggregate counters changed (same instant as the causing transition).
    CountsChanged { counts: ChildCounts },
    /// Live transfer progress tick.
    Progress { transferred: u64, total: u64 },
    /// A worker hit a connection-level error and stopped.
    WorkerError { worker_id: usize, message: String },
    /// Free space on the download target volume fell below the bytes
    /// still needed. Advisory only.
    DiskSpaceWarning { free: u64, needed: u64 },
    /// The operation reached a terminal state.
    Finished { state: OperationState },
}
