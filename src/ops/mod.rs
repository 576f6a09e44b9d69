//! # bulkftp - Bulk FTP Operation Engine
//!
//! Durable, resumable bulk operations (delete, copy, move, change
//! attributes) over one or more FTP connections, built around an
//! explicit work queue that survives disconnects and partial failures.
//!
//! Architecture:
//! - `types` - policies, configuration, counters, progress snapshots
//! - `error` - engine error type
//! - `item` - queue item kinds, state machine, problem taxonomy
//! - `queue` - ordered item store: claim, expansion, progress queries
//! - `operation` - one running operation (queue + policies + events)
//! - `progress` - speed meter, ETA smoothing, shared byte counters
//! - `events` - broadcast events observers subscribe to
//! - `connection` - the connection contract workers drive
//! - `worker` - claim/execute/report loop, one per connection
//! - `pool` - worker lifecycle and connection handoff
//! - `registry` - running operations, cross-operation conflict checks
//! - `builder` - initial queues from panel selections

pub mod types;
pub mod error;
pub mod item;
pub mod queue;
pub mod operation;
pub mod progress;
pub mod events;
pub mod connection;
pub mod worker;
pub mod pool;
pub mod registry;
pub mod builder;

// Re-exports for lib.rs consumers
pub use types::*;
pub use error::{EngineError, EngineErrorKind, EngineResult};
pub use item::{ItemKind, ItemState, Problem, ProblemClass, QueueItem, Resolution, SolveOutcome};
pub use queue::OpQueue;
pub use operation::Operation;
pub use connection::{ConnectionToken, FtpConnection, ListingEntry, TransferCtl};
pub use worker::{Worker, WorkerState};
pub use pool::WorkerPool;
pub use registry::OperationsRegistry;
pub use events::OperationEvent;
