//! Bulk FTP operation engine.
//!
//! See [`ops`] for the module map. Typical flow: build a queue with
//! [`ops::builder`], register it through [`ops::OperationsRegistry`],
//! attach connections via [`ops::WorkerPool::add_worker`], then follow
//! progress through [`ops::Operation`] queries and events.

pub mod ops;

pub use ops::{
    ConnectionToken, EngineError, EngineErrorKind, EngineResult, FtpConnection, ListingEntry,
    OpQueue, Operation, OperationEvent, OperationsRegistry, Worker, WorkerPool,
};
