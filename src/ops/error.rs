//! Engine-specific error type.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Categorised engine error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineError {
    pub kind: EngineErrorKind,
    pub message: String,
    /// UID of the queue item the error relates to, if any.
    pub item_uid: Option<u64>,
    /// Operation id the error relates to, if any.
    pub operation_id: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum EngineErrorKind {
    /// Control or data connection dropped mid-operation.
    ConnectionLost,
    /// Wrong username/password reported by the server.
    LoginFailed,
    /// TLS handshake produced a certificate the session does not trust.
    CertificateUnverified,
    /// Server rejected a command for this item (4xx/5xx class).
    CommandRejected,
    /// Target already exists (file, directory, or link in the way).
    AlreadyExists,
    /// File/directory not found.
    NotFound,
    /// Permission denied on the server or on local disk.
    PermissionDenied,
    /// Transient server race (listing momentarily stale, busy, etc.).
    TransientProtocol,
    /// Local I/O error (target file read/write, source open).
    Io,
    /// Local disk is full.
    DiskFull,
    /// Transfer ended before all bytes moved.
    IncompleteTransfer,
    /// Transfer aborted by a stop request.
    Aborted,
    /// Allocation failure while growing the queue.
    OutOfMemory,
    /// Operation / worker / item lookup failed.
    UnknownId,
    /// Illegal item state transition was requested.
    IllegalTransition,
    /// Config / parameter validation error.
    InvalidConfig,
}

pub type EngineResult<T> = Result<T, EngineError>;

// ── Construction helpers ─────────────────────────────────────────────

impl EngineError {
    pub fn new(kind: EngineErrorKind, msg: impl Into<String>) -> Self {
        Self {
            kind,
            message: msg.into(),
            item_uid: None,
            operation_id: None,
        }
    }

    pub fn with_item(mut self, uid: u64) -> Self {
        self.item_uid = Some(uid);
        self
    }

    pub fn with_operation(mut self, id: impl Into<String>) -> Self {
        self.operation_id = Some(id.into());
        self
    }

    // ── Convenience constructors ─────────────────────────────────

    pub fn connection_lost(msg: impl Into<String>) -> Self {
        Self::new(EngineErrorKind::ConnectionLost, msg)
    }

    pub fn login_failed(msg: impl Into<String>) -> Self {
        Self::new(EngineErrorKind::LoginFailed, msg)
    }

    pub fn certificate_unverified(msg: impl Into<String>) -> Self {
        Self::new(EngineErrorKind::CertificateUnverified, msg)
    }

    pub fn command_rejected(msg: impl Into<String>) -> Self {
        Self::new(EngineErrorKind::CommandRejected, msg)
    }

    pub fn already_exists(msg: impl Into<String>) -> Self {
        Self::new(EngineErrorKind::AlreadyExists, msg)
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::new(EngineErrorKind::NotFound, msg)
    }

    pub fn transient(msg: impl Into<String>) -> Self {
        Self::new(EngineErrorKind::TransientProtocol, msg)
    }

    pub fn io_error(msg: impl Into<String>) -> Self {
        Self::new(EngineErrorKind::Io, msg)
    }

    pub fn incomplete(msg: impl Into<String>) -> Self {
        Self::new(EngineErrorKind::IncompleteTransfer, msg)
    }

    pub fn aborted(msg: impl Into<String>) -> Self {
        Self::new(EngineErrorKind::Aborted, msg)
    }

    pub fn out_of_memory(msg: impl Into<String>) -> Self {
        Self::new(EngineErrorKind::OutOfMemory, msg)
    }

    pub fn unknown_id(msg: impl Into<String>) -> Self {
        Self::new(EngineErrorKind::UnknownId, msg)
    }

    pub fn illegal_transition(msg: impl Into<String>) -> Self {
        Self::new(EngineErrorKind::IllegalTransition, msg)
    }

    pub fn invalid_config(msg: impl Into<String>) -> Self {
        Self::new(EngineErrorKind::InvalidConfig, msg)
    }

    /// Whether the error is recoverable by a fresh attempt with the same
    /// connection (as opposed to a dead session or a bad request).
    pub fn is_transient(&self) -> bool {
        self.kind == EngineErrorKind::TransientProtocol
    }

    /// Whether the error kills the worker's connection for good.
    pub fn is_fatal_for_connection(&self) -> bool {
        matches!(
            self.kind,
            EngineErrorKind::ConnectionLost
                | EngineErrorKind::LoginFailed
                | EngineErrorKind::CertificateUnverified
        )
    }
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(uid) = self.item_uid {
            write!(f, "[{:?} item {}] {}", self.kind, uid, self.message)
        } else {
            write!(f, "[{:?}] {}", self.kind, self.message)
        }
    }
}

impl std::error::Error for EngineError {}

impl From<std::io::Error> for EngineError {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::NotFound => Self::not_found(e.to_string()),
            std::io::ErrorKind::PermissionDenied => {
                Self::new(EngineErrorKind::PermissionDenied, e.to_string())
            }
            std::io::ErrorKind::AlreadyExists => Self::already_exists(e.to_string()),
            std::io::ErrorKind::StorageFull => {
                Self::new(EngineErrorKind::DiskFull, e.to_string())
            }
            _ => Self::io_error(e.to_string()),
        }
    }
}

impl From<EngineError> for String {
    fn from(e: EngineError) -> String {
        e.message
    }
}
