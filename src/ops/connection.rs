//! Connection seam - the capability set a control+data connection pair
//! exposes to the engine.
//!
//! The wire protocol (command sequencing, PASV/PORT, TLS handshake)
//! lives behind [`FtpConnection`]; the engine never parses listings or
//! speaks FTP itself. Connections move between the originating session
//! and a worker as a [`ConnectionToken`] - a single-owner handle that is
//! explicitly transferred, never aliased.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ops::error::EngineResult;
use crate::ops::types::TransferMode;
use tokio::sync::watch;

// ─── Listing contract ────────────────────────────────────────────────

/// What a listed entry is.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum EntryKind {
    File,
    Directory,
    Link,
}

/// One pre-parsed directory entry, as produced by the external listing
/// parser. The engine only ever consumes these; raw listing bytes stay
/// opaque to it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListingEntry {
    pub name: String,
    pub kind: EntryKind,
    /// `None` = the listing did not show a size.
    pub size: Option<u64>,
    pub modified: Option<DateTime<Utc>>,
    pub is_hidden: bool,
    /// Octal permission bits, when the listing showed them.
    pub attr_mode: Option<u32>,
    /// The listing showed permission bits beyond r/w/x.
    pub unknown_attr_bits: bool,
}

/// What a symbolic link resolves to.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum LinkTarget {
    File,
    Directory,
}

// ─── Transfer control ────────────────────────────────────────────────

/// Verdict returned from a chunk checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkVerdict {
    Continue,
    /// Stop was requested; abandon the transfer at this boundary.
    Abort,
}

/// Handle a worker passes into transfer calls so the connection layer
/// can account progress and honor pause/stop at chunk boundaries.
///
/// Implementations of [`FtpConnection`] must call [`TransferCtl::advance`]
/// after every read/write chunk; there is no mid-chunk cancellation.
pub struct TransferCtl {
    progress: std::sync::Arc<crate::ops::progress::ProgressShared>,
    pause: watch::Receiver<bool>,
    stop: watch::Receiver<bool>,
    /// Bytes accounted by this handle (for rollback on restart).
    accounted: u64,
}

impl TransferCtl {
    pub fn new(
        progress: std::sync::Arc<crate::ops::progress::ProgressShared>,
        pause: watch::Receiver<bool>,
        stop: watch::Receiver<bool>,
    ) -> Self {
        Self {
            progress,
            pause,
            stop,
            accounted: 0,
        }
    }

    /// Account `bytes` just moved, then hold at this chunk boundary
    /// while paused. Returns [`ChunkVerdict::Abort`] when stop was
    /// requested.
    pub async fn advance(&mut self, bytes: u64) -> ChunkVerdict {
        self.progress.add_transferred(bytes);
        self.accounted += bytes;
        self.checkpoint().await
    }

    /// Hold at a safe checkpoint without accounting bytes.
    pub async fn checkpoint(&mut self) -> ChunkVerdict {
        loop {
            if *self.stop.borrow() {
                return ChunkVerdict::Abort;
            }
            if !*self.pause.borrow() {
                return ChunkVerdict::Continue;
            }
            // paused: wake on either flag changing
            tokio::select! {
                _ = self.pause.changed() => {}
                _ = self.stop.changed() => {}
            }
        }
    }

    /// Bytes this handle accounted so far.
    pub fn accounted(&self) -> u64 {
        self.accounted
    }

    /// Roll the accounted bytes back out of the operation's totals
    /// (the transfer will restart from scratch).
    pub fn retract(&mut self) {
        self.progress.retract_transferred(self.accounted);
        self.accounted = 0;
    }
}

/// Result of [`FtpConnection::download_one_file`] /
/// [`FtpConnection::upload_one_file`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferOutcome {
    /// The target file was newly created (false = resumed/overwritten).
    pub created: bool,
    /// The transfer ended before all bytes moved.
    pub incomplete: bool,
    pub actual_size: u64,
}

// ─── The connection capability set ───────────────────────────────────

/// Narrow contract the engine requires from a control+data connection.
///
/// One instance is bound to at most one worker at a time; methods take
/// `&mut self` because FTP control connections are strictly sequential.
/// `Sync` is required so worker futures holding the connection stay
/// spawnable on a multi-threaded runtime.
#[async_trait]
pub trait FtpConnection: Send + Sync {
    async fn change_working_path(&mut self, path: &str) -> EngineResult<()>;

    /// List the current working path as pre-parsed entries.
    ///
    /// Error convention: listing text the parser could not consume is
    /// reported as an `Io`-kind error; a truncated or momentarily stale
    /// listing as `TransientProtocol`.
    async fn list_working_path(&mut self) -> EngineResult<Vec<ListingEntry>>;

    /// Download one file into `target_tmp_path`, resuming from
    /// `resume_offset` when nonzero.
    async fn download_one_file(
        &mut self,
        name: &str,
        size_hint: Option<u64>,
        mode: TransferMode,
        source_path: &str,
        target_tmp_path: &str,
        resume_offset: u64,
        ctl: &mut TransferCtl,
    ) -> EngineResult<TransferOutcome>;

    /// Upload one local file to `name` in the current working path.
    async fn upload_one_file(
        &mut self,
        local_path: &str,
        name: &str,
        mode: TransferMode,
        overwrite: bool,
        ctl: &mut TransferCtl,
    ) -> EngineResult<TransferOutcome>;

    async fn create_dir(&mut self, name: &str) -> EngineResult<()>;

    async fn quick_rename(&mut self, from: &str, to: &str) -> EngineResult<()>;

    async fn delete_file(&mut self, name: &str) -> EngineResult<()>;

    async fn delete_dir(&mut self, name: &str) -> EngineResult<()>;

    /// Attribute-change primitive (SITE CHMOD class).
    async fn change_attrs(&mut self, name: &str, attr_mode: u32) -> EngineResult<()>;

    /// Find out whether a link points at a file or a directory.
    async fn resolve_link(&mut self, name: &str) -> EngineResult<LinkTarget>;

    /// Server certificate presented on this connection, if TLS is on.
    fn certificate(&self) -> Option<&[u8]>;

    /// Trust a certificate for the rest of this connection's life.
    fn set_certificate(&mut self, cert: Vec<u8>);

    /// Server detail from the last login failure, if any.
    fn login_error_detail(&self) -> Option<String>;
}

// ─── Single-owner handoff ────────────────────────────────────────────

/// Move-only handle to a live connection.
///
/// The session that opened the connection blocks further use of it until
/// the token comes back (worker stop) or is permanently reassigned
/// (worker completed with the connection retained by the pool). Tokens
/// are consumed, never cloned, which rules out aliased use by design of
/// the type.
pub struct ConnectionToken {
    conn: Box<dyn FtpConnection>,
}

impl ConnectionToken {
    pub fn new(conn: Box<dyn FtpConnection>) -> Self {
        Self { conn }
    }

    /// Consume the token, yielding exclusive use of the connection.
    pub fn into_connection(self) -> Box<dyn FtpConnection> {
        self.conn
    }
}

impl std::fmt::Debug for ConnectionToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionToken").finish_non_exhaustive()
    }
}
