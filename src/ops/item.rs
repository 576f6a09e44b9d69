//! Queue item - the tagged-union work unit of a bulk operation.
//!
//! Each item is one protocol-level action (delete a file, download a
//! file, change attrs, ...) or an "explore" action that enumerates a
//! directory and expands into child items. Dispatch is by pattern match
//! on [`ItemKind`], never by virtual dispatch, so the state machine
//! stays explicit and exhaustively checkable.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ─── Item kind ───────────────────────────────────────────────────────

/// Closed set of item kinds. Explore/resolve kinds are claimed with
/// priority so the operation's size totals stabilise early.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub enum ItemKind {
    // explore / resolve kinds (priority claim)
    DeleteDirExplore,
    CopyResolveLink,
    MoveResolveLink,
    CopyDirExplore,
    MoveDirExplore,
    ChAttrDirExplore,
    ChAttrResolveLink,
    UploadCopyDirExplore,
    UploadMoveDirExplore,

    // leaf kinds
    DeleteFile,
    DeleteLink,
    DeleteDir,
    CopyFile,
    MoveFile,
    MoveDeleteDir,
    ChAttrFile,
    ChAttrDir,
    UploadCopyFile,
    UploadMoveFile,
    UploadMoveDeleteDir,
}

impl ItemKind {
    /// Explore and resolve items are claimed before any leaf item.
    pub fn is_explore_or_resolve(&self) -> bool {
        matches!(
            self,
            Self::DeleteDirExplore
                | Self::CopyResolveLink
                | Self::MoveResolveLink
                | Self::CopyDirExplore
                | Self::MoveDirExplore
                | Self::ChAttrDirExplore
                | Self::ChAttrResolveLink
                | Self::UploadCopyDirExplore
                | Self::UploadMoveDirExplore
        )
    }

    /// Items that move file bytes (tracked by the copy-progress meters).
    pub fn is_transfer(&self) -> bool {
        matches!(
            self,
            Self::CopyFile | Self::MoveFile | Self::UploadCopyFile | Self::UploadMoveFile
        )
    }

    /// Delayed parent-directory kinds: queued at explore time, runnable
    /// only after every child item finished.
    pub fn is_delayed_parent(&self) -> bool {
        matches!(
            self,
            Self::DeleteDir | Self::MoveDeleteDir | Self::ChAttrDir | Self::UploadMoveDeleteDir
        )
    }

    /// Whether child failures/skips make the delayed parent pointless
    /// (a non-empty directory cannot be deleted).
    pub fn fails_on_child_errors(&self) -> bool {
        matches!(
            self,
            Self::DeleteDir | Self::MoveDeleteDir | Self::UploadMoveDeleteDir
        )
    }
}

// ─── Item state ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum ItemState {
    /// Eligible for a worker claim.
    Waiting,
    /// Parent-directory item waiting for its children to finish.
    Delayed,
    /// Claimed by exactly one worker.
    Processing,
    /// Blocked on an external decision.
    UserInputNeeded,
    /// Deliberately not performed (policy); terminal.
    Skipped,
    /// Completed; terminal.
    Done,
    /// Non-recoverable error; terminal.
    Failed,
    /// Delayed parent invalidated by child failures/skips; terminal,
    /// counted with Failed.
    ForcedToFail,
}

impl ItemState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Skipped | Self::Done | Self::Failed | Self::ForcedToFail
        )
    }

    /// Legal transitions of the item state machine.
    pub fn can_transition_to(&self, next: ItemState) -> bool {
        use ItemState::*;
        match (self, next) {
            (Waiting, Processing) => true,
            (Delayed, Waiting) | (Delayed, ForcedToFail) => true,
            (Processing, Done)
            | (Processing, Skipped)
            | (Processing, Failed)
            | (Processing, UserInputNeeded) => true,
            // stop/abandon: a restartable in-flight item returns to Waiting
            (Processing, Waiting) => true,
            (UserInputNeeded, Waiting)
            | (UserInputNeeded, Skipped)
            | (UserInputNeeded, Done) => true,
            _ => false,
        }
    }
}

// ─── Problem taxonomy ────────────────────────────────────────────────

/// Reason code attached to Skipped/Failed/UserInputNeeded items.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub enum Problem {
    FileIsHidden,
    DirIsHidden,
    UnknownAttrs,
    TargetFileExists,
    TargetDirExists,
    RetryOnCreatedFile,
    RetryOnResumedFile,
    AsciiModeForBinary,
    UnableToCwd,
    IncompleteListing,
    UnparsableListing,
    DirExploreEndlessLoop,
    UnableToDeleteFile,
    UnableToDeleteDir,
    UnableToChangeAttrs,
    UnableToResolveLink,
    TargetWriteError,
    IncompleteDownload,
    IncompleteUpload,
    UnableToDeleteSource,
    InvalidPath,
    LowMemory,
    LoginFailed,
    CertificateUnverified,
    DiskFull,
}

/// Coarse class a problem belongs to; drives propagation policy.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub enum ProblemClass {
    PolicyDeferral,
    NameCollision,
    TransientProtocolError,
    FatalProtocolError,
    ResourceExhaustion,
}

impl Problem {
    pub fn class(&self) -> ProblemClass {
        use Problem::*;
        match self {
            FileIsHidden | DirIsHidden | UnknownAttrs | AsciiModeForBinary => {
                ProblemClass::PolicyDeferral
            }
            TargetFileExists | TargetDirExists => ProblemClass::NameCollision,
            RetryOnCreatedFile | RetryOnResumedFile => ProblemClass::TransientProtocolError,
            LowMemory => ProblemClass::ResourceExhaustion,
            UnableToCwd | IncompleteListing | UnparsableListing | DirExploreEndlessLoop
            | UnableToDeleteFile | UnableToDeleteDir | UnableToChangeAttrs
            | UnableToResolveLink | TargetWriteError | IncompleteDownload | IncompleteUpload
            | UnableToDeleteSource | InvalidPath | LoginFailed | CertificateUnverified
            | DiskFull => ProblemClass::FatalProtocolError,
        }
    }

    /// Problems no retry can fix (malformed path, traversal cycle).
    pub fn is_unresolvable(&self) -> bool {
        matches!(
            self,
            Self::InvalidPath | Self::DirExploreEndlessLoop | Self::UnparsableListing
        )
    }
}

// ─── Resolutions ─────────────────────────────────────────────────────

/// External decision resolving a `UserInputNeeded` item.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum Resolution {
    Retry,
    Skip,
    /// Skip this item and every later item hitting the same problem.
    SkipAll,
    /// Re-run with a corrected attribute mask, and use that mask for
    /// every later item hitting the same problem.
    ApplyToAll { attr_mode: u32 },
    Overwrite,
    Resume,
    UseExistingDir,
    Autorename,
}

/// Outcome of [`crate::ops::queue::OpQueue::solve_error_on_item`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SolveOutcome {
    Applied,
    /// The item was already resolved; the call was a no-op.
    AlreadyResolved,
}

/// Action forced onto an item by an earlier resolution, consumed on the
/// item's next execution.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum ForcedAction {
    Overwrite,
    Resume,
    UseExistingDir,
    Autorename,
}

// ─── Per-kind payload ────────────────────────────────────────────────

/// Child counters carried by a delayed parent-directory item.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DirChildCounts {
    pub not_done: usize,
    pub skipped: usize,
    pub failed: usize,
    pub ui_needed: usize,
}

/// Kind-specific data riding on a queue item.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", tag = "type")]
pub enum ItemPayload {
    None,
    /// Copy / move / upload file payload.
    Transfer {
        modified: Option<DateTime<Utc>>,
        mode: super::types::TransferMode,
        /// Byte offset already present in the target (resume).
        resume_offset: u64,
    },
    /// Change-attributes payload.
    Attrs {
        /// Octal mode to apply.
        attr_mode: u32,
        /// The source listing showed permission bits beyond r/w/x that
        /// the new mode cannot preserve.
        unknown_bits: bool,
    },
    /// Delayed parent-directory payload. Change-attrs parents also
    /// carry the mode applied once the children finish.
    DirParent {
        children: DirChildCounts,
        attr_mode: Option<u32>,
        unknown_bits: bool,
    },
}

// ─── QueueItem ───────────────────────────────────────────────────────

/// One unit of work in an operation's queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueItem {
    /// Process-unique id, stable across queue mutation, never reused
    /// within one operation.
    pub uid: u64,
    pub kind: ItemKind,
    pub state: ItemState,
    pub source_path: String,
    pub name: String,
    pub target_path: Option<String>,
    pub target_name: Option<String>,
    /// `None` = unknown size. Zero is a valid empty file.
    pub size: Option<u64>,
    pub is_hidden: bool,
    pub is_link: bool,
    pub problem: Option<Problem>,
    /// Server/system detail for rendering a resolution dialog.
    pub problem_detail: Option<String>,
    pub forced_action: Option<ForcedAction>,
    /// Delayed parent this item reports completion to.
    pub parent_uid: Option<u64>,
    pub payload: ItemPayload,
    pub retries_used: u32,
}

impl QueueItem {
    pub fn new(kind: ItemKind, source_path: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            uid: 0, // assigned by the queue on insert
            kind,
            state: ItemState::Waiting,
            source_path: source_path.into(),
            name: name.into(),
            target_path: None,
            target_name: None,
            size: None,
            is_hidden: false,
            is_link: false,
            problem: None,
            problem_detail: None,
            forced_action: None,
            parent_uid: None,
            payload: ItemPayload::None,
            retries_used: 0,
        }
    }

    pub fn with_target(mut self, path: impl Into<String>, name: impl Into<String>) -> Self {
        self.target_path = Some(path.into());
        self.target_name = Some(name.into());
        self
    }

    pub fn with_size(mut self, size: Option<u64>) -> Self {
        self.size = size;
        self
    }

    pub fn hidden(mut self, hidden: bool) -> Self {
        self.is_hidden = hidden;
        self
    }

    pub fn link(mut self, link: bool) -> Self {
        self.is_link = link;
        self
    }

    pub fn with_payload(mut self, payload: ItemPayload) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_parent(mut self, parent_uid: u64) -> Self {
        self.parent_uid = Some(parent_uid);
        self
    }

    pub fn delayed(mut self) -> Self {
        self.state = ItemState::Delayed;
        self
    }

    /// Queue the item already blocked on a decision (policy checks that
    /// run at build time rather than at execution).
    pub fn needing_input(mut self, problem: Problem) -> Self {
        self.state = ItemState::UserInputNeeded;
        self.problem = Some(problem);
        self
    }

    /// Whether the item still represents pending work.
    pub fn is_pending(&self) -> bool {
        matches!(
            self.state,
            ItemState::Waiting | ItemState::Delayed | ItemState::Processing
        )
    }

    /// Whether the item sits in an error state a human can act on.
    pub fn is_in_error_state(&self) -> bool {
        matches!(
            self.state,
            ItemState::UserInputNeeded | ItemState::Failed | ItemState::ForcedToFail
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states_are_final() {
        use ItemState::*;
        for terminal in [Skipped, Done, Failed, ForcedToFail] {
            for next in [
                Waiting,
                Delayed,
                Processing,
                UserInputNeeded,
                Skipped,
                Done,
                Failed,
                ForcedToFail,
            ] {
                assert!(
                    !terminal.can_transition_to(next),
                    "{:?} -> {:?} must be illegal",
                    terminal,
                    next
                );
            }
        }
    }

    #[test]
    fn claim_and_resolution_transitions() {
        use ItemState::*;
        assert!(Waiting.can_transition_to(Processing));
        assert!(!Waiting.can_transition_to(Done));
        assert!(Processing.can_transition_to(UserInputNeeded));
        assert!(UserInputNeeded.can_transition_to(Waiting));
        assert!(UserInputNeeded.can_transition_to(Skipped));
        assert!(!UserInputNeeded.can_transition_to(Failed));
        assert!(Delayed.can_transition_to(Waiting));
        assert!(Delayed.can_transition_to(ForcedToFail));
        assert!(!Delayed.can_transition_to(Processing));
    }

    #[test]
    fn explore_kinds_partition() {
        assert!(ItemKind::DeleteDirExplore.is_explore_or_resolve());
        assert!(ItemKind::CopyResolveLink.is_explore_or_resolve());
        assert!(!ItemKind::DeleteFile.is_explore_or_resolve());
        assert!(!ItemKind::MoveDeleteDir.is_explore_or_resolve());
        assert!(ItemKind::CopyFile.is_transfer());
        assert!(!ItemKind::CopyDirExplore.is_transfer());
    }

    #[test]
    fn problem_classes() {
        assert_eq!(Problem::FileIsHidden.class(), ProblemClass::PolicyDeferral);
        assert_eq!(
            Problem::TargetFileExists.class(),
            ProblemClass::NameCollision
        );
        assert_eq!(
            Problem::RetryOnResumedFile.class(),
            ProblemClass::TransientProtocolError
        );
        assert_eq!(Problem::LowMemory.class(), ProblemClass::ResourceExhaustion);
        assert!(Problem::InvalidPath.is_unresolvable());
        assert!(!Problem::TargetFileExists.is_unresolvable());
    }
}
