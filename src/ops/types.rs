//! Shared types for the bulk-operation engine.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

// ─── Operation ───────────────────────────────────────────────────────

/// Which bulk action an operation performs.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum OperationKind {
    Delete,
    CopyDownload,
    MoveDownload,
    ChangeAttrs,
    CopyUpload,
    MoveUpload,
}

/// Coarse operation state.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum OperationState {
    InProgress,
    SuccessfullyFinished,
    FinishedWithSkips,
    FinishedWithErrors,
}

/// Unit the operation's size totals are expressed in. Decided by the
/// first listing encountered; never mixed within one operation.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum SizeUnit {
    #[default]
    Bytes,
    Blocks,
}

/// Transfer mode for one item (RFC 959 TYPE). Decided once per item,
/// never changed mid-transfer.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum TransferMode {
    Ascii,
    Binary,
}

impl Default for TransferMode {
    fn default() -> Self {
        Self::Binary
    }
}

/// How the transfer mode of copy/upload items is picked.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum TransferModePolicy {
    /// Match the item name against `ascii_file_masks`; Ascii on match.
    ByMasks,
    ForceAscii,
    ForceBinary,
}

impl Default for TransferModePolicy {
    fn default() -> Self {
        Self::ByMasks
    }
}

/// Type of the remote path syntax the target filesystem uses.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum ServerPathType {
    Unix,
    Windows,
    Vms,
    Mvs,
    As400,
}

impl ServerPathType {
    /// Whether path comparison on this filesystem ignores case.
    pub fn is_case_insensitive(&self) -> bool {
        !matches!(self, Self::Unix)
    }
}

impl Default for ServerPathType {
    fn default() -> Self {
        Self::Unix
    }
}

// ─── Per-operation policies ──────────────────────────────────────────

/// What to do when the target file already exists.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum OverwritePolicy {
    Prompt,
    Overwrite,
    OverwriteIfNewer,
    Resume,
    ResumeOrOverwrite,
    Autorename,
    Skip,
}

impl Default for OverwritePolicy {
    fn default() -> Self {
        Self::Prompt
    }
}

/// What to do when the target directory already exists.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum DirCollisionPolicy {
    Prompt,
    UseExisting,
    Autorename,
    Skip,
}

impl Default for DirCollisionPolicy {
    fn default() -> Self {
        Self::Prompt
    }
}

/// What to do with hidden files/directories during delete.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum HiddenFilePolicy {
    Prompt,
    Process,
    Skip,
}

impl Default for HiddenFilePolicy {
    fn default() -> Self {
        Self::Prompt
    }
}

/// What to do when an item carries attribute bits the engine cannot
/// preserve (rights beyond r/w/x).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum UnknownAttrsPolicy {
    Prompt,
    Ignore,
    Skip,
}

impl Default for UnknownAttrsPolicy {
    fn default() -> Self {
        Self::Prompt
    }
}

/// What to do with a partially downloaded target when a transfer is
/// abandoned (stop, connection loss).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum ResumePolicy {
    /// Keep the partial file so a later run can resume it.
    KeepPartial,
    /// Delete the partial file; the item restarts from scratch.
    DeletePartial,
}

impl Default for ResumePolicy {
    fn default() -> Self {
        Self::KeepPartial
    }
}

/// The set of problems a worker silently retries instead of escalating.
///
/// Kept as configuration data so callers can tune the set instead of
/// the engine hard-coding a policy matrix. Defaults to the
/// create/resume listing races only.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    pub retryable: HashSet<crate::ops::item::Problem>,
    /// Upper bound on silent retries of one item.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

fn default_max_retries() -> u32 {
    3
}

impl Default for RetryPolicy {
    fn default() -> Self {
        let mut retryable = HashSet::new();
        retryable.insert(crate::ops::item::Problem::RetryOnCreatedFile);
        retryable.insert(crate::ops::item::Problem::RetryOnResumedFile);
        Self {
            retryable,
            max_retries: default_max_retries(),
        }
    }
}

// ─── Operation configuration ─────────────────────────────────────────

/// Per-operation configuration, applied uniformly to every worker the
/// operation spawns.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationConfig {
    pub user: String,
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub overwrite: OverwritePolicy,
    #[serde(default)]
    pub dir_collision: DirCollisionPolicy,
    #[serde(default)]
    pub hidden_files: HiddenFilePolicy,
    #[serde(default)]
    pub unknown_attrs: UnknownAttrsPolicy,
    #[serde(default)]
    pub resume: ResumePolicy,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub transfer_mode_policy: TransferModePolicy,
    /// Glob masks selecting files transferred in ASCII mode.
    #[serde(default = "default_ascii_masks")]
    pub ascii_file_masks: Vec<String>,
    /// Path delimiter of the target filesystem (e.g. '/' or '\\').
    #[serde(default = "default_delimiter")]
    pub path_delimiter: char,
    #[serde(default)]
    pub path_type: ServerPathType,
    /// Number of workers the operation runs with.
    #[serde(default = "default_workers")]
    pub max_workers: usize,
    /// Whether control/data channels must be encrypted.
    #[serde(default)]
    pub encrypt: bool,
    /// Server certificate every spawned worker trusts (opaque blob;
    /// certificate verification itself lives with the connection layer).
    #[serde(default)]
    pub certificate: Option<Vec<u8>>,
}

fn default_ascii_masks() -> Vec<String> {
    vec![
        "*.txt".into(),
        "*.htm".into(),
        "*.html".into(),
        "*.csv".into(),
        "*.log".into(),
    ]
}

fn default_delimiter() -> char {
    '/'
}

fn default_workers() -> usize {
    1
}

impl Default for OperationConfig {
    fn default() -> Self {
        Self {
            user: "anonymous".into(),
            host: String::new(),
            port: 21,
            overwrite: OverwritePolicy::default(),
            dir_collision: DirCollisionPolicy::default(),
            hidden_files: HiddenFilePolicy::default(),
            unknown_attrs: UnknownAttrsPolicy::default(),
            resume: ResumePolicy::default(),
            retry: RetryPolicy::default(),
            transfer_mode_policy: TransferModePolicy::default(),
            ascii_file_masks: default_ascii_masks(),
            path_delimiter: default_delimiter(),
            path_type: ServerPathType::default(),
            max_workers: default_workers(),
            encrypt: false,
            certificate: None,
        }
    }
}

/// Join a remote path and a name with the server's delimiter.
pub fn join_remote(path: &str, name: &str, delimiter: char) -> String {
    if path.ends_with(delimiter) {
        format!("{}{}", path, name)
    } else {
        format!("{}{}{}", path, delimiter, name)
    }
}

// ─── Counters & progress snapshots ───────────────────────────────────

/// Aggregate item counts for one operation. Maintained incrementally
/// under the queue lock, never recomputed by scan on the hot path.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ChildCounts {
    pub total: usize,
    pub waiting: usize,
    pub delayed: usize,
    pub processing: usize,
    pub ui_needed: usize,
    pub skipped: usize,
    pub done: usize,
    pub failed: usize,
}

impl ChildCounts {
    /// Bookkeeping invariant: every item is in exactly one bucket.
    pub fn is_consistent(&self) -> bool {
        self.total
            == self.waiting
                + self.delayed
                + self.processing
                + self.ui_needed
                + self.skipped
                + self.done
                + self.failed
    }
}

/// Progress snapshot for delete / change-attrs operations.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SimpleProgress {
    pub done_or_skipped: usize,
    pub total: usize,
    pub unknown_size_count: usize,
    pub waiting: usize,
}

/// Progress snapshot for copy / move / upload operations.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CopyProgress {
    /// Bytes (or blocks) moved so far, including live partial transfers.
    pub transferred: u64,
    /// Known total size of all transfer items.
    pub total: u64,
    /// Items still waiting or delayed.
    pub waiting: usize,
    pub unknown_size_count: usize,
    pub error_count: usize,
    pub done_count: usize,
    pub total_count: usize,
    pub unit: SizeUnit,
}

/// UIDs mutated since the consumer's previous poll. The queue tracks at
/// most two; more means the consumer must do a full refresh.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DirtyUids {
    None,
    Some(Vec<u64>),
    /// Too many mutations since the last poll; rescan everything.
    Overflow,
}
