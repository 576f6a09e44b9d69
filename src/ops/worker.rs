//! Worker: one connection, one tokio task, one claimed item at a time.
//!
//! A worker loops claim -> execute -> report until the queue has nothing
//! left for anyone or a stop arrives. Escalation order for every failure
//! is fixed: skip-all cache, silent retry budget, then `UserInputNeeded`
//! with the worker parked until that item is resolved.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use log::{debug, info, warn};
use tokio::sync::watch;

use crate::ops::connection::{
    ConnectionToken, EntryKind, FtpConnection, LinkTarget, ListingEntry, TransferCtl,
};
use crate::ops::error::{EngineError, EngineErrorKind};
use crate::ops::events::OperationEvent;
use crate::ops::item::{
    ForcedAction, ItemKind, ItemPayload, ItemState, Problem, QueueItem,
};
use crate::ops::builder::ascii_looks_wrong;
use crate::ops::operation::Operation;
use crate::ops::types::{
    join_remote, DirCollisionPolicy, HiddenFilePolicy, OverwritePolicy, ResumePolicy,
    UnknownAttrsPolicy,
};

/// Path nesting beyond this is treated as a link cycle.
const MAX_EXPLORE_DEPTH: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Idle,
    ClaimingWork,
    Executing,
    /// Parked until the item this worker escalated is resolved.
    ErrorWait,
    Stopped,
}

/// Worker-side status the pool can read without touching the task.
pub struct WorkerShared {
    state: Mutex<WorkerState>,
    last_error: Mutex<Option<String>>,
}

impl WorkerShared {
    fn new() -> Self {
        Self {
            state: Mutex::new(WorkerState::Idle),
            last_error: Mutex::new(None),
        }
    }

    pub fn state(&self) -> WorkerState {
        match self.state.lock() {
            Ok(g) => *g,
            Err(p) => *p.into_inner(),
        }
    }

    pub fn last_error(&self) -> Option<String> {
        match self.last_error.lock() {
            Ok(g) => g.clone(),
            Err(p) => p.into_inner().clone(),
        }
    }

    fn set_state(&self, state: WorkerState) {
        match self.state.lock() {
            Ok(mut g) => *g = state,
            Err(p) => *p.into_inner() = state,
        }
    }

    fn set_error(&self, msg: String) {
        match self.last_error.lock() {
            Ok(mut g) => *g = Some(msg),
            Err(p) => *p.into_inner() = Some(msg),
        }
    }
}

/// What one item execution decided.
enum Exec {
    /// Item finished; mark Done.
    Done,
    /// Queue transitions already applied (explore expansion).
    Handled,
    /// Policy skip; mark Skipped with the problem.
    Skip(Problem, Option<String>),
    /// Run the escalation ladder for this problem.
    Escalate(Problem, Option<String>),
    /// Stop arrived mid-item; item returns to Waiting, worker exits.
    Abandon,
    /// The connection is dead; the item fails with the action's problem
    /// and the worker exits.
    Fatal(Problem, String),
    /// The connection died on an authentication-class failure (bad
    /// login, untrusted certificate). Retrying on a fresh connection
    /// with the same session data would fail the same way, so the item
    /// parks on `UserInputNeeded` instead of returning to Waiting.
    FatalAuth(Problem, String),
}

/// Whether the run loop keeps going after an item.
enum Flow {
    Continue,
    Exit,
}

pub struct Worker {
    id: usize,
    op: Operation,
    conn: Box<dyn FtpConnection>,
    pause_rx: watch::Receiver<bool>,
    stop_rx: watch::Receiver<bool>,
    /// Individual stop, separate from the operation-wide one. Honored
    /// at item boundaries only.
    own_stop_rx: watch::Receiver<bool>,
    shared: Arc<WorkerShared>,
}

impl Worker {
    pub fn new(
        id: usize,
        op: &Operation,
        token: ConnectionToken,
        own_stop_rx: watch::Receiver<bool>,
    ) -> Self {
        let mut conn = token.into_connection();
        // a trusted certificate only means something on an encrypted
        // session; plain connections ignore the blob
        if op.config().encrypt {
            if let Some(cert) = op.config().certificate.clone() {
                conn.set_certificate(cert);
            }
        }
        Self {
            id,
            op: op.clone(),
            conn,
            pause_rx: op.pause_receiver(),
            stop_rx: op.stop_receiver(),
            own_stop_rx,
            shared: Arc::new(WorkerShared::new()),
        }
    }

    fn should_stop(&self) -> bool {
        self.op.is_stopped() || *self.own_stop_rx.borrow()
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn shared(&self) -> Arc<WorkerShared> {
        Arc::clone(&self.shared)
    }

    /// Drive the queue until it is exhausted or a stop arrives. The
    /// connection comes back out for reuse or return to the session.
    pub async fn run(mut self) -> ConnectionToken {
        info!("worker {} started for operation {}", self.id, self.op.id());
        // a local handle keeps the notify borrow off `self`
        let op = self.op.clone();
        loop {
            self.shared.set_state(WorkerState::ClaimingWork);
            let notified = op.work_notify().notified();
            // pause holds the loop here; the item boundary is a pause
            // checkpoint for every kind, not just transfers
            while *self.pause_rx.borrow() && !self.should_stop() {
                tokio::select! {
                    _ = self.pause_rx.changed() => {}
                    _ = self.stop_rx.changed() => {}
                    _ = self.own_stop_rx.changed() => {}
                }
            }
            if self.should_stop() {
                break;
            }
            match self.op.claim_next() {
                Some(item) => {
                    self.shared.set_state(WorkerState::Executing);
                    let uid = item.uid;
                    let exec = self.execute(&item).await;
                    match self.settle(uid, exec).await {
                        Flow::Continue => {}
                        Flow::Exit => break,
                    }
                }
                None => {
                    if !self.op.has_unfinished_items() {
                        debug!("worker {}: queue exhausted", self.id);
                        break;
                    }
                    // claimable work may reappear after a resolution or
                    // a delayed-parent promotion
                    self.shared.set_state(WorkerState::Idle);
                    tokio::select! {
                        _ = notified => {}
                        _ = self.stop_rx.changed() => {}
                        _ = self.own_stop_rx.changed() => {}
                    }
                }
            }
        }
        self.shared.set_state(WorkerState::Stopped);
        info!("worker {} stopped", self.id);
        ConnectionToken::new(self.conn)
    }

    // ─── Outcome settlement ──────────────────────────────────────

    async fn settle(&mut self, uid: u64, exec: Exec) -> Flow {
        match exec {
            Exec::Done => {
                self.report(uid, ItemState::Done, None, None);
                Flow::Continue
            }
            Exec::Handled => Flow::Continue,
            Exec::Skip(problem, detail) => {
                self.report(uid, ItemState::Skipped, Some(problem), detail);
                Flow::Continue
            }
            Exec::Escalate(problem, detail) => self.escalate(uid, problem, detail).await,
            Exec::Abandon => {
                self.report(uid, ItemState::Waiting, None, None);
                Flow::Exit
            }
            Exec::Fatal(problem, msg) => {
                warn!("worker {}: connection lost: {}", self.id, msg);
                self.report(uid, ItemState::Failed, Some(problem), Some(msg.clone()));
                self.shared.set_error(msg.clone());
                let _ = self.op.event_sender().send(OperationEvent::WorkerError {
                    worker_id: self.id,
                    message: msg,
                });
                Flow::Exit
            }
            Exec::FatalAuth(problem, msg) => {
                warn!("worker {}: auth failure: {}", self.id, msg);
                self.report(uid, ItemState::UserInputNeeded, Some(problem), Some(msg.clone()));
                self.shared.set_error(msg.clone());
                let _ = self.op.event_sender().send(OperationEvent::WorkerError {
                    worker_id: self.id,
                    message: msg,
                });
                Flow::Exit
            }
        }
    }

    fn report(&self, uid: u64, state: ItemState, problem: Option<Problem>, detail: Option<String>) {
        if let Err(e) = self.op.set_item_state(uid, state, problem, detail) {
            warn!("worker {}: report on item {} failed: {}", self.id, uid, e);
        }
    }

    /// Skip-all cache, then the silent retry budget, then park on
    /// `UserInputNeeded` until someone resolves this very item.
    async fn escalate(&mut self, uid: u64, problem: Problem, detail: Option<String>) -> Flow {
        if self.op.skip_all_covers(problem) {
            self.report(uid, ItemState::Skipped, Some(problem), detail);
            return Flow::Continue;
        }
        if self.op.config().retry.retryable.contains(&problem) {
            match self.op.retry_item(uid) {
                Ok(true) => {
                    debug!("worker {}: silent retry of item {} ({:?})", self.id, uid, problem);
                    return Flow::Continue;
                }
                Ok(false) => {}
                Err(e) => warn!("worker {}: retry of item {} failed: {}", self.id, uid, e),
            }
        }
        self.report(uid, ItemState::UserInputNeeded, Some(problem), detail);
        self.shared.set_state(WorkerState::ErrorWait);
        debug!("worker {}: waiting on resolution of item {}", self.id, uid);
        let op = self.op.clone();
        loop {
            let notified = op.work_notify().notified();
            if self.should_stop() {
                return Flow::Exit;
            }
            match op.get_item(uid) {
                Some(item) if item.state == ItemState::UserInputNeeded => {}
                _ => return Flow::Continue,
            }
            tokio::select! {
                _ = notified => {}
                _ = self.stop_rx.changed() => {}
                _ = self.own_stop_rx.changed() => {}
            }
        }
    }

    // ─── Dispatch ────────────────────────────────────────────────

    async fn execute(&mut self, item: &QueueItem) -> Exec {
        // policy gates apply at processing time, so a skip-all answer
        // given earlier in the run covers entries discovered later. An
        // item carrying the gate's own problem was already answered
        // with "go ahead" and passes through.
        if item.is_hidden {
            let problem = if matches!(
                item.kind,
                ItemKind::DeleteFile | ItemKind::DeleteLink | ItemKind::CopyFile
                    | ItemKind::MoveFile | ItemKind::ChAttrFile | ItemKind::UploadCopyFile
                    | ItemKind::UploadMoveFile
            ) {
                Problem::FileIsHidden
            } else {
                Problem::DirIsHidden
            };
            if item.problem != Some(problem) {
                if self.op.skip_all_covers(problem) {
                    return Exec::Skip(problem, None);
                }
                match self.op.config().hidden_files {
                    HiddenFilePolicy::Process => {}
                    HiddenFilePolicy::Skip => return Exec::Skip(problem, None),
                    HiddenFilePolicy::Prompt => return Exec::Escalate(problem, None),
                }
            }
        }

        // unknown permission bits gate change-attrs items
        if let Some(unknown) = unknown_attr_bits(item) {
            if unknown && item.problem != Some(Problem::UnknownAttrs) {
                match self.op.config().unknown_attrs {
                    UnknownAttrsPolicy::Ignore => {}
                    UnknownAttrsPolicy::Skip => return Exec::Skip(Problem::UnknownAttrs, None),
                    UnknownAttrsPolicy::Prompt => {
                        return Exec::Escalate(Problem::UnknownAttrs, None)
                    }
                }
            }
        }

        // forced-ASCII sanity check, re-run here for files an explore
        // discovered after the queue was built
        if item.kind.is_transfer()
            && ascii_looks_wrong(self.op.config(), &item.name)
            && item.problem != Some(Problem::AsciiModeForBinary)
        {
            if self.op.skip_all_covers(Problem::AsciiModeForBinary) {
                return Exec::Skip(Problem::AsciiModeForBinary, None);
            }
            return Exec::Escalate(Problem::AsciiModeForBinary, None);
        }

        match item.kind {
            ItemKind::DeleteDirExplore => self.explore_for_delete(item).await,
            ItemKind::CopyDirExplore | ItemKind::MoveDirExplore => {
                self.explore_for_download(item).await
            }
            ItemKind::ChAttrDirExplore => self.explore_for_chattr(item).await,
            ItemKind::UploadCopyDirExplore | ItemKind::UploadMoveDirExplore => {
                self.explore_for_upload(item).await
            }
            ItemKind::CopyResolveLink
            | ItemKind::MoveResolveLink
            | ItemKind::ChAttrResolveLink => self.resolve_link(item).await,
            ItemKind::DeleteFile | ItemKind::DeleteLink => self.delete_remote_file(item).await,
            ItemKind::DeleteDir | ItemKind::MoveDeleteDir => self.delete_remote_dir(item).await,
            ItemKind::ChAttrFile | ItemKind::ChAttrDir => self.change_attrs(item).await,
            ItemKind::CopyFile | ItemKind::MoveFile => {
                self.download(item, item.kind == ItemKind::MoveFile).await
            }
            ItemKind::UploadCopyFile | ItemKind::UploadMoveFile => {
                self.upload(item, item.kind == ItemKind::UploadMoveFile).await
            }
            ItemKind::UploadMoveDeleteDir => self.delete_local_dir(item).await,
        }
    }

    // ─── Explores ────────────────────────────────────────────────

    async fn list_dir(&mut self, item: &QueueItem) -> Result<Vec<ListingEntry>, Exec> {
        let full = self.join_remote(&item.source_path, &item.name);
        if remote_depth(&full, self.op.config().path_delimiter) > MAX_EXPLORE_DEPTH {
            return Err(Exec::Escalate(
                Problem::DirExploreEndlessLoop,
                Some(full),
            ));
        }
        if let Err(e) = self.conn.change_working_path(&full).await {
            return Err(self.map_remote_err(e, Problem::UnableToCwd));
        }
        match self.conn.list_working_path().await {
            Ok(entries) => Ok(entries),
            // listing text the parser gave up on arrives as an I/O-class
            // error from the data channel; a retry cannot fix it
            Err(e) if e.kind == EngineErrorKind::Io => Err(Exec::Escalate(
                Problem::UnparsableListing,
                Some(e.to_string()),
            )),
            Err(e) => Err(self.map_remote_err(e, Problem::IncompleteListing)),
        }
    }

    async fn explore_for_delete(&mut self, item: &QueueItem) -> Exec {
        let entries = match self.list_dir(item).await {
            Ok(e) => e,
            Err(exec) => return exec,
        };
        let full = self.join_remote(&item.source_path, &item.name);
        let mut children = Vec::with_capacity(entries.len());
        for entry in entries {
            let kind = match entry.kind {
                EntryKind::File => ItemKind::DeleteFile,
                EntryKind::Link => ItemKind::DeleteLink,
                EntryKind::Directory => ItemKind::DeleteDirExplore,
            };
            children.push(
                QueueItem::new(kind, &full, &entry.name)
                    .with_size(entry.size)
                    .hidden(entry.is_hidden)
                    .link(entry.kind == EntryKind::Link),
            );
        }
        let parent = QueueItem::new(ItemKind::DeleteDir, &item.source_path, &item.name)
            .hidden(item.is_hidden);
        self.commit_expansion(item.uid, Some(parent), children)
    }

    async fn explore_for_download(&mut self, item: &QueueItem) -> Exec {
        let (Some(target_path), Some(target_name)) = (&item.target_path, &item.target_name)
        else {
            return Exec::Escalate(Problem::InvalidPath, Some("missing target".into()));
        };
        let target_dir = match self.prepare_local_dir(item, target_path, target_name).await {
            Ok(dir) => dir,
            Err(exec) => return exec,
        };

        let entries = match self.list_dir(item).await {
            Ok(e) => e,
            Err(exec) => return exec,
        };
        let full = self.join_remote(&item.source_path, &item.name);
        let moving = item.kind == ItemKind::MoveDirExplore;
        let target_dir_str = target_dir.to_string_lossy().into_owned();

        let mut children = Vec::with_capacity(entries.len());
        for entry in entries {
            let child = match entry.kind {
                EntryKind::File => QueueItem::new(
                    if moving { ItemKind::MoveFile } else { ItemKind::CopyFile },
                    &full,
                    &entry.name,
                )
                .with_size(entry.size)
                .with_payload(ItemPayload::Transfer {
                    modified: entry.modified,
                    mode: self.op.transfer_mode_for(&entry.name),
                    resume_offset: 0,
                }),
                EntryKind::Link => QueueItem::new(
                    if moving {
                        ItemKind::MoveResolveLink
                    } else {
                        ItemKind::CopyResolveLink
                    },
                    &full,
                    &entry.name,
                )
                .link(true),
                EntryKind::Directory => QueueItem::new(
                    if moving {
                        ItemKind::MoveDirExplore
                    } else {
                        ItemKind::CopyDirExplore
                    },
                    &full,
                    &entry.name,
                ),
            };
            children.push(
                child
                    .with_target(&target_dir_str, &entry.name)
                    .hidden(entry.is_hidden),
            );
        }
        let parent = if moving {
            Some(
                QueueItem::new(ItemKind::MoveDeleteDir, &item.source_path, &item.name)
                    .hidden(item.is_hidden),
            )
        } else {
            None
        };
        self.commit_expansion(item.uid, parent, children)
    }

    async fn explore_for_chattr(&mut self, item: &QueueItem) -> Exec {
        let ItemPayload::Attrs { attr_mode, unknown_bits } = &item.payload else {
            return Exec::Escalate(Problem::UnknownAttrs, Some("missing attr payload".into()));
        };
        let (attr_mode, unknown_bits) = (*attr_mode, *unknown_bits);
        let entries = match self.list_dir(item).await {
            Ok(e) => e,
            Err(exec) => return exec,
        };
        let full = self.join_remote(&item.source_path, &item.name);
        let mut children = Vec::with_capacity(entries.len());
        for entry in entries {
            let child = match entry.kind {
                EntryKind::File => QueueItem::new(ItemKind::ChAttrFile, &full, &entry.name)
                    .with_payload(ItemPayload::Attrs {
                        attr_mode,
                        unknown_bits: entry.unknown_attr_bits,
                    }),
                EntryKind::Link => {
                    QueueItem::new(ItemKind::ChAttrResolveLink, &full, &entry.name)
                        .link(true)
                        .with_payload(ItemPayload::Attrs {
                            attr_mode,
                            unknown_bits: false,
                        })
                }
                EntryKind::Directory => {
                    QueueItem::new(ItemKind::ChAttrDirExplore, &full, &entry.name).with_payload(
                        ItemPayload::Attrs {
                            attr_mode,
                            unknown_bits: entry.unknown_attr_bits,
                        },
                    )
                }
            };
            children.push(child.hidden(entry.is_hidden));
        }
        // the directory's own attrs change only after the subtree is done
        let parent = QueueItem::new(ItemKind::ChAttrDir, &item.source_path, &item.name)
            .hidden(item.is_hidden)
            .with_payload(ItemPayload::DirParent {
                children: Default::default(),
                attr_mode: Some(attr_mode),
                unknown_bits,
            });
        self.commit_expansion(item.uid, Some(parent), children)
    }

    async fn explore_for_upload(&mut self, item: &QueueItem) -> Exec {
        let (Some(target_path), Some(target_name)) = (&item.target_path, &item.target_name)
        else {
            return Exec::Escalate(Problem::InvalidPath, Some("missing target".into()));
        };
        let target_path = target_path.clone();
        let target_name = target_name.clone();

        // remote target dir first, honoring the collision policy
        if let Err(e) = self.conn.change_working_path(&target_path).await {
            return self.map_remote_err(e, Problem::UnableToCwd);
        }
        let final_name = match self.create_remote_dir(item, &target_name).await {
            Ok(Some(name)) => name,
            Ok(None) => return Exec::Skip(Problem::TargetDirExists, None),
            Err(exec) => return exec,
        };
        let remote_dir = self.join_remote(&target_path, &final_name);

        let local_dir = Path::new(&item.source_path).join(&item.name);
        let mut entries = match tokio::fs::read_dir(&local_dir).await {
            Ok(rd) => rd,
            Err(e) => {
                return Exec::Escalate(Problem::IncompleteListing, Some(e.to_string()));
            }
        };
        let moving = item.kind == ItemKind::UploadMoveDirExplore;
        let local_dir_str = local_dir.to_string_lossy().into_owned();

        let mut children = Vec::new();
        loop {
            let entry = match entries.next_entry().await {
                Ok(Some(e)) => e,
                Ok(None) => break,
                Err(e) => {
                    return Exec::Escalate(Problem::IncompleteListing, Some(e.to_string()));
                }
            };
            let name = entry.file_name().to_string_lossy().into_owned();
            let meta = match entry.metadata().await {
                Ok(m) => m,
                Err(e) => {
                    return Exec::Escalate(Problem::IncompleteListing, Some(e.to_string()));
                }
            };
            let child = if meta.is_dir() {
                QueueItem::new(
                    if moving {
                        ItemKind::UploadMoveDirExplore
                    } else {
                        ItemKind::UploadCopyDirExplore
                    },
                    &local_dir_str,
                    &name,
                )
            } else {
                QueueItem::new(
                    if moving {
                        ItemKind::UploadMoveFile
                    } else {
                        ItemKind::UploadCopyFile
                    },
                    &local_dir_str,
                    &name,
                )
                .with_size(Some(meta.len()))
                .with_payload(ItemPayload::Transfer {
                    modified: meta.modified().ok().map(|t| t.into()),
                    mode: self.op.transfer_mode_for(&name),
                    resume_offset: 0,
                })
            };
            children.push(child.with_target(&remote_dir, &name));
        }
        let parent = if moving {
            Some(QueueItem::new(
                ItemKind::UploadMoveDeleteDir,
                &item.source_path,
                &item.name,
            ))
        } else {
            None
        };
        self.commit_expansion(item.uid, parent, children)
    }

    fn commit_expansion(
        &self,
        uid: u64,
        parent: Option<QueueItem>,
        children: Vec<QueueItem>,
    ) -> Exec {
        match self.op.replace_explored(uid, parent, children) {
            Ok(()) => Exec::Handled,
            Err(e) if e.kind == EngineErrorKind::OutOfMemory => {
                Exec::Escalate(Problem::LowMemory, Some(e.to_string()))
            }
            Err(e) => Exec::Escalate(Problem::IncompleteListing, Some(e.to_string())),
        }
    }

    // ─── Links ───────────────────────────────────────────────────

    async fn resolve_link(&mut self, item: &QueueItem) -> Exec {
        if let Err(e) = self.conn.change_working_path(&item.source_path).await {
            return self.map_remote_err(e, Problem::UnableToCwd);
        }
        let target = match self.conn.resolve_link(&item.name).await {
            Ok(t) => t,
            Err(e) => return self.map_remote_err(e, Problem::UnableToResolveLink),
        };
        let replacement_kind = match (item.kind, target) {
            (ItemKind::CopyResolveLink, LinkTarget::File) => ItemKind::CopyFile,
            (ItemKind::CopyResolveLink, LinkTarget::Directory) => ItemKind::CopyDirExplore,
            (ItemKind::MoveResolveLink, LinkTarget::File) => ItemKind::MoveFile,
            (ItemKind::MoveResolveLink, LinkTarget::Directory) => ItemKind::MoveDirExplore,
            (ItemKind::ChAttrResolveLink, LinkTarget::File) => ItemKind::ChAttrFile,
            (ItemKind::ChAttrResolveLink, LinkTarget::Directory) => ItemKind::ChAttrDirExplore,
            _ => {
                return Exec::Escalate(
                    Problem::UnableToResolveLink,
                    Some(format!("unexpected link item {:?}", item.kind)),
                )
            }
        };
        let mut replacement = QueueItem::new(replacement_kind, &item.source_path, &item.name)
            .hidden(item.is_hidden);
        if let (Some(p), Some(n)) = (&item.target_path, &item.target_name) {
            replacement = replacement.with_target(p, n);
        }
        if replacement_kind == ItemKind::CopyFile || replacement_kind == ItemKind::MoveFile {
            replacement = replacement.with_payload(ItemPayload::Transfer {
                modified: None,
                mode: self.op.transfer_mode_for(&item.name),
                resume_offset: 0,
            });
        } else if matches!(item.payload, ItemPayload::Attrs { .. }) {
            replacement = replacement.with_payload(item.payload.clone());
        }
        self.commit_expansion(item.uid, None, vec![replacement])
    }

    // ─── Remote leaves ───────────────────────────────────────────

    async fn delete_remote_file(&mut self, item: &QueueItem) -> Exec {
        if let Err(e) = self.conn.change_working_path(&item.source_path).await {
            return self.map_remote_err(e, Problem::UnableToCwd);
        }
        match self.conn.delete_file(&item.name).await {
            Ok(()) => Exec::Done,
            Err(e) => self.map_remote_err(e, Problem::UnableToDeleteFile),
        }
    }

    async fn delete_remote_dir(&mut self, item: &QueueItem) -> Exec {
        if let Err(e) = self.conn.change_working_path(&item.source_path).await {
            return self.map_remote_err(e, Problem::UnableToCwd);
        }
        match self.conn.delete_dir(&item.name).await {
            Ok(()) => Exec::Done,
            Err(e) => self.map_remote_err(e, Problem::UnableToDeleteDir),
        }
    }

    async fn change_attrs(&mut self, item: &QueueItem) -> Exec {
        let mode = match &item.payload {
            ItemPayload::Attrs { attr_mode, .. } => *attr_mode,
            ItemPayload::DirParent { attr_mode: Some(m), .. } => *m,
            _ => {
                return Exec::Escalate(
                    Problem::UnableToChangeAttrs,
                    Some("missing attr payload".into()),
                )
            }
        };
        if let Err(e) = self.conn.change_working_path(&item.source_path).await {
            return self.map_remote_err(e, Problem::UnableToCwd);
        }
        match self.conn.change_attrs(&item.name, mode).await {
            Ok(()) => Exec::Done,
            Err(e) => self.map_remote_err(e, Problem::UnableToChangeAttrs),
        }
    }

    // ─── Downloads ───────────────────────────────────────────────

    async fn download(&mut self, item: &QueueItem, delete_source: bool) -> Exec {
        let (Some(target_path), Some(target_name)) = (&item.target_path, &item.target_name)
        else {
            return Exec::Escalate(Problem::InvalidPath, Some("missing target".into()));
        };
        let ItemPayload::Transfer { mode, resume_offset, modified } = &item.payload else {
            return Exec::Escalate(Problem::InvalidPath, Some("missing transfer payload".into()));
        };
        let mode = *mode;
        let mut offset = *resume_offset;

        let mut target = Path::new(target_path).join(target_name);
        match tokio::fs::metadata(&target).await {
            Ok(meta) if meta.is_dir() => {
                return Exec::Escalate(
                    Problem::TargetFileExists,
                    Some("a directory occupies the target name".into()),
                );
            }
            Ok(meta) => {
                match self.decide_file_collision(item, &meta, *modified) {
                    CollisionDecision::Overwrite => offset = 0,
                    CollisionDecision::Resume => offset = meta.len(),
                    CollisionDecision::Autorename => match autorename_local(&target).await {
                        Some(renamed) => target = renamed,
                        None => {
                            return Exec::Escalate(
                                Problem::TargetFileExists,
                                Some("no free alternative name".into()),
                            )
                        }
                    },
                    CollisionDecision::Skip => {
                        return Exec::Skip(Problem::TargetFileExists, None)
                    }
                    CollisionDecision::Prompt => {
                        return Exec::Escalate(Problem::TargetFileExists, None)
                    }
                }
            }
            Err(_) => {}
        }

        if let Err(e) = self.conn.change_working_path(&item.source_path).await {
            return self.map_remote_err(e, Problem::UnableToCwd);
        }
        let mut ctl = TransferCtl::new(
            self.op.progress(),
            self.pause_rx.clone(),
            self.stop_rx.clone(),
        );
        let target_str = target.to_string_lossy().into_owned();
        let result = self
            .conn
            .download_one_file(
                &item.name,
                item.size,
                mode,
                &item.source_path,
                &target_str,
                offset,
                &mut ctl,
            )
            .await;

        match result {
            Ok(outcome) if outcome.incomplete => {
                ctl.retract();
                self.discard_partial(&target).await;
                let problem = if offset > 0 {
                    Problem::RetryOnResumedFile
                } else if outcome.created {
                    Problem::RetryOnCreatedFile
                } else {
                    Problem::IncompleteDownload
                };
                Exec::Escalate(problem, None)
            }
            Ok(_) => {
                if delete_source {
                    if let Err(e) = self.conn.delete_file(&item.name).await {
                        if e.is_fatal_for_connection() {
                            return Exec::Fatal(Problem::UnableToDeleteSource, e.to_string());
                        }
                        return Exec::Escalate(
                            Problem::UnableToDeleteSource,
                            Some(e.to_string()),
                        );
                    }
                }
                Exec::Done
            }
            Err(e) if e.kind == EngineErrorKind::Aborted => {
                ctl.retract();
                self.discard_partial(&target).await;
                Exec::Abandon
            }
            Err(e) => {
                ctl.retract();
                self.discard_partial(&target).await;
                match e.kind {
                    EngineErrorKind::DiskFull => Exec::Escalate(Problem::DiskFull, Some(e.to_string())),
                    EngineErrorKind::Io | EngineErrorKind::PermissionDenied => {
                        Exec::Escalate(Problem::TargetWriteError, Some(e.to_string()))
                    }
                    _ => self.map_remote_err(e, Problem::IncompleteDownload),
                }
            }
        }
    }

    fn decide_file_collision(
        &self,
        item: &QueueItem,
        existing: &std::fs::Metadata,
        remote_modified: Option<chrono::DateTime<chrono::Utc>>,
    ) -> CollisionDecision {
        match item.forced_action {
            Some(ForcedAction::Overwrite) => return CollisionDecision::Overwrite,
            Some(ForcedAction::Resume) => return CollisionDecision::Resume,
            Some(ForcedAction::Autorename) => return CollisionDecision::Autorename,
            Some(ForcedAction::UseExistingDir) | None => {}
        }
        match self.op.config().overwrite {
            OverwritePolicy::Prompt => CollisionDecision::Prompt,
            OverwritePolicy::Overwrite => CollisionDecision::Overwrite,
            OverwritePolicy::OverwriteIfNewer => {
                let local_modified: Option<chrono::DateTime<chrono::Utc>> =
                    existing.modified().ok().map(|t| t.into());
                match (remote_modified, local_modified) {
                    (Some(remote), Some(local)) if remote > local => {
                        CollisionDecision::Overwrite
                    }
                    (Some(_), Some(_)) => CollisionDecision::Skip,
                    // timestamps unavailable: the user decides
                    _ => CollisionDecision::Prompt,
                }
            }
            OverwritePolicy::Resume | OverwritePolicy::ResumeOrOverwrite => {
                CollisionDecision::Resume
            }
            OverwritePolicy::Autorename => CollisionDecision::Autorename,
            OverwritePolicy::Skip => CollisionDecision::Skip,
        }
    }

    /// Remove a partial target when the resume policy says so.
    async fn discard_partial(&self, target: &Path) {
        if self.op.config().resume == ResumePolicy::DeletePartial {
            if let Err(e) = tokio::fs::remove_file(target).await {
                debug!("partial file cleanup of {:?} failed: {}", target, e);
            }
        }
    }

    // ─── Uploads ─────────────────────────────────────────────────

    async fn upload(&mut self, item: &QueueItem, delete_source: bool) -> Exec {
        let (Some(target_path), Some(target_name)) = (&item.target_path, &item.target_name)
        else {
            return Exec::Escalate(Problem::InvalidPath, Some("missing target".into()));
        };
        let ItemPayload::Transfer { mode, .. } = &item.payload else {
            return Exec::Escalate(Problem::InvalidPath, Some("missing transfer payload".into()));
        };
        let mode = *mode;
        let local = Path::new(&item.source_path).join(&item.name);
        let local_str = local.to_string_lossy().into_owned();

        if let Err(e) = self.conn.change_working_path(target_path).await {
            return self.map_remote_err(e, Problem::UnableToCwd);
        }
        let overwrite = matches!(
            item.forced_action,
            Some(ForcedAction::Overwrite) | Some(ForcedAction::Resume)
        ) || matches!(
            self.op.config().overwrite,
            OverwritePolicy::Overwrite | OverwritePolicy::OverwriteIfNewer
        );
        let mut ctl = TransferCtl::new(
            self.op.progress(),
            self.pause_rx.clone(),
            self.stop_rx.clone(),
        );
        let result = self
            .conn
            .upload_one_file(&local_str, target_name, mode, overwrite, &mut ctl)
            .await;

        match result {
            Ok(outcome) if outcome.incomplete => {
                ctl.retract();
                Exec::Escalate(Problem::IncompleteUpload, None)
            }
            Ok(_) => {
                if delete_source {
                    if let Err(e) = tokio::fs::remove_file(&local).await {
                        return Exec::Escalate(
                            Problem::UnableToDeleteSource,
                            Some(e.to_string()),
                        );
                    }
                }
                Exec::Done
            }
            Err(e) if e.kind == EngineErrorKind::Aborted => {
                ctl.retract();
                Exec::Abandon
            }
            Err(e) if e.kind == EngineErrorKind::AlreadyExists => {
                ctl.retract();
                match self.op.config().overwrite {
                    OverwritePolicy::Skip => Exec::Skip(Problem::TargetFileExists, None),
                    _ => Exec::Escalate(Problem::TargetFileExists, Some(e.to_string())),
                }
            }
            Err(e) => {
                ctl.retract();
                self.map_remote_err(e, Problem::IncompleteUpload)
            }
        }
    }

    async fn delete_local_dir(&mut self, item: &QueueItem) -> Exec {
        let dir = Path::new(&item.source_path).join(&item.name);
        match tokio::fs::remove_dir(&dir).await {
            Ok(()) => Exec::Done,
            Err(e) => Exec::Escalate(Problem::UnableToDeleteDir, Some(e.to_string())),
        }
    }

    // ─── Collision helpers ───────────────────────────────────────

    /// Ensure the local target directory for a download explore exists,
    /// honoring the directory collision policy. Returns the final dir.
    async fn prepare_local_dir(
        &mut self,
        item: &QueueItem,
        target_path: &str,
        target_name: &str,
    ) -> Result<PathBuf, Exec> {
        let mut dir = Path::new(target_path).join(target_name);
        match tokio::fs::metadata(&dir).await {
            Ok(meta) if meta.is_dir() => {
                let use_existing = item.forced_action == Some(ForcedAction::UseExistingDir)
                    || self.op.config().dir_collision == DirCollisionPolicy::UseExisting;
                let rename = item.forced_action == Some(ForcedAction::Autorename)
                    || self.op.config().dir_collision == DirCollisionPolicy::Autorename;
                if rename {
                    match autorename_local(&dir).await {
                        Some(renamed) => dir = renamed,
                        None => {
                            return Err(Exec::Escalate(
                                Problem::TargetDirExists,
                                Some("no free alternative name".into()),
                            ))
                        }
                    }
                } else if !use_existing {
                    return Err(match self.op.config().dir_collision {
                        DirCollisionPolicy::Skip => Exec::Skip(Problem::TargetDirExists, None),
                        _ => Exec::Escalate(Problem::TargetDirExists, None),
                    });
                }
            }
            Ok(_) => {
                return Err(Exec::Escalate(
                    Problem::TargetDirExists,
                    Some("a file occupies the target name".into()),
                ));
            }
            Err(_) => {}
        }
        if let Err(e) = tokio::fs::create_dir_all(&dir).await {
            return Err(Exec::Escalate(
                Problem::TargetWriteError,
                Some(e.to_string()),
            ));
        }
        Ok(dir)
    }

    /// Create the remote target directory for an upload explore in the
    /// current working path. `Ok(Some(name))` carries the final name
    /// (possibly autorenamed), `Ok(None)` means policy-skip.
    async fn create_remote_dir(
        &mut self,
        item: &QueueItem,
        name: &str,
    ) -> Result<Option<String>, Exec> {
        match self.conn.create_dir(name).await {
            Ok(()) => return Ok(Some(name.to_string())),
            Err(e) if e.kind == EngineErrorKind::AlreadyExists => {
                let use_existing = item.forced_action == Some(ForcedAction::UseExistingDir)
                    || self.op.config().dir_collision == DirCollisionPolicy::UseExisting;
                if use_existing {
                    return Ok(Some(name.to_string()));
                }
                let rename = item.forced_action == Some(ForcedAction::Autorename)
                    || self.op.config().dir_collision == DirCollisionPolicy::Autorename;
                if rename {
                    for n in 2..100u32 {
                        let candidate = format!("{} ({})", name, n);
                        match self.conn.create_dir(&candidate).await {
                            Ok(()) => return Ok(Some(candidate)),
                            Err(e) if e.kind == EngineErrorKind::AlreadyExists => continue,
                            Err(e) => return Err(self.map_remote_err(e, Problem::TargetDirExists)),
                        }
                    }
                    return Err(Exec::Escalate(
                        Problem::TargetDirExists,
                        Some("no free alternative name".into()),
                    ));
                }
                match self.op.config().dir_collision {
                    DirCollisionPolicy::Skip => Ok(None),
                    _ => Err(Exec::Escalate(Problem::TargetDirExists, None)),
                }
            }
            Err(e) => Err(self.map_remote_err(e, Problem::TargetDirExists)),
        }
    }

    // ─── Utilities ───────────────────────────────────────────────

    fn map_remote_err(&self, e: EngineError, fallback: Problem) -> Exec {
        if e.is_fatal_for_connection() {
            return match e.kind {
                EngineErrorKind::LoginFailed => {
                    let detail = self
                        .conn
                        .login_error_detail()
                        .unwrap_or_else(|| e.to_string());
                    Exec::FatalAuth(Problem::LoginFailed, detail)
                }
                EngineErrorKind::CertificateUnverified => {
                    Exec::FatalAuth(Problem::CertificateUnverified, e.to_string())
                }
                _ => Exec::Fatal(fallback, e.to_string()),
            };
        }
        let problem = match e.kind {
            EngineErrorKind::NotFound => Problem::InvalidPath,
            EngineErrorKind::DiskFull => Problem::DiskFull,
            EngineErrorKind::OutOfMemory => Problem::LowMemory,
            _ => fallback,
        };
        Exec::Escalate(problem, Some(e.to_string()))
    }

    fn join_remote(&self, path: &str, name: &str) -> String {
        join_remote(path, name, self.op.config().path_delimiter)
    }
}

fn remote_depth(path: &str, delimiter: char) -> usize {
    path.chars().filter(|c| *c == delimiter).count()
}

/// Unknown-bits flag of a change-attrs item, `None` for other kinds.
fn unknown_attr_bits(item: &QueueItem) -> Option<bool> {
    if !matches!(item.kind, ItemKind::ChAttrFile | ItemKind::ChAttrDir) {
        return None;
    }
    match &item.payload {
        ItemPayload::Attrs { unknown_bits, .. } => Some(*unknown_bits),
        ItemPayload::DirParent { unknown_bits, .. } => Some(*unknown_bits),
        _ => None,
    }
}

/// First free "name (n)" variant next to `taken`, extension preserved.
async fn autorename_local(taken: &Path) -> Option<PathBuf> {
    let parent = taken.parent()?;
    let stem = taken.file_stem()?.to_string_lossy().into_owned();
    let ext = taken.extension().map(|e| e.to_string_lossy().into_owned());
    for n in 2..100u32 {
        let candidate = match &ext {
            Some(ext) => parent.join(format!("{} ({}).{}", stem, n, ext)),
            None => parent.join(format!("{} ({})", stem, n)),
        };
        if tokio::fs::metadata(&candidate).await.is_err() {
            return Some(candidate);
        }
    }
    None
}

/// Variant of the copy flow: what to do with an existing target file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CollisionDecision {
    Prompt,
    Overwrite,
    Resume,
    Autorename,
    Skip,
}
