//! Operation queue - ordered items, UID index, claim/expansion, and the
//! incremental bookkeeping every progress query reads from.
//!
//! The queue is the only structure mutated by more than one worker; the
//! owner wraps it in a mutex and keeps critical sections free of awaits.
//! All aggregate counters are maintained transition-by-transition so no
//! query ever rescans the item vector on the hot path.

use std::collections::HashMap;

use log::{debug, warn};

use crate::ops::error::{EngineError, EngineResult};
use crate::ops::item::{
    DirChildCounts, ItemPayload, ItemState, Problem, QueueItem, Resolution, SolveOutcome,
};
use crate::ops::types::{ChildCounts, CopyProgress, DirtyUids, SimpleProgress, SizeUnit};

/// One state change applied by a queue mutation. Expansion and delayed
/// parent promotion can produce several per call; the caller publishes
/// them as events outside the lock.
#[derive(Debug, Clone)]
pub struct TransitionNote {
    pub uid: u64,
    pub state: ItemState,
    pub problem: Option<Problem>,
}

/// Result of enumerating items needing user input.
#[derive(Debug, Clone, Default)]
pub struct UserInputReport {
    pub count: usize,
    /// Queue indices of the matching items, in queue order.
    pub indices: Vec<usize>,
    /// Position of the focused UID within `indices`, when present.
    pub focused: Option<usize>,
}

pub struct OpQueue {
    items: Vec<QueueItem>,
    /// UID -> position; rebuilt on deletion. UIDs are never reused.
    index: HashMap<u64, usize>,
    next_uid: u64,
    counts: ChildCounts,
    /// Waiting explore/resolve items; while nonzero only those are
    /// claimable, so size totals stabilise as early as possible.
    explore_waiting: usize,

    // transfer-item accounting (copy/move/upload progress)
    unit: SizeUnit,
    total_known_size: u64,
    skipped_size: u64,
    unknown_size_count: usize,
    transfer_total: usize,
    transfer_waiting: usize,
    transfer_done: usize,
    transfer_error: usize,

    // at most two mutated UIDs since the last consumer poll
    dirty: Vec<u64>,
    dirty_overflow: bool,
}

impl OpQueue {
    pub fn new(unit: SizeUnit) -> Self {
        Self {
            items: Vec::new(),
            index: HashMap::new(),
            next_uid: 1,
            counts: ChildCounts::default(),
            explore_waiting: 0,
            unit,
            total_known_size: 0,
            skipped_size: 0,
            unknown_size_count: 0,
            transfer_total: 0,
            transfer_waiting: 0,
            transfer_done: 0,
            transfer_error: 0,
            dirty: Vec::new(),
            dirty_overflow: false,
        }
    }

    // ─── Basic access ────────────────────────────────────────────

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn unit(&self) -> SizeUnit {
        self.unit
    }

    pub fn get_item_index(&self, uid: u64) -> Option<usize> {
        self.index.get(&uid).copied()
    }

    pub fn get_item_uid(&self, index: usize) -> Option<u64> {
        self.items.get(index).map(|i| i.uid)
    }

    pub fn item(&self, uid: u64) -> Option<&QueueItem> {
        self.get_item_index(uid).map(|i| &self.items[i])
    }

    pub fn item_at(&self, index: usize) -> Option<&QueueItem> {
        self.items.get(index)
    }

    pub fn counts(&self) -> ChildCounts {
        self.counts
    }

    pub fn total_known_size(&self) -> u64 {
        self.total_known_size
    }

    // ─── Insertion ───────────────────────────────────────────────

    /// Tail-append. Fails only on allocation exhaustion; the caller must
    /// roll back partial work and surface the failure.
    pub fn add_item(&mut self, mut item: QueueItem) -> EngineResult<u64> {
        self.items
            .try_reserve(1)
            .map_err(|e| EngineError::out_of_memory(format!("queue append: {}", e)))?;
        self.index
            .try_reserve(1)
            .map_err(|e| EngineError::out_of_memory(format!("queue index: {}", e)))?;

        let uid = self.next_uid;
        self.next_uid += 1;
        item.uid = uid;

        self.count_in(&item);
        if let Some(parent) = item.parent_uid {
            self.bump_parent(parent, |c| c.not_done += 1);
        }

        self.index.insert(uid, self.items.len());
        self.items.push(item);
        self.mark_dirty(uid);
        Ok(uid)
    }

    /// Remove a terminal item. O(n): positions after it shift, so the
    /// UID index is rebuilt. Pending items cannot be removed.
    pub fn remove_item(&mut self, uid: u64) -> EngineResult<()> {
        let pos = self
            .get_item_index(uid)
            .ok_or_else(|| EngineError::unknown_id(format!("item {}", uid)).with_item(uid))?;
        if self.items[pos].is_pending() {
            return Err(
                EngineError::invalid_config("cannot remove a pending item").with_item(uid)
            );
        }
        let item = self.items.remove(pos);
        self.count_out(&item);
        self.index.clear();
        for (i, it) in self.items.iter().enumerate() {
            self.index.insert(it.uid, i);
        }
        self.mark_dirty(uid);
        Ok(())
    }

    // ─── Claiming ────────────────────────────────────────────────

    /// Claim the first eligible Waiting item: explore/resolve items
    /// first, then leaves in queue order. The claimed item moves to
    /// Processing under this call, so at most one worker ever holds it.
    pub fn claim_next(&mut self) -> Option<QueueItem> {
        let explore_only = self.explore_waiting > 0;
        let pos = self.items.iter().position(|i| {
            i.state == ItemState::Waiting && (!explore_only || i.kind.is_explore_or_resolve())
        })?;
        let uid = self.items[pos].uid;
        // legality is by construction here; ignore the note list
        if let Err(e) = self.set_item_state(uid, ItemState::Processing, None, None) {
            warn!("claim of item {} failed: {}", uid, e);
            return None;
        }
        Some(self.items[pos].clone())
    }

    /// Any item a worker could claim right now.
    pub fn has_claimable(&self) -> bool {
        self.counts.waiting > 0
    }

    /// Any item still pending or awaiting a decision. While true, idle
    /// workers sleep instead of exiting (work may reappear after a
    /// resolution or a delayed-parent promotion).
    pub fn has_unfinished(&self) -> bool {
        self.counts.waiting + self.counts.delayed + self.counts.processing + self.counts.ui_needed
            > 0
    }

    // ─── State transitions ───────────────────────────────────────

    /// Apply one item transition, updating every dependent counter and
    /// cascading delayed-parent promotions. Returns the transitions
    /// applied (the requested one plus any promotions).
    pub fn set_item_state(
        &mut self,
        uid: u64,
        state: ItemState,
        problem: Option<Problem>,
        detail: Option<String>,
    ) -> EngineResult<Vec<TransitionNote>> {
        let pos = self
            .get_item_index(uid)
            .ok_or_else(|| EngineError::unknown_id(format!("item {}", uid)).with_item(uid))?;
        let old = self.items[pos].state;
        if !old.can_transition_to(state) {
            return Err(EngineError::illegal_transition(format!(
                "item {}: {:?} -> {:?}",
                uid, old, state
            ))
            .with_item(uid));
        }

        let snapshot = self.items[pos].clone();
        self.count_out(&snapshot);
        {
            let item = &mut self.items[pos];
            item.state = state;
            item.problem = problem;
            item.problem_detail = detail;
        }
        let item = self.items[pos].clone();
        self.count_in(&item);
        self.mark_dirty(uid);
        debug!("item {} ({:?}): {:?} -> {:?}", uid, item.kind, old, state);

        let mut notes = vec![TransitionNote {
            uid,
            state,
            problem,
        }];

        // report to the delayed parent, possibly cascading upward
        if let Some(parent) = item.parent_uid {
            self.report_to_parent(parent, old, state, &mut notes);
        }
        Ok(notes)
    }

    fn report_to_parent(
        &mut self,
        parent_uid: u64,
        child_old: ItemState,
        child_new: ItemState,
        notes: &mut Vec<TransitionNote>,
    ) {
        let mut work = vec![(parent_uid, child_old, child_new)];
        while let Some((puid, old, new)) = work.pop() {
            let Some(pos) = self.get_item_index(puid) else {
                continue;
            };
            {
                let parent = &mut self.items[pos];
                let ItemPayload::DirParent { children, .. } = &mut parent.payload else {
                    continue;
                };
                apply_child_report(children, old, new);
            }
            let parent = self.items[pos].clone();
            let ItemPayload::DirParent { children, .. } = &parent.payload else {
                continue;
            };
            if parent.state != ItemState::Delayed || children.not_done > 0 {
                continue;
            }

            // all children finished: promote
            let blocked = parent.kind.fails_on_child_errors()
                && (children.failed > 0 || children.skipped > 0);
            let next = if blocked {
                ItemState::ForcedToFail
            } else {
                ItemState::Waiting
            };
            self.count_out(&parent);
            self.items[pos].state = next;
            let promoted = self.items[pos].clone();
            self.count_in(&promoted);
            self.mark_dirty(puid);
            debug!(
                "delayed parent {} ({:?}) promoted to {:?}",
                puid, promoted.kind, next
            );
            notes.push(TransitionNote {
                uid: puid,
                state: next,
                problem: promoted.problem,
            });
            if next == ItemState::ForcedToFail {
                if let Some(gp) = promoted.parent_uid {
                    work.push((gp, ItemState::Delayed, next));
                }
            }
            // a promotion to Waiting reports to the grandparent only
            // when the parent itself later reaches a terminal state
        }
    }

    // ─── Expansion ───────────────────────────────────────────────

    /// Atomically expand a successfully processed explore item: append
    /// the optional delayed parent-directory item, then the children
    /// (linked to it), then mark the explore Done. Children are only
    /// claimable once this commits, which is the one ordering dependency
    /// the engine enforces.
    ///
    /// On allocation failure everything appended so far is rolled back
    /// and the explore item is left for the caller to mark Failed.
    pub fn replace_explored(
        &mut self,
        explore_uid: u64,
        dir_parent: Option<QueueItem>,
        mut children: Vec<QueueItem>,
    ) -> EngineResult<Vec<TransitionNote>> {
        let explore_pos = self
            .get_item_index(explore_uid)
            .ok_or_else(|| EngineError::unknown_id(format!("item {}", explore_uid)))?;
        if self.items[explore_pos].state != ItemState::Processing {
            return Err(EngineError::illegal_transition(format!(
                "explore item {} expanded while {:?}",
                explore_uid, self.items[explore_pos].state
            ))
            .with_item(explore_uid));
        }
        let grandparent = self.items[explore_pos].parent_uid;

        let first_new = self.items.len();
        let result: EngineResult<Option<u64>> = (|| {
            let parent_uid = match dir_parent {
                Some(mut p) => {
                    p.state = ItemState::Delayed;
                    p.parent_uid = grandparent;
                    if !matches!(p.payload, ItemPayload::DirParent { .. }) {
                        p.payload = ItemPayload::DirParent {
                            children: DirChildCounts::default(),
                            attr_mode: None,
                            unknown_bits: false,
                        };
                    }
                    Some(self.add_item(p)?)
                }
                None => None,
            };
            for child in children.drain(..) {
                let mut child = child;
                child.parent_uid = parent_uid.or(grandparent);
                self.add_item(child)?;
            }
            Ok(parent_uid)
        })();

        let parent_uid = match result {
            Ok(p) => p,
            Err(e) => {
                // roll back partial expansion; UIDs burned are not reused
                while self.items.len() > first_new {
                    let Some(item) = self.items.pop() else { break };
                    self.count_out(&item);
                    if let Some(p) = item.parent_uid {
                        self.bump_parent(p, |c| c.not_done = c.not_done.saturating_sub(1));
                    }
                    self.index.remove(&item.uid);
                }
                return Err(e);
            }
        };

        let mut notes = self.set_item_state(explore_uid, ItemState::Done, None, None)?;

        // an empty directory's parent has nothing to wait for
        if let Some(puid) = parent_uid {
            if let Some(pos) = self.get_item_index(puid) {
                if let ItemPayload::DirParent { children, .. } = &self.items[pos].payload {
                    if children.not_done == 0 && self.items[pos].state == ItemState::Delayed {
                        let before = self.items[pos].clone();
                        self.count_out(&before);
                        self.items[pos].state = ItemState::Waiting;
                        let promoted = self.items[pos].clone();
                        self.count_in(&promoted);
                        self.mark_dirty(puid);
                        notes.push(TransitionNote {
                            uid: puid,
                            state: ItemState::Waiting,
                            problem: None,
                        });
                    }
                }
            }
        }
        Ok(notes)
    }

    // ─── Resolution ──────────────────────────────────────────────

    /// Apply an external decision to a `UserInputNeeded` item.
    /// Idempotent: a second call on an already-resolved UID is a no-op
    /// returning [`SolveOutcome::AlreadyResolved`].
    pub fn solve_error_on_item(
        &mut self,
        uid: u64,
        resolution: &Resolution,
    ) -> EngineResult<(SolveOutcome, Vec<TransitionNote>)> {
        let pos = self
            .get_item_index(uid)
            .ok_or_else(|| EngineError::unknown_id(format!("item {}", uid)).with_item(uid))?;
        if self.items[pos].state != ItemState::UserInputNeeded {
            return Ok((SolveOutcome::AlreadyResolved, Vec::new()));
        }

        let next = match resolution {
            Resolution::Retry => {
                self.items[pos].retries_used = 0;
                ItemState::Waiting
            }
            Resolution::Skip | Resolution::SkipAll => ItemState::Skipped,
            Resolution::ApplyToAll { attr_mode } => {
                match &mut self.items[pos].payload {
                    ItemPayload::Attrs { attr_mode: m, unknown_bits } => {
                        *m = *attr_mode;
                        *unknown_bits = false;
                    }
                    ItemPayload::DirParent { attr_mode: m, unknown_bits, .. } => {
                        *m = Some(*attr_mode);
                        *unknown_bits = false;
                    }
                    _ => {}
                }
                ItemState::Waiting
            }
            Resolution::Overwrite => {
                self.items[pos].forced_action = Some(crate::ops::item::ForcedAction::Overwrite);
                ItemState::Waiting
            }
            Resolution::Resume => {
                self.items[pos].forced_action = Some(crate::ops::item::ForcedAction::Resume);
                ItemState::Waiting
            }
            Resolution::UseExistingDir => {
                self.items[pos].forced_action =
                    Some(crate::ops::item::ForcedAction::UseExistingDir);
                ItemState::Waiting
            }
            Resolution::Autorename => {
                self.items[pos].forced_action = Some(crate::ops::item::ForcedAction::Autorename);
                ItemState::Waiting
            }
        };

        // the answered problem stays on the item until it next reports:
        // a worker re-claiming it can tell a confirmed prompt from a
        // fresh one and will not raise the same question again
        let problem = self.items[pos].problem;
        let detail = self.items[pos].problem_detail.clone();
        let notes = self.set_item_state(uid, next, problem, detail)?;
        Ok((SolveOutcome::Applied, notes))
    }

    /// Requeue a processing item for a silent retry. Returns the notes
    /// when the retry budget allows it, `None` once it is spent (the
    /// caller escalates instead).
    pub fn retry_item(
        &mut self,
        uid: u64,
        max_retries: u32,
    ) -> EngineResult<Option<Vec<TransitionNote>>> {
        let pos = self
            .get_item_index(uid)
            .ok_or_else(|| EngineError::unknown_id(format!("item {}", uid)).with_item(uid))?;
        if self.items[pos].retries_used >= max_retries {
            return Ok(None);
        }
        self.items[pos].retries_used += 1;
        let problem = self.items[pos].problem;
        let detail = self.items[pos].problem_detail.clone();
        let notes = self.set_item_state(uid, ItemState::Waiting, problem, detail)?;
        Ok(Some(notes))
    }

    /// Every `UserInputNeeded` item whose problem matches `problem`.
    /// Used to broadcast a skip-all decision.
    pub fn items_with_problem(&self, problem: Problem) -> Vec<u64> {
        self.items
            .iter()
            .filter(|i| i.state == ItemState::UserInputNeeded && i.problem == Some(problem))
            .map(|i| i.uid)
            .collect()
    }

    // ─── Progress queries ────────────────────────────────────────

    /// Snapshot for delete / change-attrs operations.
    pub fn get_simple_progress(&self) -> SimpleProgress {
        SimpleProgress {
            done_or_skipped: self.counts.done + self.counts.skipped,
            total: self.counts.total,
            unknown_size_count: self.unknown_size_count,
            waiting: self.counts.waiting + self.counts.delayed,
        }
    }

    /// Snapshot for transfer operations. `live_transferred` is the
    /// operation's live byte counter; skipped sizes are folded in so
    /// the bar can still reach 100%.
    pub fn get_copy_progress(&self, live_transferred: u64) -> CopyProgress {
        CopyProgress {
            transferred: live_transferred + self.skipped_size,
            total: self.total_known_size,
            waiting: self.transfer_waiting,
            unknown_size_count: self.unknown_size_count,
            error_count: self.transfer_error,
            done_count: self.transfer_done,
            total_count: self.transfer_total,
            unit: self.unit,
        }
    }

    /// Enumerate items needing user input (optionally including plain
    /// failures), mapping `focused_uid` to its slot in the result.
    pub fn get_user_input_needed(
        &self,
        only_ui_needed: bool,
        focused_uid: Option<u64>,
    ) -> UserInputReport {
        let mut report = UserInputReport::default();
        for (i, item) in self.items.iter().enumerate() {
            let matches = if only_ui_needed {
                item.state == ItemState::UserInputNeeded
            } else {
                item.is_in_error_state()
            };
            if matches {
                if focused_uid == Some(item.uid) {
                    report.focused = Some(report.indices.len());
                }
                report.indices.push(i);
            }
        }
        report.count = report.indices.len();
        report
    }

    /// For an item in an error state: whether "retry" and "skip" are
    /// offerable to the user. `None` when the item has no error.
    pub fn is_item_with_error_to_solve(&self, index: usize) -> Option<(bool, bool)> {
        let item = self.items.get(index)?;
        match item.state {
            ItemState::UserInputNeeded => {
                let unresolvable = item.problem.map(|p| p.is_unresolvable()).unwrap_or(false);
                Some((!unresolvable, true))
            }
            // a failed/forced item can be re-run wholesale, not skipped
            // (it already performs no further work)
            ItemState::Failed | ItemState::ForcedToFail => Some((true, false)),
            _ => None,
        }
    }

    /// Full remote paths of items still in play. Cold path, used only
    /// for cross-operation conflict checks.
    pub fn pending_remote_paths(&self, delimiter: char) -> Vec<String> {
        self.items
            .iter()
            .filter(|i| i.is_pending() || i.state == ItemState::UserInputNeeded)
            .map(|i| crate::ops::types::join_remote(&i.source_path, &i.name, delimiter))
            .collect()
    }

    // ─── Dirty tracking ──────────────────────────────────────────

    /// UIDs mutated since the previous call. At most two are tracked:
    /// more means the consumer must refresh everything.
    pub fn take_dirty(&mut self) -> DirtyUids {
        let result = if self.dirty_overflow {
            DirtyUids::Overflow
        } else if self.dirty.is_empty() {
            DirtyUids::None
        } else {
            DirtyUids::Some(self.dirty.clone())
        };
        self.dirty.clear();
        self.dirty_overflow = false;
        result
    }

    fn mark_dirty(&mut self, uid: u64) {
        if self.dirty_overflow || self.dirty.contains(&uid) {
            return;
        }
        if self.dirty.len() < 2 {
            self.dirty.push(uid);
        } else {
            self.dirty.clear();
            self.dirty_overflow = true;
        }
    }

    // ─── Counter plumbing ────────────────────────────────────────

    fn bump_parent(&mut self, parent_uid: u64, f: impl FnOnce(&mut DirChildCounts)) {
        if let Some(pos) = self.get_item_index(parent_uid) {
            if let ItemPayload::DirParent { children, .. } = &mut self.items[pos].payload {
                f(children);
            }
        }
    }

    fn count_in(&mut self, item: &QueueItem) {
        self.counts.total += 1;
        match item.state {
            ItemState::Waiting => {
                self.counts.waiting += 1;
                if item.kind.is_explore_or_resolve() {
                    self.explore_waiting += 1;
                }
            }
            ItemState::Delayed => self.counts.delayed += 1,
            ItemState::Processing => self.counts.processing += 1,
            ItemState::UserInputNeeded => self.counts.ui_needed += 1,
            ItemState::Skipped => self.counts.skipped += 1,
            ItemState::Done => self.counts.done += 1,
            ItemState::Failed | ItemState::ForcedToFail => self.counts.failed += 1,
        }
        if item.kind.is_transfer() {
            self.transfer_total += 1;
            match item.state {
                ItemState::Waiting | ItemState::Delayed => self.transfer_waiting += 1,
                ItemState::Done => self.transfer_done += 1,
                ItemState::Failed | ItemState::ForcedToFail => self.transfer_error += 1,
                _ => {}
            }
            match item.size {
                Some(s) => {
                    self.total_known_size += s;
                    if item.state == ItemState::Skipped {
                        self.skipped_size += s;
                    }
                }
                None => self.unknown_size_count += 1,
            }
        }
    }

    fn count_out(&mut self, item: &QueueItem) {
        self.counts.total -= 1;
        match item.state {
            ItemState::Waiting => {
                self.counts.waiting -= 1;
                if item.kind.is_explore_or_resolve() {
                    self.explore_waiting -= 1;
                }
            }
            ItemState::Delayed => self.counts.delayed -= 1,
            ItemState::Processing => self.counts.processing -= 1,
            ItemState::UserInputNeeded => self.counts.ui_needed -= 1,
            ItemState::Skipped => self.counts.skipped -= 1,
            ItemState::Done => self.counts.done -= 1,
            ItemState::Failed | ItemState::ForcedToFail => self.counts.failed -= 1,
        }
        if item.kind.is_transfer() {
            self.transfer_total -= 1;
            match item.state {
                ItemState::Waiting | ItemState::Delayed => self.transfer_waiting -= 1,
                ItemState::Done => self.transfer_done -= 1,
                ItemState::Failed | ItemState::ForcedToFail => self.transfer_error -= 1,
                _ => {}
            }
            match item.size {
                Some(s) => {
                    self.total_known_size -= s;
                    if item.state == ItemState::Skipped {
                        self.skipped_size -= s;
                    }
                }
                None => self.unknown_size_count -= 1,
            }
        }
    }
}

/// Update a delayed parent's child counters for one child transition.
fn apply_child_report(children: &mut DirChildCounts, old: ItemState, new: ItemState) {
    if old == ItemState::UserInputNeeded {
        children.ui_needed = children.ui_needed.saturating_sub(1);
    }
    if new == ItemState::UserInputNeeded {
        children.ui_needed += 1;
    }
    if !old.is_terminal() && new.is_terminal() {
        children.not_done = children.not_done.saturating_sub(1);
        match new {
            ItemState::Skipped => children.skipped += 1,
            ItemState::Failed | ItemState::ForcedToFail => children.failed += 1,
            _ => {}
        }
    }
}
