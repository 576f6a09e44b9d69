//! One running bulk operation: the queue, its policies, the live
//! progress counters, and the event channel observers subscribe to.
//!
//! `Operation` is a cheap clone over shared state. Workers drive it from
//! their own tasks; embedders resolve errors and read progress from any
//! thread. The queue mutex is never held across an await.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use log::{info, warn};
use tokio::sync::{broadcast, watch, Notify};
use uuid::Uuid;

use crate::ops::error::EngineResult;
use crate::ops::events::OperationEvent;
use crate::ops::item::{
    ItemState, Problem, QueueItem, Resolution, SolveOutcome,
};
use crate::ops::progress::{EtaEstimator, ProgressShared};
use crate::ops::queue::{OpQueue, TransitionNote, UserInputReport};
use crate::ops::types::{
    ChildCounts, CopyProgress, OperationConfig, OperationKind, OperationState, SimpleProgress,
    TransferMode,
};

const EVENT_CHANNEL_CAPACITY: usize = 256;

struct OperationInner {
    id: String,
    kind: OperationKind,
    config: OperationConfig,
    queue: Mutex<OpQueue>,
    /// Problems the user asked to skip for the whole run.
    skip_all: Mutex<HashSet<Problem>>,
    events: broadcast::Sender<OperationEvent>,
    /// Wakes idle workers when items become claimable again.
    work_notify: Notify,
    progress: Arc<ProgressShared>,
    eta: Mutex<EtaEstimator>,
    pause_tx: watch::Sender<bool>,
    stop_tx: watch::Sender<bool>,
    stopped: AtomicBool,
    finished_emitted: AtomicBool,
}

#[derive(Clone)]
pub struct Operation {
    inner: Arc<OperationInner>,
}

impl Operation {
    pub fn new(kind: OperationKind, config: OperationConfig, queue: OpQueue) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (pause_tx, _) = watch::channel(false);
        let (stop_tx, _) = watch::channel(false);
        let progress = Arc::new(ProgressShared::new());
        progress.set_total(queue.total_known_size());
        let id = Uuid::new_v4().to_string();
        info!(
            "operation {} created: {:?} on {}@{}:{}, {} items",
            id,
            kind,
            config.user,
            config.host,
            config.port,
            queue.len()
        );
        Self {
            inner: Arc::new(OperationInner {
                id,
                kind,
                config,
                queue: Mutex::new(queue),
                skip_all: Mutex::new(HashSet::new()),
                events,
                work_notify: Notify::new(),
                progress,
                eta: Mutex::new(EtaEstimator::new()),
                pause_tx,
                stop_tx,
                stopped: AtomicBool::new(false),
                finished_emitted: AtomicBool::new(false),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn kind(&self) -> OperationKind {
        self.inner.kind
    }

    pub fn config(&self) -> &OperationConfig {
        &self.inner.config
    }

    pub fn progress(&self) -> Arc<ProgressShared> {
        Arc::clone(&self.inner.progress)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<OperationEvent> {
        self.inner.events.subscribe()
    }

    pub fn event_sender(&self) -> broadcast::Sender<OperationEvent> {
        self.inner.events.clone()
    }

    // ─── Pause / stop ────────────────────────────────────────────

    pub fn pause_receiver(&self) -> watch::Receiver<bool> {
        self.inner.pause_tx.subscribe()
    }

    pub fn stop_receiver(&self) -> watch::Receiver<bool> {
        self.inner.stop_tx.subscribe()
    }

    pub fn set_paused(&self, paused: bool) {
        let _ = self.inner.pause_tx.send(paused);
        info!("operation {} {}", self.inner.id, if paused { "paused" } else { "resumed" });
    }

    pub fn is_paused(&self) -> bool {
        *self.inner.pause_tx.borrow()
    }

    /// Request a stop. Workers finish (or abandon at a chunk boundary)
    /// their current item and exit; the queue keeps its state so the
    /// operation can be resumed by attaching fresh workers.
    pub fn stop(&self) {
        self.inner.stopped.store(true, Ordering::SeqCst);
        let _ = self.inner.stop_tx.send(true);
        self.inner.work_notify.notify_waiters();
        info!("operation {} stop requested", self.inner.id);
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::SeqCst)
    }

    pub fn work_notify(&self) -> &Notify {
        &self.inner.work_notify
    }

    // ─── Queue access for workers ────────────────────────────────

    /// Claim the next eligible item, moving it to Processing.
    pub fn claim_next(&self) -> Option<QueueItem> {
        let mut queue = self.lock_queue();
        let item = queue.claim_next();
        if let Some(it) = &item {
            let counts = queue.counts();
            drop(queue);
            self.publish(OperationEvent::ItemTransition {
                uid: it.uid,
                state: ItemState::Processing,
                problem: None,
            });
            self.publish(OperationEvent::CountsChanged { counts });
        }
        item
    }

    /// Apply one item transition and publish the resulting events.
    pub fn set_item_state(
        &self,
        uid: u64,
        state: ItemState,
        problem: Option<Problem>,
        detail: Option<String>,
    ) -> EngineResult<()> {
        let (notes, counts) = {
            let mut queue = self.lock_queue();
            let notes = queue.set_item_state(uid, state, problem, detail)?;
            (notes, queue.counts())
        };
        self.finish_transitions(notes, counts);
        Ok(())
    }

    /// Commit an explore expansion: children plus optional delayed
    /// parent appended, explore marked Done, totals refreshed.
    pub fn replace_explored(
        &self,
        explore_uid: u64,
        dir_parent: Option<QueueItem>,
        children: Vec<QueueItem>,
    ) -> EngineResult<()> {
        let (notes, counts, total) = {
            let mut queue = self.lock_queue();
            let notes = queue.replace_explored(explore_uid, dir_parent, children)?;
            (notes, queue.counts(), queue.total_known_size())
        };
        self.inner.progress.set_total(total);
        self.publish(OperationEvent::Progress {
            transferred: self.inner.progress.transferred(),
            total,
        });
        self.finish_transitions(notes, counts);
        Ok(())
    }

    fn finish_transitions(&self, notes: Vec<TransitionNote>, counts: ChildCounts) {
        let mut work_appeared = false;
        for note in notes {
            if note.state == ItemState::Waiting {
                work_appeared = true;
            }
            self.publish(OperationEvent::ItemTransition {
                uid: note.uid,
                state: note.state,
                problem: note.problem,
            });
        }
        self.publish(OperationEvent::CountsChanged { counts });
        if work_appeared {
            self.inner.work_notify.notify_waiters();
        }
    }

    /// Try a silent retry of a processing item under the retry budget.
    /// Returns `true` when the item went back to Waiting.
    pub fn retry_item(&self, uid: u64) -> EngineResult<bool> {
        let max = self.inner.config.retry.max_retries;
        let (notes, counts) = {
            let mut queue = self.lock_queue();
            match queue.retry_item(uid, max)? {
                Some(notes) => (notes, queue.counts()),
                None => return Ok(false),
            }
        };
        self.finish_transitions(notes, counts);
        Ok(true)
    }

    // ─── Error resolution ────────────────────────────────────────

    /// Whether a skip-all decision already covers `problem`. Workers
    /// consult this before escalating, so one answer covers the run.
    pub fn skip_all_covers(&self, problem: Problem) -> bool {
        match self.inner.skip_all.lock() {
            Ok(set) => set.contains(&problem),
            Err(poisoned) => poisoned.into_inner().contains(&problem),
        }
    }

    /// Apply an external decision to an errored item. `SkipAll` also
    /// resolves every other item currently stuck on the same problem
    /// and suppresses future escalations of it.
    pub fn solve_error_on_item(
        &self,
        uid: u64,
        resolution: Resolution,
    ) -> EngineResult<SolveOutcome> {
        let (outcome, notes, counts) = {
            let mut queue = self.lock_queue();
            let (outcome, mut notes) = queue.solve_error_on_item(uid, &resolution)?;
            if outcome == SolveOutcome::Applied && resolution == Resolution::SkipAll {
                if let Some(problem) = queue.item(uid).and_then(|i| i.problem) {
                    self.note_skip_all(problem);
                    for other in queue.items_with_problem(problem) {
                        match queue.solve_error_on_item(other, &Resolution::Skip) {
                            Ok((_, more)) => notes.extend(more),
                            Err(e) => warn!("skip-all on item {}: {}", other, e),
                        }
                    }
                }
            }
            (outcome, notes, queue.counts())
        };
        if outcome == SolveOutcome::Applied {
            info!(
                "operation {}: item {} resolved with {:?}",
                self.inner.id, uid, resolution
            );
            self.finish_transitions(notes, counts);
        }
        Ok(outcome)
    }

    /// Record that `problem` is skip-all'd for the rest of the
    /// operation. Normally set through a `SkipAll` resolution.
    pub fn note_skip_all(&self, problem: Problem) {
        match self.inner.skip_all.lock() {
            Ok(mut set) => {
                set.insert(problem);
            }
            Err(poisoned) => {
                poisoned.into_inner().insert(problem);
            }
        }
    }

    // ─── Queries ─────────────────────────────────────────────────

    pub fn counts(&self) -> ChildCounts {
        self.lock_queue().counts()
    }

    pub fn get_simple_progress(&self) -> SimpleProgress {
        self.lock_queue().get_simple_progress()
    }

    pub fn get_copy_progress(&self) -> CopyProgress {
        let live = self.inner.progress.transferred();
        self.lock_queue().get_copy_progress(live)
    }

    pub fn get_user_input_needed(
        &self,
        only_ui_needed: bool,
        focused_uid: Option<u64>,
    ) -> UserInputReport {
        self.lock_queue().get_user_input_needed(only_ui_needed, focused_uid)
    }

    pub fn is_item_with_error_to_solve(&self, index: usize) -> Option<(bool, bool)> {
        self.lock_queue().is_item_with_error_to_solve(index)
    }

    pub fn get_item_index(&self, uid: u64) -> Option<usize> {
        self.lock_queue().get_item_index(uid)
    }

    pub fn get_item_uid(&self, index: usize) -> Option<u64> {
        self.lock_queue().get_item_uid(index)
    }

    pub fn get_item(&self, uid: u64) -> Option<QueueItem> {
        self.lock_queue().item(uid).cloned()
    }

    pub fn queue_len(&self) -> usize {
        self.lock_queue().len()
    }

    pub fn take_dirty(&self) -> crate::ops::types::DirtyUids {
        self.lock_queue().take_dirty()
    }

    pub fn has_unfinished_items(&self) -> bool {
        self.lock_queue().has_unfinished()
    }

    pub fn has_claimable_items(&self) -> bool {
        self.lock_queue().has_claimable()
    }

    /// Full remote paths of items still in play; cold path, used by the
    /// registry's conflict check.
    pub fn pending_remote_paths(&self) -> Vec<String> {
        let delimiter = self.inner.config.path_delimiter;
        self.lock_queue().pending_remote_paths(delimiter)
    }

    /// Smoothed, step-rounded seconds remaining. `None` until enough
    /// throughput history exists.
    pub fn estimated_seconds_left(&self) -> Option<u64> {
        let transferred = self.inner.progress.transferred();
        let total = self.inner.progress.total();
        let remaining = total.saturating_sub(transferred);
        let bps = self.inner.progress.bytes_per_sec();
        match self.inner.eta.lock() {
            Ok(mut eta) => eta.update(remaining, bps),
            Err(poisoned) => poisoned.into_inner().update(remaining, bps),
        }
    }

    /// Overall state derived from the queue and worker liveness.
    /// `workers_active` comes from the pool; with `peek` the terminal
    /// event is not published, so observers see it exactly once.
    pub fn get_operation_state(&self, workers_active: bool, peek: bool) -> OperationState {
        let state = {
            let queue = self.lock_queue();
            if workers_active {
                OperationState::InProgress
            } else if queue.has_unfinished() && !self.is_stopped() {
                // pending or blocked items remain and nobody gave up on
                // them; a worker or a resolution can still move them
                OperationState::InProgress
            } else {
                let counts = queue.counts();
                if counts.failed > 0 {
                    OperationState::FinishedWithErrors
                } else if counts.skipped > 0
                    || counts.waiting > 0
                    || counts.delayed > 0
                    || counts.ui_needed > 0
                {
                    OperationState::FinishedWithSkips
                } else {
                    OperationState::SuccessfullyFinished
                }
            }
        };
        if !peek
            && state != OperationState::InProgress
            && !self.inner.finished_emitted.swap(true, Ordering::SeqCst)
        {
            info!("operation {} finished: {:?}", self.inner.id, state);
            self.publish(OperationEvent::Finished { state });
        }
        state
    }

    /// Transfer mode for one file name under the operation's policy.
    pub fn transfer_mode_for(&self, name: &str) -> TransferMode {
        crate::ops::builder::transfer_mode_for(&self.inner.config, name)
    }

    // ─── Internals ───────────────────────────────────────────────

    fn lock_queue(&self) -> std::sync::MutexGuard<'_, OpQueue> {
        match self.inner.queue.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn publish(&self, event: OperationEvent) {
        // losing events to a lagging or absent subscriber is fine,
        // every payload is re-derivable from the queries
        let _ = self.inner.events.send(event);
    }
}

impl std::fmt::Debug for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Operation")
            .field("id", &self.inner.id)
            .field("kind", &self.inner.kind)
            .finish()
    }
}
