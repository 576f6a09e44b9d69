//! Worker pool: spawns worker tasks for one operation, tracks their
//! liveness, and brokers connection handoff between the owning session
//! and the workers.

use log::{info, warn};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::ops::connection::ConnectionToken;
use crate::ops::operation::Operation;
use crate::ops::worker::{Worker, WorkerShared, WorkerState};

struct WorkerHandle {
    id: usize,
    shared: std::sync::Arc<WorkerShared>,
    stop_tx: watch::Sender<bool>,
    join: Option<JoinHandle<ConnectionToken>>,
}

pub struct WorkerPool {
    op: Operation,
    workers: Vec<WorkerHandle>,
    next_id: usize,
    /// Connections returned by stopped workers, or parked by the
    /// session until a worker claims them.
    spare_connections: Vec<ConnectionToken>,
}

impl WorkerPool {
    pub fn new(op: &Operation) -> Self {
        Self {
            op: op.clone(),
            workers: Vec::new(),
            next_id: 0,
            spare_connections: Vec::new(),
        }
    }

    /// Park a connection without starting a worker (session handoff).
    pub fn give_connection(&mut self, token: ConnectionToken) {
        self.spare_connections.push(token);
    }

    /// Take a parked connection back (session reclaim).
    pub fn reclaim_connection(&mut self) -> Option<ConnectionToken> {
        self.spare_connections.pop()
    }

    /// Spawn a worker on `token`, or on a parked connection when `token`
    /// is `None`. Returns the worker id, or `None` without a connection
    /// or with the configured worker limit reached.
    pub fn add_worker(&mut self, token: Option<ConnectionToken>) -> Option<usize> {
        if self.active_count() >= self.op.config().max_workers {
            if let Some(t) = token {
                self.spare_connections.push(t);
            }
            warn!(
                "operation {}: worker limit {} reached",
                self.op.id(),
                self.op.config().max_workers
            );
            return None;
        }
        let token = match token.or_else(|| self.spare_connections.pop()) {
            Some(t) => t,
            None => return None,
        };
        let id = self.next_id;
        self.next_id += 1;
        let (stop_tx, stop_rx) = watch::channel(false);
        let worker = Worker::new(id, &self.op, token, stop_rx);
        let shared = worker.shared();
        let join = tokio::spawn(worker.run());
        self.workers.push(WorkerHandle {
            id,
            shared,
            stop_tx,
            join: Some(join),
        });
        info!("operation {}: worker {} attached", self.op.id(), id);
        Some(id)
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    pub fn active_count(&self) -> usize {
        self.workers
            .iter()
            .filter(|w| w.shared.state() != WorkerState::Stopped)
            .count()
    }

    /// Any worker currently claiming or executing an item.
    pub fn some_worker_is_working(&self) -> bool {
        self.workers.iter().any(|w| {
            matches!(
                w.shared.state(),
                WorkerState::ClaimingWork | WorkerState::Executing | WorkerState::ErrorWait
            )
        })
    }

    pub fn empty_or_all_stopped(&self) -> bool {
        self.active_count() == 0
    }

    pub fn is_paused(&self) -> bool {
        self.op.is_paused()
    }

    /// A worker is parked on an unresolved item.
    pub fn at_least_one_waiting_for_user(&self) -> bool {
        self.workers
            .iter()
            .any(|w| w.shared.state() == WorkerState::ErrorWait)
    }

    pub fn have_error(&self) -> bool {
        self.workers.iter().any(|w| w.shared.last_error().is_some())
    }

    /// First worker that recorded a connection-level error, with its
    /// message, in attach order.
    pub fn first_error(&self) -> Option<(usize, String)> {
        self.workers
            .iter()
            .find_map(|w| w.shared.last_error().map(|e| (w.id, e)))
    }

    /// Request a stop of one worker; it exits at its next item boundary.
    pub fn stop_worker(&self, id: usize) -> bool {
        match self.workers.iter().find(|w| w.id == id) {
            Some(w) => w.stop_tx.send(true).is_ok(),
            None => false,
        }
    }

    /// Request a stop of every worker without stopping the operation.
    pub fn stop_all(&self) {
        for w in &self.workers {
            let _ = w.stop_tx.send(true);
        }
        // wake idle workers so they observe the flag
        self.op.work_notify().notify_waiters();
    }

    /// Nudge idle workers; called after resolutions or queue additions
    /// made outside the operation's own mutators.
    pub fn post_new_work_available(&self) {
        self.op.work_notify().notify_waiters();
    }

    /// Wake workers parked on a login-class failure after the session's
    /// credentials changed, so they re-attempt with the new data.
    pub fn post_login_changed(&self) {
        self.op.work_notify().notify_waiters();
    }

    /// Await every worker task; their connections go back to the spare
    /// list for reuse or session reclaim.
    pub async fn join_all(&mut self) {
        for w in &mut self.workers {
            if let Some(join) = w.join.take() {
                match join.await {
                    Ok(token) => self.spare_connections.push(token),
                    Err(e) => warn!("worker {} task failed: {}", w.id, e),
                }
            }
        }
        self.workers.clear();
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("operation", &self.op.id())
            .field("workers", &self.workers.len())
            .field("spares", &self.spare_connections.len())
            .finish()
    }
}
