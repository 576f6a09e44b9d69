//! Registry of running operations, held as an explicit value by the
//! embedding session rather than process-global state.

use log::info;

use crate::ops::error::{EngineError, EngineResult};
use crate::ops::operation::Operation;
use crate::ops::pool::WorkerPool;
use crate::ops::queue::OpQueue;
use crate::ops::types::{OperationConfig, OperationKind, ServerPathType};

struct RegistryEntry {
    op: Operation,
    pool: WorkerPool,
}

#[derive(Default)]
pub struct OperationsRegistry {
    entries: Vec<RegistryEntry>,
}

impl OperationsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Create and register an operation over a built queue. Returns a
    /// handle the caller keeps for progress and resolution calls.
    pub fn add_operation(
        &mut self,
        kind: OperationKind,
        config: OperationConfig,
        queue: OpQueue,
    ) -> Operation {
        let op = Operation::new(kind, config, queue);
        let pool = WorkerPool::new(&op);
        self.entries.push(RegistryEntry {
            op: op.clone(),
            pool,
        });
        op
    }

    pub fn get_operation(&self, id: &str) -> Option<Operation> {
        self.entries
            .iter()
            .find(|e| e.op.id() == id)
            .map(|e| e.op.clone())
    }

    pub fn operation_ids(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.op.id().to_string()).collect()
    }

    pub fn pool(&self, id: &str) -> Option<&WorkerPool> {
        self.entries.iter().find(|e| e.op.id() == id).map(|e| &e.pool)
    }

    pub fn pool_mut(&mut self, id: &str) -> Option<&mut WorkerPool> {
        self.entries
            .iter_mut()
            .find(|e| e.op.id() == id)
            .map(|e| &mut e.pool)
    }

    /// Stop one worker of an operation, or all of them.
    pub fn stop_workers(&self, id: &str, worker_id: Option<usize>) -> bool {
        match self.entries.iter().find(|e| e.op.id() == id) {
            Some(entry) => match worker_id {
                Some(wid) => entry.pool.stop_worker(wid),
                None => {
                    entry.pool.stop_all();
                    true
                }
            },
            None => false,
        }
    }

    /// Remove an operation. Refuses while workers are active unless
    /// `force`, in which case they are stopped and awaited first.
    pub async fn delete_operation(&mut self, id: &str, force: bool) -> EngineResult<()> {
        let pos = self
            .entries
            .iter()
            .position(|e| e.op.id() == id)
            .ok_or_else(|| EngineError::unknown_id(format!("operation {}", id)))?;
        if self.entries[pos].pool.active_count() > 0 {
            if !force {
                return Err(EngineError::aborted("operation still has active workers")
                    .with_operation(id));
            }
            self.entries[pos].op.stop();
            self.entries[pos].pool.stop_all();
            self.entries[pos].pool.join_all().await;
        }
        self.entries.remove(pos);
        info!("operation {} removed from registry", id);
        Ok(())
    }

    /// Whether a path on `user@host:port` can be modified without
    /// racing a registered operation. `excluding_id` exempts the asking
    /// operation itself.
    pub fn can_make_changes_on_path(
        &self,
        user: &str,
        host: &str,
        port: u16,
        path: &str,
        path_type: ServerPathType,
        excluding_id: Option<&str>,
    ) -> bool {
        let fold = path_type.is_case_insensitive();
        for entry in &self.entries {
            let cfg = entry.op.config();
            if cfg.port != port
                || !eq_fold(&cfg.host, host, true)
                || !eq_fold(&cfg.user, user, fold)
            {
                continue;
            }
            if excluding_id == Some(entry.op.id()) {
                continue;
            }
            let delimiter = cfg.path_delimiter;
            for pending in entry.op.pending_remote_paths() {
                if paths_overlap(&pending, path, delimiter, fold) {
                    return false;
                }
            }
        }
        true
    }
}

fn eq_fold(a: &str, b: &str, fold: bool) -> bool {
    if fold {
        a.eq_ignore_ascii_case(b)
    } else {
        a == b
    }
}

/// True when one path contains the other (at a delimiter boundary).
fn paths_overlap(a: &str, b: &str, delimiter: char, fold: bool) -> bool {
    let (short, long) = if a.len() <= b.len() { (a, b) } else { (b, a) };
    let short_n = normalize(short, fold);
    let long_n = normalize(long, fold);
    if !long_n.starts_with(&short_n) {
        return false;
    }
    long_n.len() == short_n.len()
        || short_n.ends_with(delimiter)
        || long_n[short_n.len()..].starts_with(delimiter)
}

fn normalize(path: &str, fold: bool) -> String {
    if fold {
        path.to_ascii_lowercase()
    } else {
        path.to_string()
    }
}
