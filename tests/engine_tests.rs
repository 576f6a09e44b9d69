//! End-to-end engine tests over a scripted in-memory connection.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Semaphore;

use bulkftp::ops::builder::{build_delete_queue, build_download_queue, build_chattr_queue};
use bulkftp::ops::connection::{
    ChunkVerdict, EntryKind, FtpConnection, LinkTarget, ListingEntry, TransferCtl,
    TransferOutcome,
};
use bulkftp::ops::item::{ItemState, Problem, Resolution};
use bulkftp::ops::types::{
    HiddenFilePolicy, OperationConfig, OperationKind, OperationState, OverwritePolicy, SizeUnit,
    TransferMode, TransferModePolicy,
};
use bulkftp::{ConnectionToken, EngineError, EngineResult, OperationsRegistry};

// ─── Scripted remote ─────────────────────────────────────────────────

#[derive(Default)]
struct MockRemote {
    /// Directory path -> listing.
    dirs: Mutex<HashMap<String, Vec<ListingEntry>>>,
    /// File path -> size, for downloads.
    files: Mutex<HashMap<String, u64>>,
    links: Mutex<HashMap<String, LinkTarget>>,
    deleted_files: Mutex<Vec<String>>,
    deleted_dirs: Mutex<Vec<String>>,
    attr_calls: Mutex<Vec<(String, u32)>>,
    reject_delete: Mutex<HashSet<String>>,
    /// When set, every command fails as a login rejection.
    fail_auth: Mutex<bool>,
    /// When set, every file deletion fails as a dropped connection.
    drop_connection: Mutex<bool>,
    /// Certificates handed to connections via `set_certificate`.
    trusted_certs: Mutex<Vec<Vec<u8>>>,
    /// When set, every file deletion takes one permit first.
    delete_gate: Option<Arc<Semaphore>>,
    /// Per-chunk delay for transfers; lets tests pause mid-file.
    chunk_delay: Option<Duration>,
}

impl MockRemote {
    fn with_dir(self, path: &str, entries: Vec<ListingEntry>) -> Self {
        self.dirs.lock().unwrap().insert(path.into(), entries);
        self
    }

    fn with_file(self, path: &str, size: u64) -> Self {
        self.files.lock().unwrap().insert(path.into(), size);
        self
    }
}

fn file(name: &str, size: u64) -> ListingEntry {
    ListingEntry {
        name: name.into(),
        kind: EntryKind::File,
        size: Some(size),
        modified: None,
        is_hidden: false,
        attr_mode: None,
        unknown_attr_bits: false,
    }
}

fn hidden_file(name: &str, size: u64) -> ListingEntry {
    ListingEntry {
        is_hidden: true,
        ..file(name, size)
    }
}

fn dir(name: &str) -> ListingEntry {
    ListingEntry {
        name: name.into(),
        kind: EntryKind::Directory,
        size: None,
        modified: None,
        is_hidden: false,
        attr_mode: None,
        unknown_attr_bits: false,
    }
}

struct MockConnection {
    remote: Arc<MockRemote>,
    cwd: String,
}

impl MockConnection {
    fn token(remote: &Arc<MockRemote>) -> ConnectionToken {
        ConnectionToken::new(Box::new(MockConnection {
            remote: Arc::clone(remote),
            cwd: "/".into(),
        }))
    }

    fn full(&self, name: &str) -> String {
        if self.cwd.ends_with('/') {
            format!("{}{}", self.cwd, name)
        } else {
            format!("{}/{}", self.cwd, name)
        }
    }
}

const CHUNK: u64 = 1024;

#[async_trait]
impl FtpConnection for MockConnection {
    async fn change_working_path(&mut self, path: &str) -> EngineResult<()> {
        if self.remote.dirs.lock().unwrap().contains_key(path) {
            self.cwd = path.to_string();
            Ok(())
        } else {
            Err(EngineError::not_found(format!("550 {}: no such directory", path)))
        }
    }

    async fn list_working_path(&mut self) -> EngineResult<Vec<ListingEntry>> {
        self.remote
            .dirs
            .lock()
            .unwrap()
            .get(&self.cwd)
            .cloned()
            .ok_or_else(|| EngineError::command_rejected("listing failed"))
    }

    async fn download_one_file(
        &mut self,
        name: &str,
        size_hint: Option<u64>,
        _mode: TransferMode,
        _source_path: &str,
        target_tmp_path: &str,
        resume_offset: u64,
        ctl: &mut TransferCtl,
    ) -> EngineResult<TransferOutcome> {
        let full = self.full(name);
        let size = size_hint
            .or_else(|| self.remote.files.lock().unwrap().get(&full).copied())
            .unwrap_or(0);
        let mut moved = resume_offset;
        while moved < size {
            let step = CHUNK.min(size - moved);
            if let Some(delay) = self.remote.chunk_delay {
                tokio::time::sleep(delay).await;
            }
            if ctl.advance(step).await == ChunkVerdict::Abort {
                return Err(EngineError::aborted("stop at chunk boundary"));
            }
            moved += step;
        }
        tokio::fs::write(target_tmp_path, vec![0u8; size as usize])
            .await
            .map_err(|e| EngineError::io_error(e.to_string()))?;
        Ok(TransferOutcome {
            created: resume_offset == 0,
            incomplete: false,
            actual_size: size,
        })
    }

    async fn upload_one_file(
        &mut self,
        local_path: &str,
        name: &str,
        _mode: TransferMode,
        _overwrite: bool,
        ctl: &mut TransferCtl,
    ) -> EngineResult<TransferOutcome> {
        let size = tokio::fs::metadata(local_path)
            .await
            .map_err(|e| EngineError::io_error(e.to_string()))?
            .len();
        let mut moved = 0;
        while moved < size {
            let step = CHUNK.min(size - moved);
            if ctl.advance(step).await == ChunkVerdict::Abort {
                return Err(EngineError::aborted("stop at chunk boundary"));
            }
            moved += step;
        }
        self.remote
            .files
            .lock()
            .unwrap()
            .insert(self.full(name), size);
        Ok(TransferOutcome {
            created: true,
            incomplete: false,
            actual_size: size,
        })
    }

    async fn create_dir(&mut self, name: &str) -> EngineResult<()> {
        let full = self.full(name);
        let mut dirs = self.remote.dirs.lock().unwrap();
        if dirs.contains_key(&full) {
            return Err(EngineError::already_exists(format!("550 {} exists", full)));
        }
        dirs.insert(full, Vec::new());
        Ok(())
    }

    async fn quick_rename(&mut self, _from: &str, _to: &str) -> EngineResult<()> {
        Ok(())
    }

    async fn delete_file(&mut self, name: &str) -> EngineResult<()> {
        if let Some(gate) = &self.remote.delete_gate {
            let permit = gate
                .acquire()
                .await
                .map_err(|_| EngineError::connection_lost("gate closed"))?;
            permit.forget();
        }
        if *self.remote.fail_auth.lock().unwrap() {
            return Err(EngineError::login_failed("530 not logged in"));
        }
        if *self.remote.drop_connection.lock().unwrap() {
            return Err(EngineError::connection_lost("control connection reset"));
        }
        let full = self.full(name);
        if self.remote.reject_delete.lock().unwrap().contains(&full) {
            return Err(EngineError::command_rejected(format!(
                "550 {}: operation not permitted",
                full
            )));
        }
        self.remote.deleted_files.lock().unwrap().push(full);
        Ok(())
    }

    async fn delete_dir(&mut self, name: &str) -> EngineResult<()> {
        let full = self.full(name);
        self.remote.deleted_dirs.lock().unwrap().push(full);
        Ok(())
    }

    async fn change_attrs(&mut self, name: &str, attr_mode: u32) -> EngineResult<()> {
        let full = self.full(name);
        self.remote.attr_calls.lock().unwrap().push((full, attr_mode));
        Ok(())
    }

    async fn resolve_link(&mut self, name: &str) -> EngineResult<LinkTarget> {
        let full = self.full(name);
        self.remote
            .links
            .lock()
            .unwrap()
            .get(&full)
            .copied()
            .ok_or_else(|| EngineError::command_rejected("cannot resolve link"))
    }

    fn certificate(&self) -> Option<&[u8]> {
        None
    }

    fn set_certificate(&mut self, cert: Vec<u8>) {
        self.remote.trusted_certs.lock().unwrap().push(cert);
    }

    fn login_error_detail(&self) -> Option<String> {
        if *self.remote.fail_auth.lock().unwrap() {
            Some("530 Login incorrect.".into())
        } else {
            None
        }
    }
}

// ─── Helpers ─────────────────────────────────────────────────────────

async fn wait_until(mut cond: impl FnMut() -> bool) {
    for _ in 0..500 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached within 5s");
}

// ─── Scenarios ───────────────────────────────────────────────────────

/// Delete run with one hidden file under policy=Skip: the hidden file
/// is skipped with its problem recorded, everything else completes.
#[tokio::test]
async fn test_delete_skips_hidden_file_by_policy() {
    let remote = Arc::new(
        MockRemote::default()
            .with_dir("/pub", vec![])
            .with_dir("/pub/b", vec![file("x.txt", 1), file("y.txt", 2)]),
    );
    let entries = vec![file("a.txt", 10), dir("b"), hidden_file("c.txt", 3)];
    let queue = build_delete_queue("/pub", &entries, SizeUnit::Bytes).unwrap();

    let config = OperationConfig {
        hidden_files: HiddenFilePolicy::Skip,
        ..OperationConfig::default()
    };
    let mut registry = OperationsRegistry::new();
    let op = registry.add_operation(OperationKind::Delete, config, queue);
    let id = op.id().to_string();

    let pool = registry.pool_mut(&id).unwrap();
    pool.add_worker(Some(MockConnection::token(&remote))).unwrap();
    pool.join_all().await;

    assert_eq!(op.get_item(1).unwrap().state, ItemState::Done); // a.txt
    assert_eq!(op.get_item(2).unwrap().state, ItemState::Done); // b explore
    let c = op.get_item(3).unwrap();
    assert_eq!(c.state, ItemState::Skipped);
    assert_eq!(c.problem, Some(Problem::FileIsHidden));

    let counts = op.counts();
    assert!(counts.skipped >= 1);
    assert!(counts.is_consistent());
    // b's children and b itself really went away
    let deleted = remote.deleted_files.lock().unwrap().clone();
    assert!(deleted.contains(&"/pub/a.txt".to_string()));
    assert!(deleted.contains(&"/pub/b/x.txt".to_string()));
    assert!(deleted.contains(&"/pub/b/y.txt".to_string()));
    assert!(remote
        .deleted_dirs
        .lock()
        .unwrap()
        .contains(&"/pub/b".to_string()));

    assert_eq!(
        op.get_operation_state(false, false),
        OperationState::FinishedWithSkips
    );
}

/// Copy with a pre-existing target under overwrite=Prompt: the item
/// escalates a name collision, the resolver skips, the run finishes
/// with skips.
#[tokio::test]
async fn test_copy_collision_prompt_then_skip() {
    let target_dir = tempfile::tempdir().unwrap();
    let taken = target_dir.path().join("out.txt");
    tokio::fs::write(&taken, b"old").await.unwrap();

    let remote = Arc::new(
        MockRemote::default()
            .with_dir("/pub", vec![])
            .with_file("/pub/out.txt", 2048),
    );
    let entries = vec![file("out.txt", 2048)];
    let config = OperationConfig {
        overwrite: OverwritePolicy::Prompt,
        ..OperationConfig::default()
    };
    let queue = build_download_queue(
        &config,
        "/pub",
        target_dir.path().to_str().unwrap(),
        &entries,
        false,
        SizeUnit::Bytes,
    )
    .unwrap();

    let mut registry = OperationsRegistry::new();
    let op = registry.add_operation(OperationKind::CopyDownload, config, queue);
    let id = op.id().to_string();
    registry
        .pool_mut(&id)
        .unwrap()
        .add_worker(Some(MockConnection::token(&remote)))
        .unwrap();

    let watcher = op.clone();
    wait_until(move || watcher.get_user_input_needed(true, None).count == 1).await;
    let item = op.get_item(1).unwrap();
    assert_eq!(item.state, ItemState::UserInputNeeded);
    assert_eq!(item.problem, Some(Problem::TargetFileExists));

    op.solve_error_on_item(1, Resolution::Skip).unwrap();
    registry.pool_mut(&id).unwrap().join_all().await;

    assert_eq!(op.get_item(1).unwrap().state, ItemState::Skipped);
    assert_eq!(
        op.get_operation_state(false, false),
        OperationState::FinishedWithSkips
    );
    // the original file was left alone
    assert_eq!(tokio::fs::read(&taken).await.unwrap(), b"old");
}

/// Pause mid-transfer freezes the byte counter and keeps the item
/// Processing; resume lets the same worker finish it.
#[tokio::test]
async fn test_pause_holds_transfer_resume_completes() {
    let target_dir = tempfile::tempdir().unwrap();
    let remote = Arc::new(MockRemote {
        chunk_delay: Some(Duration::from_millis(2)),
        ..MockRemote::default()
    }
    .with_dir("/pub", vec![])
    .with_file("/pub/big.bin", 64 * 1024));

    let entries = vec![file("big.bin", 64 * 1024)];
    let config = OperationConfig::default();
    let queue = build_download_queue(
        &config,
        "/pub",
        target_dir.path().to_str().unwrap(),
        &entries,
        false,
        SizeUnit::Bytes,
    )
    .unwrap();

    let mut registry = OperationsRegistry::new();
    let op = registry.add_operation(OperationKind::CopyDownload, config, queue);
    let id = op.id().to_string();
    registry
        .pool_mut(&id)
        .unwrap()
        .add_worker(Some(MockConnection::token(&remote)))
        .unwrap();

    let progress = op.progress();
    let p = progress.clone();
    wait_until(move || p.transferred() > 0).await;
    op.set_paused(true);

    // let the in-flight chunk reach its boundary, then the counter
    // must hold perfectly still
    tokio::time::sleep(Duration::from_millis(50)).await;
    let frozen = progress.transferred();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(progress.transferred(), frozen);
    assert!(frozen < 64 * 1024);
    assert_eq!(op.get_item(1).unwrap().state, ItemState::Processing);

    op.set_paused(false);
    registry.pool_mut(&id).unwrap().join_all().await;

    assert_eq!(op.get_item(1).unwrap().state, ItemState::Done);
    assert_eq!(progress.transferred(), 64 * 1024);
    let written = tokio::fs::metadata(target_dir.path().join("big.bin"))
        .await
        .unwrap();
    assert_eq!(written.len(), 64 * 1024);
}

/// Stop mid-run leaves untouched items Waiting and the queue
/// re-runnable; nothing is discarded or failed.
#[tokio::test]
async fn test_stop_leaves_remaining_items_waiting() {
    let gate = Arc::new(Semaphore::new(3));
    let remote = Arc::new(
        MockRemote {
            delete_gate: Some(Arc::clone(&gate)),
            ..MockRemote::default()
        }
        .with_dir("/pub", vec![]),
    );
    let entries: Vec<ListingEntry> = (0..10).map(|i| file(&format!("f{}.txt", i), 1)).collect();
    let queue = build_delete_queue("/pub", &entries, SizeUnit::Bytes).unwrap();

    let mut registry = OperationsRegistry::new();
    let op = registry.add_operation(OperationKind::Delete, OperationConfig::default(), queue);
    let id = op.id().to_string();
    registry
        .pool_mut(&id)
        .unwrap()
        .add_worker(Some(MockConnection::token(&remote)))
        .unwrap();

    let watcher = op.clone();
    wait_until(move || watcher.counts().done == 3).await;
    op.stop();
    gate.add_permits(100); // unblock the in-flight deletion
    registry.pool_mut(&id).unwrap().join_all().await;

    let counts = op.counts();
    assert_eq!(counts.done, 4); // 3 committed + the one in flight
    assert_eq!(counts.waiting, 6);
    assert_eq!(counts.failed, 0);
    assert_eq!(counts.skipped, 0);
    assert!(counts.is_consistent());
    assert_eq!(
        op.get_operation_state(false, false),
        OperationState::FinishedWithSkips
    );
    // still claimable by a future attach
    assert!(op.has_claimable_items());
}

// ─── Concurrency & structure ─────────────────────────────────────────

/// Three workers over one queue: every item executes exactly once.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_multiple_workers_claim_each_item_once() {
    let remote = Arc::new(MockRemote::default().with_dir("/pub", vec![]));
    let entries: Vec<ListingEntry> = (0..30).map(|i| file(&format!("f{}.txt", i), 1)).collect();
    let queue = build_delete_queue("/pub", &entries, SizeUnit::Bytes).unwrap();

    let config = OperationConfig {
        max_workers: 3,
        ..OperationConfig::default()
    };
    let mut registry = OperationsRegistry::new();
    let op = registry.add_operation(OperationKind::Delete, config, queue);
    let id = op.id().to_string();
    {
        let pool = registry.pool_mut(&id).unwrap();
        for _ in 0..3 {
            pool.add_worker(Some(MockConnection::token(&remote))).unwrap();
        }
        pool.join_all().await;
    }

    let deleted = remote.deleted_files.lock().unwrap().clone();
    assert_eq!(deleted.len(), 30);
    let unique: HashSet<&String> = deleted.iter().collect();
    assert_eq!(unique.len(), 30);
    assert_eq!(op.counts().done, 30);
    assert_eq!(
        op.get_operation_state(false, false),
        OperationState::SuccessfullyFinished
    );
}

/// Nested delete: files go before their directory, inner directories
/// before outer ones.
#[tokio::test]
async fn test_nested_delete_orders_children_before_parents() {
    let remote = Arc::new(
        MockRemote::default()
            .with_dir("/", vec![])
            .with_dir("/a", vec![dir("b")])
            .with_dir("/a/b", vec![file("leaf.txt", 1)]),
    );
    let queue = build_delete_queue("/", &[dir("a")], SizeUnit::Bytes).unwrap();

    let mut registry = OperationsRegistry::new();
    let op = registry.add_operation(OperationKind::Delete, OperationConfig::default(), queue);
    let id = op.id().to_string();
    let pool = registry.pool_mut(&id).unwrap();
    pool.add_worker(Some(MockConnection::token(&remote))).unwrap();
    pool.join_all().await;

    assert_eq!(
        remote.deleted_files.lock().unwrap().as_slice(),
        &["/a/b/leaf.txt".to_string()]
    );
    assert_eq!(
        remote.deleted_dirs.lock().unwrap().as_slice(),
        &["/a/b".to_string(), "/a".to_string()]
    );
    assert_eq!(
        op.get_operation_state(false, false),
        OperationState::SuccessfullyFinished
    );
}

/// Recursive change-attrs: children first, the directory itself last.
#[tokio::test]
async fn test_chattr_applies_to_children_then_directory() {
    let remote = Arc::new(
        MockRemote::default()
            .with_dir("/pub", vec![])
            .with_dir("/pub/d", vec![file("g.txt", 1)]),
    );
    let entries = vec![file("f.txt", 1), dir("d")];
    let queue = build_chattr_queue("/pub", &entries, 0o644, SizeUnit::Bytes).unwrap();

    let mut registry = OperationsRegistry::new();
    let op = registry.add_operation(OperationKind::ChangeAttrs, OperationConfig::default(), queue);
    let id = op.id().to_string();
    let pool = registry.pool_mut(&id).unwrap();
    pool.add_worker(Some(MockConnection::token(&remote))).unwrap();
    pool.join_all().await;

    let calls = remote.attr_calls.lock().unwrap().clone();
    assert!(calls.contains(&("/pub/f.txt".to_string(), 0o644)));
    let g = calls.iter().position(|c| c.0 == "/pub/d/g.txt").unwrap();
    let d = calls.iter().position(|c| c.0 == "/pub/d").unwrap();
    assert!(g < d, "directory attrs must change after its children");
    assert_eq!(
        op.get_operation_state(false, false),
        OperationState::SuccessfullyFinished
    );
}

/// Move (download) deletes the source file only after the transfer
/// lands.
#[tokio::test]
async fn test_move_download_deletes_source_after_transfer() {
    let target_dir = tempfile::tempdir().unwrap();
    let remote = Arc::new(
        MockRemote::default()
            .with_dir("/pub", vec![])
            .with_file("/pub/take.bin", 4096),
    );
    let entries = vec![file("take.bin", 4096)];
    let config = OperationConfig::default();
    let queue = build_download_queue(
        &config,
        "/pub",
        target_dir.path().to_str().unwrap(),
        &entries,
        true,
        SizeUnit::Bytes,
    )
    .unwrap();

    let mut registry = OperationsRegistry::new();
    let op = registry.add_operation(OperationKind::MoveDownload, config, queue);
    let id = op.id().to_string();
    let pool = registry.pool_mut(&id).unwrap();
    pool.add_worker(Some(MockConnection::token(&remote))).unwrap();
    pool.join_all().await;

    assert_eq!(op.get_item(1).unwrap().state, ItemState::Done);
    assert!(remote
        .deleted_files
        .lock()
        .unwrap()
        .contains(&"/pub/take.bin".to_string()));
    let written = tokio::fs::metadata(target_dir.path().join("take.bin"))
        .await
        .unwrap();
    assert_eq!(written.len(), 4096);
    assert_eq!(op.get_copy_progress().done_count, 1);
}

/// An unresolvable deletion failure parks the worker until the user
/// answers; Retry after the cause clears lets the run finish cleanly.
#[tokio::test]
async fn test_failed_delete_escalates_and_retry_recovers() {
    let remote = Arc::new(MockRemote::default().with_dir("/pub", vec![]));
    remote
        .reject_delete
        .lock()
        .unwrap()
        .insert("/pub/locked.txt".into());
    let queue =
        build_delete_queue("/pub", &[file("locked.txt", 1), file("free.txt", 1)], SizeUnit::Bytes)
            .unwrap();

    let mut registry = OperationsRegistry::new();
    let op = registry.add_operation(OperationKind::Delete, OperationConfig::default(), queue);
    let id = op.id().to_string();
    registry
        .pool_mut(&id)
        .unwrap()
        .add_worker(Some(MockConnection::token(&remote)))
        .unwrap();

    let watcher = op.clone();
    wait_until(move || watcher.get_user_input_needed(true, None).count == 1).await;
    let item = op.get_item(1).unwrap();
    assert_eq!(item.problem, Some(Problem::UnableToDeleteFile));
    assert!(item.problem_detail.as_deref().unwrap_or("").contains("550"));

    // the cause goes away, the user answers Retry
    remote.reject_delete.lock().unwrap().clear();
    op.solve_error_on_item(1, Resolution::Retry).unwrap();
    registry.pool_mut(&id).unwrap().join_all().await;

    assert_eq!(op.counts().done, 2);
    assert_eq!(
        op.get_operation_state(false, false),
        OperationState::SuccessfullyFinished
    );
}

/// A login rejection kills the worker but parks the claimed item on
/// user input with the server's detail, instead of re-queueing it for
/// an identical failure on the next connection.
#[tokio::test]
async fn test_login_failure_parks_item_and_stops_worker() {
    let remote = Arc::new(MockRemote::default().with_dir("/pub", vec![]));
    *remote.fail_auth.lock().unwrap() = true;
    let queue = build_delete_queue("/pub", &[file("a.txt", 1)], SizeUnit::Bytes).unwrap();

    let mut registry = OperationsRegistry::new();
    let op = registry.add_operation(OperationKind::Delete, OperationConfig::default(), queue);
    let id = op.id().to_string();
    let pool = registry.pool_mut(&id).unwrap();
    pool.add_worker(Some(MockConnection::token(&remote))).unwrap();
    pool.join_all().await;

    let item = op.get_item(1).unwrap();
    assert_eq!(item.state, ItemState::UserInputNeeded);
    assert_eq!(item.problem, Some(Problem::LoginFailed));
    assert!(item
        .problem_detail
        .as_deref()
        .unwrap_or("")
        .contains("530 Login incorrect."));
    let pool = registry.pool(&id).unwrap();
    assert!(pool.have_error());
    assert!(pool.empty_or_all_stopped());

    // credentials fixed: Retry re-queues the item, a fresh worker finishes
    *remote.fail_auth.lock().unwrap() = false;
    op.solve_error_on_item(1, Resolution::Retry).unwrap();
    let pool = registry.pool_mut(&id).unwrap();
    pool.add_worker(Some(MockConnection::token(&remote))).unwrap();
    pool.join_all().await;
    assert_eq!(op.get_item(1).unwrap().state, ItemState::Done);
}

/// Pausing holds a non-transfer worker at the item boundary: nothing
/// is claimed or executed until resume.
#[tokio::test]
async fn test_pause_holds_delete_worker_at_item_boundary() {
    let entries: Vec<ListingEntry> = (0..14).map(|i| file(&format!("f{}.dat", i), 1)).collect();
    let remote = Arc::new(MockRemote::default().with_dir("/pub", vec![]));
    let queue = build_delete_queue("/pub", &entries, SizeUnit::Bytes).unwrap();

    let mut registry = OperationsRegistry::new();
    let op = registry.add_operation(OperationKind::Delete, OperationConfig::default(), queue);
    op.set_paused(true);
    let id = op.id().to_string();
    registry
        .pool_mut(&id)
        .unwrap()
        .add_worker(Some(MockConnection::token(&remote)))
        .unwrap();

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(op.counts().done, 0);
    assert!(remote.deleted_files.lock().unwrap().is_empty());

    op.set_paused(false);
    registry.pool_mut(&id).unwrap().join_all().await;
    assert_eq!(op.counts().done, 14);
    assert_eq!(remote.deleted_files.lock().unwrap().len(), 14);
}

/// A dropped connection fails the in-flight item with the action's
/// problem; the lone-worker run ends with errors, not silent skips.
#[tokio::test]
async fn test_connection_loss_fails_inflight_item() {
    let remote = Arc::new(MockRemote::default().with_dir("/pub", vec![]));
    *remote.drop_connection.lock().unwrap() = true;
    let queue = build_delete_queue("/pub", &[file("only.txt", 1)], SizeUnit::Bytes).unwrap();

    let mut registry = OperationsRegistry::new();
    let op = registry.add_operation(OperationKind::Delete, OperationConfig::default(), queue);
    let id = op.id().to_string();
    let pool = registry.pool_mut(&id).unwrap();
    pool.add_worker(Some(MockConnection::token(&remote))).unwrap();
    pool.join_all().await;

    let item = op.get_item(1).unwrap();
    assert_eq!(item.state, ItemState::Failed);
    assert_eq!(item.problem, Some(Problem::UnableToDeleteFile));
    assert!(item
        .problem_detail
        .as_deref()
        .unwrap_or("")
        .contains("connection reset"));
    assert!(registry.pool(&id).unwrap().have_error());
    assert_eq!(
        op.get_operation_state(false, false),
        OperationState::FinishedWithErrors
    );
}

/// A skip-all answer to the forced-ASCII warning covers files an
/// explore discovers later; mask-matching files still transfer.
#[tokio::test]
async fn test_skip_all_ascii_warning_covers_explored_files() {
    let target_dir = tempfile::tempdir().unwrap();
    let remote = Arc::new(
        MockRemote::default()
            .with_dir("/pub", vec![])
            .with_dir("/pub/data", vec![file("child.bin", 512), file("notes.txt", 256)])
            .with_file("/pub/data/notes.txt", 256)
            .with_file("/pub/prog.exe", 512),
    );
    let config = OperationConfig {
        transfer_mode_policy: TransferModePolicy::ForceAscii,
        ..OperationConfig::default()
    };
    let queue = build_download_queue(
        &config,
        "/pub",
        target_dir.path().to_str().unwrap(),
        &[file("prog.exe", 512), dir("data")],
        false,
        SizeUnit::Bytes,
    )
    .unwrap();

    let mut registry = OperationsRegistry::new();
    let op = registry.add_operation(OperationKind::CopyDownload, config, queue);
    // prog.exe starts blocked on the warning; answer skip-all up front
    assert_eq!(op.get_item(1).unwrap().state, ItemState::UserInputNeeded);
    op.solve_error_on_item(1, Resolution::SkipAll).unwrap();

    let id = op.id().to_string();
    let pool = registry.pool_mut(&id).unwrap();
    pool.add_worker(Some(MockConnection::token(&remote))).unwrap();
    pool.join_all().await;

    // the discovered binary went with the skip-all answer
    let watcher = op.clone();
    let child_uid = (1..=op.queue_len() as u64)
        .find(|&uid| watcher.get_item(uid).is_some_and(|i| i.name == "child.bin"))
        .expect("explored child present");
    let child = op.get_item(child_uid).unwrap();
    assert_eq!(child.state, ItemState::Skipped);
    assert_eq!(child.problem, Some(Problem::AsciiModeForBinary));
    // the mask-matching file still came down
    assert!(tokio::fs::metadata(target_dir.path().join("data").join("notes.txt"))
        .await
        .is_ok());
    assert!(tokio::fs::metadata(target_dir.path().join("prog.exe"))
        .await
        .is_err());
}

/// The trusted certificate reaches the connection only on encrypted
/// operations.
#[tokio::test]
async fn test_certificate_applied_only_when_encrypted() {
    for (encrypt, expected) in [(true, 1usize), (false, 0usize)] {
        let remote = Arc::new(MockRemote::default().with_dir("/pub", vec![]));
        let queue = build_delete_queue("/pub", &[file("a.txt", 1)], SizeUnit::Bytes).unwrap();
        let config = OperationConfig {
            encrypt,
            certificate: Some(vec![0xde, 0xad]),
            ..OperationConfig::default()
        };
        let mut registry = OperationsRegistry::new();
        let op = registry.add_operation(OperationKind::Delete, config, queue);
        let id = op.id().to_string();
        let pool = registry.pool_mut(&id).unwrap();
        pool.add_worker(Some(MockConnection::token(&remote))).unwrap();
        pool.join_all().await;
        assert_eq!(remote.trusted_certs.lock().unwrap().len(), expected);
    }
}

/// Progress totals grow as explores discover sizes, and the simple
/// progress snapshot tracks completion.
#[tokio::test]
async fn test_explore_grows_copy_totals() {
    let target_dir = tempfile::tempdir().unwrap();
    let remote = Arc::new(
        MockRemote::default()
            .with_dir("/pub", vec![])
            .with_dir("/pub/data", vec![file("one.bin", 1000), file("two.bin", 500)]),
    );
    let config = OperationConfig::default();
    let queue = build_download_queue(
        &config,
        "/pub",
        target_dir.path().to_str().unwrap(),
        &[dir("data")],
        false,
        SizeUnit::Bytes,
    )
    .unwrap();

    let mut registry = OperationsRegistry::new();
    let op = registry.add_operation(OperationKind::CopyDownload, config, queue);
    assert_eq!(op.get_copy_progress().total, 0);
    let id = op.id().to_string();
    let pool = registry.pool_mut(&id).unwrap();
    pool.add_worker(Some(MockConnection::token(&remote))).unwrap();
    pool.join_all().await;

    let copy = op.get_copy_progress();
    assert_eq!(copy.total, 1500);
    assert_eq!(copy.transferred, 1500);
    assert_eq!(copy.done_count, 2);
    assert_eq!(copy.error_count, 0);
    let simple = op.get_simple_progress();
    assert_eq!(simple.done_or_skipped, simple.total);
}
