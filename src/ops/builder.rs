//! Queue builders: turn a panel selection (pre-parsed listing entries
//! for remote sources, a local directory for uploads) into the initial
//! item set of an operation.
//!
//! Builders are all-or-nothing: any failure leaves no queue behind.

use std::path::Path;

use glob::{MatchOptions, Pattern};
use log::debug;

use crate::ops::connection::{EntryKind, ListingEntry};
use crate::ops::error::{EngineError, EngineResult};
use crate::ops::item::{ItemKind, ItemPayload, Problem, QueueItem};
use crate::ops::queue::OpQueue;
use crate::ops::types::{OperationConfig, SizeUnit, TransferMode, TransferModePolicy};

/// Whether `name` matches the operation's ASCII file masks.
pub fn matches_ascii_masks(config: &OperationConfig, name: &str) -> bool {
    let options = MatchOptions {
        case_sensitive: false,
        ..Default::default()
    };
    config.ascii_file_masks.iter().any(|mask| {
        Pattern::new(mask)
            .map(|p| p.matches_with(name, options))
            .unwrap_or(false)
    })
}

/// Transfer mode for one file name under the operation's policy.
pub fn transfer_mode_for(config: &OperationConfig, name: &str) -> TransferMode {
    match config.transfer_mode_policy {
        TransferModePolicy::ForceAscii => TransferMode::Ascii,
        TransferModePolicy::ForceBinary => TransferMode::Binary,
        TransferModePolicy::ByMasks => {
            if matches_ascii_masks(config, name) {
                TransferMode::Ascii
            } else {
                TransferMode::Binary
            }
        }
    }
}

/// A forced-ASCII transfer of a name outside the ASCII masks likely
/// corrupts a binary file; such items are blocked on confirmation (at
/// build time for the initial selection, at process time for files
/// discovered by explores).
pub fn ascii_looks_wrong(config: &OperationConfig, name: &str) -> bool {
    config.transfer_mode_policy == TransferModePolicy::ForceAscii
        && !matches_ascii_masks(config, name)
}

/// Items for deleting `entries` under `source_path`.
pub fn build_delete_queue(
    source_path: &str,
    entries: &[ListingEntry],
    unit: SizeUnit,
) -> EngineResult<OpQueue> {
    let mut queue = OpQueue::new(unit);
    for entry in entries {
        let kind = match entry.kind {
            EntryKind::File => ItemKind::DeleteFile,
            EntryKind::Link => ItemKind::DeleteLink,
            EntryKind::Directory => ItemKind::DeleteDirExplore,
        };
        queue.add_item(
            QueueItem::new(kind, source_path, &entry.name)
                .with_size(entry.size)
                .hidden(entry.is_hidden)
                .link(entry.kind == EntryKind::Link),
        )?;
    }
    debug!("delete queue built: {} items", queue.len());
    Ok(queue)
}

/// Items for downloading (copy or move) `entries` from `source_path`
/// into the local `target_path`.
pub fn build_download_queue(
    config: &OperationConfig,
    source_path: &str,
    target_path: &str,
    entries: &[ListingEntry],
    moving: bool,
    unit: SizeUnit,
) -> EngineResult<OpQueue> {
    let mut queue = OpQueue::new(unit);
    for entry in entries {
        let item = match entry.kind {
            EntryKind::File => {
                let item = QueueItem::new(
                    if moving { ItemKind::MoveFile } else { ItemKind::CopyFile },
                    source_path,
                    &entry.name,
                )
                .with_size(entry.size)
                .with_payload(ItemPayload::Transfer {
                    modified: entry.modified,
                    mode: transfer_mode_for(config, &entry.name),
                    resume_offset: 0,
                });
                if ascii_looks_wrong(config, &entry.name) {
                    item.needing_input(Problem::AsciiModeForBinary)
                } else {
                    item
                }
            }
            EntryKind::Link => QueueItem::new(
                if moving {
                    ItemKind::MoveResolveLink
                } else {
                    ItemKind::CopyResolveLink
                },
                source_path,
                &entry.name,
            )
            .link(true),
            EntryKind::Directory => QueueItem::new(
                if moving {
                    ItemKind::MoveDirExplore
                } else {
                    ItemKind::CopyDirExplore
                },
                source_path,
                &entry.name,
            ),
        };
        queue.add_item(
            item.with_target(target_path, &entry.name)
                .hidden(entry.is_hidden),
        )?;
    }
    debug!("download queue built: {} items", queue.len());
    Ok(queue)
}

/// Items for applying `attr_mode` to `entries` (recursively for
/// directories) under `source_path`.
pub fn build_chattr_queue(
    source_path: &str,
    entries: &[ListingEntry],
    attr_mode: u32,
    unit: SizeUnit,
) -> EngineResult<OpQueue> {
    let mut queue = OpQueue::new(unit);
    for entry in entries {
        let kind = match entry.kind {
            EntryKind::File => ItemKind::ChAttrFile,
            EntryKind::Link => ItemKind::ChAttrResolveLink,
            EntryKind::Directory => ItemKind::ChAttrDirExplore,
        };
        queue.add_item(
            QueueItem::new(kind, source_path, &entry.name)
                .hidden(entry.is_hidden)
                .link(entry.kind == EntryKind::Link)
                .with_payload(ItemPayload::Attrs {
                    attr_mode,
                    unknown_bits: entry.unknown_attr_bits,
                }),
        )?;
    }
    debug!("change-attrs queue built: {} items", queue.len());
    Ok(queue)
}

/// Items for uploading (copy or move) `selection` out of the local
/// `local_dir` into the remote `target_path`. Stats each entry, so the
/// queue carries exact sizes from the start.
pub async fn build_upload_queue(
    config: &OperationConfig,
    local_dir: &str,
    selection: &[String],
    target_path: &str,
    moving: bool,
) -> EngineResult<OpQueue> {
    let mut queue = OpQueue::new(SizeUnit::Bytes);
    for name in selection {
        let path = Path::new(local_dir).join(name);
        let meta = tokio::fs::metadata(&path).await.map_err(|e| {
            EngineError::io_error(format!("stat of {:?} failed: {}", path, e))
        })?;
        let item = if meta.is_dir() {
            QueueItem::new(
                if moving {
                    ItemKind::UploadMoveDirExplore
                } else {
                    ItemKind::UploadCopyDirExplore
                },
                local_dir,
                name,
            )
        } else {
            let item = QueueItem::new(
                if moving {
                    ItemKind::UploadMoveFile
                } else {
                    ItemKind::UploadCopyFile
                },
                local_dir,
                name,
            )
            .with_size(Some(meta.len()))
            .with_payload(ItemPayload::Transfer {
                modified: meta.modified().ok().map(|t| t.into()),
                mode: transfer_mode_for(config, name),
                resume_offset: 0,
            });
            if ascii_looks_wrong(config, name) {
                item.needing_input(Problem::AsciiModeForBinary)
            } else {
                item
            }
        };
        queue.add_item(item.with_target(target_path, name))?;
    }
    debug!("upload queue built: {} items", queue.len());
    Ok(queue)
}
