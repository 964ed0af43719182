//! Upload coordinator: tracks per-entry upload channels, decides when an
//! entry's upload batch is complete, and drains finished files into storage.
//!
//! Draining is deliberately not idempotent: files are persisted exactly
//! once, and a second drain of the same channel returns an empty outcome.

use crate::model::{BatchEntry, EntryId, MAX_PHOTOS_PER_ENTRY};
use crate::storage::{SavedFile, Storage};
use anyhow::Result;
use std::collections::HashMap;
use tracing::{info, warn};

/// Largest accepted upload, 10 MiB. Packaging photos are far smaller.
pub const MAX_UPLOAD_BYTES: u64 = 10 * 1024 * 1024;

const ALLOWED_EXTENSIONS: [&str; 5] = ["jpg", "jpeg", "png", "gif", "webp"];

/// One file moving through a channel. `bytes` is populated once the client
/// reports the upload done.
#[derive(Debug, Clone)]
pub struct FileUpload {
    pub upload_id: String,
    pub name: String,
    pub byte_size: u64,
    pub done: bool,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Default)]
struct UploadChannel {
    files: HashMap<String, FileUpload>,
    signal_emitted: bool,
}

impl UploadChannel {
    fn all_done(&self) -> bool {
        !self.files.is_empty() && self.files.values().all(|f| f.done)
    }

    fn has_in_flight(&self) -> bool {
        self.files.values().any(|f| !f.done)
    }
}

/// Result of draining one channel: files that made it into storage plus
/// per-file errors for the ones that did not. The caller decides whether to
/// keep the partial subset or roll it back.
#[derive(Debug, Default)]
pub struct DrainOutcome {
    pub saved: Vec<SavedFile>,
    pub failed: Vec<(String, String)>,
}

/// Reject bad uploads before they touch any entry state.
pub fn validate_upload(name: &str, byte_size: u64) -> Result<(), String> {
    let ext = std::path::Path::new(name)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());
    match ext {
        Some(ext) if ALLOWED_EXTENSIONS.contains(&ext.as_str()) => {}
        _ => return Err(format!("unsupported file type: {}", name)),
    }
    if byte_size == 0 {
        return Err(format!("empty upload: {}", name));
    }
    if byte_size > MAX_UPLOAD_BYTES {
        return Err(format!(
            "file too large: {} ({} bytes, limit {})",
            name, byte_size, MAX_UPLOAD_BYTES
        ));
    }
    Ok(())
}

#[derive(Debug, Default)]
pub struct UploadCoordinator {
    channels: HashMap<EntryId, UploadChannel>,
}

impl UploadCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// (Re)establish one channel per entry. Idempotent: existing channels
    /// are kept as-is. Channels for removed entries are dropped only when
    /// fully drained; a channel still holding uploads is never discarded.
    pub fn configure_slots(&mut self, entries: &[BatchEntry]) {
        for entry in entries {
            self.channels.entry(entry.id.clone()).or_default();
        }
        self.channels.retain(|id, channel| {
            let live = entries.iter().any(|e| &e.id == id);
            if !live && !channel.files.is_empty() {
                warn!(entry_id = %id, "keeping orphaned upload channel with undrained files");
                return true;
            }
            live
        });
    }

    /// Record one progress tick. Returns `true` exactly once per completed
    /// batch: when this file is done and every sibling in the channel is
    /// done too.
    pub fn on_progress(&mut self, channel_id: &EntryId, upload: FileUpload) -> bool {
        let Some(channel) = self.channels.get_mut(channel_id) else {
            // Progress for an unconfigured channel is a race, not an error.
            return false;
        };
        if channel.files.len() >= MAX_PHOTOS_PER_ENTRY
            && !channel.files.contains_key(&upload.upload_id)
        {
            warn!(entry_id = %channel_id, "ignoring upload beyond per-entry photo limit");
            return false;
        }
        if !upload.done {
            // A new in-flight file opens a fresh batch.
            channel.signal_emitted = false;
        }
        channel.files.insert(upload.upload_id.clone(), upload);

        if channel.all_done() && !channel.signal_emitted {
            channel.signal_emitted = true;
            info!(entry_id = %channel_id, "upload batch complete");
            return true;
        }
        false
    }

    /// Drain completed uploads for one channel, persisting each through the
    /// storage adapter. Files are removed from the channel before the write,
    /// so a second call yields an empty outcome. In-flight files stay put.
    pub async fn consume_completed(
        &mut self,
        channel_id: &EntryId,
        storage: &dyn Storage,
    ) -> DrainOutcome {
        let mut outcome = DrainOutcome::default();
        let Some(channel) = self.channels.get_mut(channel_id) else {
            return outcome;
        };
        let done_ids: Vec<String> = channel
            .files
            .iter()
            .filter(|(_, f)| f.done)
            .map(|(id, _)| id.clone())
            .collect();
        let drained: Vec<FileUpload> = done_ids
            .iter()
            .filter_map(|id| channel.files.remove(id))
            .collect();
        // The drained batch is consumed; the next completion is a new batch.
        channel.signal_emitted = false;

        for file in drained {
            match storage.save(&file.bytes, &file.name).await {
                Ok(saved) => outcome.saved.push(saved),
                Err(err) => {
                    warn!(?err, name = %file.name, "failed to persist upload");
                    outcome.failed.push((file.name, err.to_string()));
                }
            }
        }
        outcome
    }

    /// Whether a channel still has uploads the client has not finished.
    pub fn has_in_flight(&self, channel_id: &EntryId) -> bool {
        self.channels
            .get(channel_id)
            .map(|c| c.has_in_flight())
            .unwrap_or(false)
    }
}
