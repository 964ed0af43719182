//! Analysis coordinator: one actor per batch session. The actor exclusively
//! owns the entry collection and the live countdown timers; every mutation
//! arrives through its mailbox, so per-entry transitions are totally ordered
//! while different sessions proceed in parallel.
//!
//! Debounce flow: a completed upload batch attaches photos and (re)starts a
//! cancellable countdown. Ticks arrive as self-addressed messages tagged
//! with a timer generation; stale generations are ignored, which makes
//! cancellation idempotent and duplicate triggers impossible.

use crate::db::{self, Pool};
use crate::entries;
use crate::model::{
    AnalysisEvent, AnalysisStatus, ApprovalStatus, BatchEntry, EntryId, PhotoRef,
    DEBOUNCE_SECONDS, MAX_PHOTOS_PER_ENTRY,
};
use crate::storage::Storage;
use crate::uploads::{validate_upload, FileUpload, UploadCoordinator};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Seam between the coordinator and the actual analysis machinery: either a
/// durable job enqueue (consumed by the worker) or a direct in-process call.
#[async_trait]
pub trait AnalysisDispatcher: Send + Sync {
    async fn dispatch(&self, entry_id: &EntryId, photos: &[PhotoRef]) -> Result<()>;
}

/// Outcome of a batch-wide "analyze all" request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnalyzeAllOutcome {
    /// No entry had at least one photo and Pending status.
    NothingToAnalyze,
    /// This many entries were dispatched, each independently.
    Dispatched(usize),
}

#[derive(Debug)]
enum Command {
    AddEntries {
        count: usize,
    },
    RemoveEntry {
        id: EntryId,
    },
    UploadProgress {
        id: EntryId,
        upload: FileUpload,
    },
    RemovePhoto {
        id: EntryId,
        index: usize,
    },
    CancelCountdown {
        id: EntryId,
    },
    Tick {
        id: EntryId,
        generation: u64,
    },
    AnalyzeNow {
        id: EntryId,
    },
    AnalyzeAll {
        reply: oneshot::Sender<AnalyzeAllOutcome>,
    },
    Retry {
        id: EntryId,
    },
    SetApproval {
        id: EntryId,
        status: ApprovalStatus,
    },
    EditResult {
        id: EntryId,
        result: crate::model::AttributeMap,
    },
    Save {
        id: EntryId,
        reply: oneshot::Sender<Result<i64>>,
    },
    Snapshot {
        reply: oneshot::Sender<Vec<BatchEntry>>,
    },
}

/// Collaborators handed to a session at spawn time.
pub struct SessionDeps {
    /// Durable entry store; `None` keeps the session purely in-memory.
    pub store: Option<Pool>,
    pub storage: Arc<dyn Storage>,
    pub dispatcher: Arc<dyn AnalysisDispatcher>,
    /// Analysis completion topic. The session holds the sender so the
    /// channel stays open for its whole lifetime.
    pub events: broadcast::Sender<AnalysisEvent>,
}

/// Tuning knobs, separate from deps so tests can shrink the clock.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub debounce_seconds: u32,
    pub tick_interval: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            debounce_seconds: DEBOUNCE_SECONDS,
            tick_interval: Duration::from_secs(1),
        }
    }
}

/// Cloneable handle to a running session actor.
#[derive(Clone)]
pub struct SessionHandle {
    tx: mpsc::Sender<Command>,
}

impl SessionHandle {
    pub async fn add_entries(&self, count: usize) -> Result<()> {
        self.send(Command::AddEntries { count }).await
    }

    pub async fn remove_entry(&self, id: EntryId) -> Result<()> {
        self.send(Command::RemoveEntry { id }).await
    }

    /// Forward one upload progress tick. Invalid files are rejected here,
    /// before any entry state is touched.
    pub async fn upload_progress(&self, id: EntryId, upload: FileUpload) -> Result<()> {
        validate_upload(&upload.name, upload.byte_size.max(upload.bytes.len() as u64))
            .map_err(|msg| anyhow!(msg))?;
        self.send(Command::UploadProgress { id, upload }).await
    }

    pub async fn remove_photo(&self, id: EntryId, index: usize) -> Result<()> {
        self.send(Command::RemovePhoto { id, index }).await
    }

    pub async fn cancel_countdown(&self, id: EntryId) -> Result<()> {
        self.send(Command::CancelCountdown { id }).await
    }

    pub async fn analyze_now(&self, id: EntryId) -> Result<()> {
        self.send(Command::AnalyzeNow { id }).await
    }

    pub async fn analyze_all(&self) -> Result<AnalyzeAllOutcome> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::AnalyzeAll { reply }).await?;
        rx.await.context("session actor dropped analyze-all reply")
    }

    pub async fn retry(&self, id: EntryId) -> Result<()> {
        self.send(Command::Retry { id }).await
    }

    pub async fn approve(&self, id: EntryId) -> Result<()> {
        self.send(Command::SetApproval {
            id,
            status: ApprovalStatus::Approved,
        })
        .await
    }

    pub async fn reject(&self, id: EntryId) -> Result<()> {
        self.send(Command::SetApproval {
            id,
            status: ApprovalStatus::Rejected,
        })
        .await
    }

    /// Overwrite an entry's result with user edits (only sensible on a
    /// Complete entry; anything else is a no-op).
    pub async fn edit_result(&self, id: EntryId, result: crate::model::AttributeMap) -> Result<()> {
        self.send(Command::EditResult { id, result }).await
    }

    /// Promote an approved entry into a permanent record and drop it from
    /// the batch. Returns the new medicine row id.
    pub async fn save(&self, id: EntryId) -> Result<i64> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Save { id, reply }).await?;
        rx.await.context("session actor dropped save reply")?
    }

    pub async fn snapshot(&self) -> Result<Vec<BatchEntry>> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Snapshot { reply }).await?;
        rx.await.context("session actor dropped snapshot reply")
    }

    async fn send(&self, cmd: Command) -> Result<()> {
        self.tx
            .send(cmd)
            .await
            .map_err(|_| anyhow!("session actor is gone"))
    }
}

struct TimerSlot {
    generation: u64,
    handle: JoinHandle<()>,
}

struct BatchSession {
    entries: Vec<BatchEntry>,
    timers: HashMap<EntryId, TimerSlot>,
    next_generation: u64,
    uploads: UploadCoordinator,
    deps: SessionDeps,
    config: SessionConfig,
    self_tx: mpsc::Sender<Command>,
}

/// Spawn a session actor with `initial` empty entry slots and return its
/// handle.
pub fn spawn_session(initial: usize, deps: SessionDeps, config: SessionConfig) -> SessionHandle {
    let (tx, rx) = mpsc::channel(64);
    let events_rx = deps.events.subscribe();
    let mut session = BatchSession {
        entries: entries::create_empty_entries(initial, 0),
        timers: HashMap::new(),
        next_generation: 0,
        uploads: UploadCoordinator::new(),
        deps,
        config,
        self_tx: tx.clone(),
    };
    session.uploads.configure_slots(&session.entries);
    tokio::spawn(session.run(rx, events_rx));
    SessionHandle { tx }
}

impl BatchSession {
    async fn run(
        mut self,
        mut rx: mpsc::Receiver<Command>,
        mut events: broadcast::Receiver<AnalysisEvent>,
    ) {
        loop {
            tokio::select! {
                cmd = rx.recv() => {
                    let Some(cmd) = cmd else { break };
                    self.handle_command(cmd).await;
                }
                evt = events.recv() => {
                    match evt {
                        Ok(evt) => self.apply_event(evt).await,
                        Err(broadcast::error::RecvError::Lagged(missed)) => {
                            warn!(missed, "analysis event stream lagged");
                        }
                        // Cannot close: we hold a sender in deps.
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
        }
        // All timers die with the session.
        for (_, slot) in self.timers.drain() {
            slot.handle.abort();
        }
    }

    async fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::AddEntries { count } => {
                let start = self
                    .entries
                    .iter()
                    .map(|e| e.sequence_number)
                    .max()
                    .unwrap_or(0);
                self.entries
                    .extend(entries::create_empty_entries(count, start));
                self.uploads.configure_slots(&self.entries);
            }
            Command::RemoveEntry { id } => self.remove_entry(&id).await,
            Command::UploadProgress { id, upload } => self.upload_progress(&id, upload).await,
            Command::RemovePhoto { id, index } => {
                self.clear_timer(&id);
                self.entries = entries::remove_photo_at_index(std::mem::take(&mut self.entries), &id, index);
                self.mirror_analysis(&id).await;
            }
            Command::CancelCountdown { id } => {
                self.clear_timer(&id);
                if let Some(entry) = self.entry_mut(&id) {
                    entry.countdown_seconds_remaining = 0;
                    entry.timer_generation = 0;
                }
            }
            Command::Tick { id, generation } => self.apply_tick(&id, generation).await,
            Command::AnalyzeNow { id } => {
                let Some(entry) = self.entry_mut(&id) else { return };
                // Only idle entries may be forced; a second click while the
                // call is in flight must not double-dispatch.
                if !matches!(
                    entry.analysis_status,
                    AnalysisStatus::Pending | AnalysisStatus::Failed
                ) {
                    return;
                }
                entry.countdown_seconds_remaining = 0;
                entry.timer_generation = 0;
                self.clear_timer(&id);
                self.dispatch_entry(&id).await;
            }
            Command::AnalyzeAll { reply } => {
                let outcome = self.analyze_all().await;
                let _ = reply.send(outcome);
            }
            Command::Retry { id } => {
                eprintln!("DEBUG retry cmd id={id}");
                let Some(entry) = self.entry_mut(&id) else { return };
                // Retry only applies to Failed entries; everything else is a
                // safe no-op.
                if entry.analysis_status != AnalysisStatus::Failed {
                    return;
                }
                entry.analysis_status = AnalysisStatus::Pending;
                self.mirror_analysis(&id).await;
                self.start_countdown(&id);
            }
            Command::SetApproval { id, status } => {
                self.entries =
                    entries::update_approval_status(std::mem::take(&mut self.entries), &id, status);
                self.mirror_approval(&id).await;
            }
            Command::EditResult { id, result } => {
                let Some(entry) = self.entry_mut(&id) else { return };
                if entry.analysis_status != AnalysisStatus::Complete || result.is_empty() {
                    return;
                }
                entry.analysis_result = Some(result);
                self.mirror_analysis(&id).await;
            }
            Command::Save { id, reply } => {
                let outcome = self.save_entry(&id).await;
                let _ = reply.send(outcome);
            }
            Command::Snapshot { reply } => {
                let _ = reply.send(self.entries.clone());
            }
        }
    }

    async fn remove_entry(&mut self, id: &EntryId) {
        self.clear_timer(id);
        let Some(entry) = self.entries.iter().find(|e| &e.id == id).cloned() else {
            return;
        };
        self.entries = entries::remove_by_id(std::mem::take(&mut self.entries), id);
        self.uploads.configure_slots(&self.entries);

        // Batch-scoped cleanup: durable row plus stored photo bytes.
        if let (Some(pool), Some(durable)) = (self.deps.store.as_ref(), entry.id.as_durable()) {
            if let Err(err) = db::delete_entry(pool, durable).await {
                warn!(?err, entry_id = %id, "failed to delete entry row");
            }
        }
        for photo in &entry.photos {
            if let Err(err) = self.deps.storage.delete(&photo.storage_key).await {
                warn!(?err, key = %photo.storage_key, "failed to delete photo");
            }
        }
    }

    async fn upload_progress(&mut self, id: &EntryId, upload: FileUpload) {
        if !self.uploads.on_progress(id, upload) {
            return;
        }
        // Whole upload batch done: drain, persist, attach, debounce.
        let outcome = self
            .uploads
            .consume_completed(id, self.deps.storage.as_ref())
            .await;
        for (name, message) in outcome.failed {
            self.entries = entries::push_validation_error(
                std::mem::take(&mut self.entries),
                id,
                format!("upload failed for {}: {}", name, message),
            );
        }
        if outcome.saved.is_empty() {
            return;
        }

        let id = self.promote_to_durable(id).await;
        let Some(entry) = self.entries.iter_mut().find(|e| e.id == id) else {
            return;
        };
        let idle = entry.analysis_status == AnalysisStatus::Pending;
        for saved in outcome.saved {
            if entry.photos.len() >= MAX_PHOTOS_PER_ENTRY {
                entry
                    .validation_errors
                    .push(format!("photo limit reached; ignoring {}", saved.original_name));
                continue;
            }
            let photo = PhotoRef {
                storage_key: saved.storage_key,
                display_url: saved.display_url,
                original_name: saved.original_name,
                byte_size: saved.byte_size,
            };
            let position = entry.photos.len() as i64 + 1;
            entry.photos.push(photo.clone());
            if let (Some(pool), Some(durable)) = (self.deps.store.as_ref(), id.as_durable()) {
                if let Err(err) = db::add_photo(pool, durable, &photo, position).await {
                    warn!(?err, entry_id = %id, "failed to persist photo row");
                }
            }
        }
        // The debounce only (re)arms while the entry is idle; Processing,
        // Complete, and Failed entries wait for an explicit user action.
        if idle {
            self.start_countdown(&id);
        }
    }

    /// Promote one approved entry into the permanent inventory, then drop it
    /// from the batch. Promotion already removed the durable row and the
    /// batch-scoped photos, so only in-memory state is left to clean up.
    async fn save_entry(&mut self, id: &EntryId) -> Result<i64> {
        let Some(pool) = self.deps.store.clone() else {
            return Err(anyhow!("session has no durable store; cannot save"));
        };
        let Some(entry) = self.entries.iter().find(|e| &e.id == id).cloned() else {
            return Err(anyhow!("unknown entry {}", id));
        };
        let medicine_id =
            crate::promote::promote_entry(&pool, self.deps.storage.as_ref(), &entry).await?;
        self.clear_timer(id);
        self.entries = entries::remove_by_id(std::mem::take(&mut self.entries), id);
        self.uploads.configure_slots(&self.entries);
        Ok(medicine_id)
    }

    /// First persistence flips the session token into a durable row id; the
    /// timer table and upload channels follow the rename.
    async fn promote_to_durable(&mut self, id: &EntryId) -> EntryId {
        let Some(pool) = self.deps.store.clone() else {
            return id.clone();
        };
        if id.as_durable().is_some() {
            return id.clone();
        }
        let Some(entry) = self.entries.iter_mut().find(|e| &e.id == id) else {
            return id.clone();
        };
        let token = entry.id.to_string();
        match db::persist_entry(&pool, &token, entry.sequence_number).await {
            Ok(durable) => {
                let new_id = EntryId::Durable(durable);
                entry.id = new_id.clone();
                if let Some(slot) = self.timers.remove(id) {
                    self.timers.insert(new_id.clone(), slot);
                }
                self.uploads.configure_slots(&self.entries);
                new_id
            }
            Err(err) => {
                warn!(?err, entry_id = %id, "failed to persist entry; staying session-local");
                id.clone()
            }
        }
    }

    /// Start (or restart) the debounce countdown for an entry. Any existing
    /// timer is cancelled first; exactly one timer per entry may live.
    fn start_countdown(&mut self, id: &EntryId) {
        self.clear_timer(id);
        self.next_generation += 1;
        let generation = self.next_generation;
        let debounce = self.config.debounce_seconds;
        let Some(entry) = self.entry_mut(id) else { return };
        entry.countdown_seconds_remaining = debounce;
        entry.timer_generation = generation;

        let tx = self.self_tx.clone();
        let tick = self.config.tick_interval;
        let timer_id = id.clone();
        let handle = tokio::spawn(async move {
            for _ in 0..debounce {
                tokio::time::sleep(tick).await;
                if tx
                    .send(Command::Tick {
                        id: timer_id.clone(),
                        generation,
                    })
                    .await
                    .is_err()
                {
                    return;
                }
            }
        });
        self.timers.insert(id.clone(), TimerSlot { generation, handle });
        info!(entry_id = %id, debounce, "countdown started");
    }

    /// Abort and forget an entry's timer. Idempotent: clearing an absent or
    /// already-fired timer is a no-op.
    fn clear_timer(&mut self, id: &EntryId) {
        if let Some(slot) = self.timers.remove(id) {
            slot.handle.abort();
        }
    }

    async fn apply_tick(&mut self, id: &EntryId, generation: u64) {
        eprintln!("DEBUG tick id={id} gen={generation}");
        let Some(entry) = self.entry_mut(id) else { return };
        if entry.timer_generation != generation {
            // Stale tick from a cancelled or replaced timer.
            return;
        }
        entry.countdown_seconds_remaining = entry.countdown_seconds_remaining.saturating_sub(1);
        if entry.countdown_seconds_remaining == 0 {
            entry.timer_generation = 0;
            self.clear_timer(id);
            self.dispatch_entry(id).await;
        }
    }

    /// Hand one entry to the dispatcher: a single batched call covering all
    /// of its photos. Transitions Pending→Processing; dispatch failure is a
    /// per-entry Failed, never a session fault.
    async fn dispatch_entry(&mut self, id: &EntryId) {
        eprintln!("DEBUG dispatch_entry id={id}");
        let Some(entry) = self.entries.iter().find(|e| &e.id == id).cloned() else {
            return;
        };
        if entry.photos.is_empty() {
            return;
        }
        self.entries = entries::update_analysis_status(
            std::mem::take(&mut self.entries),
            id,
            AnalysisStatus::Processing,
            None,
        );
        self.mirror_analysis(id).await;

        let dres = self.deps.dispatcher.dispatch(&entry.id, &entry.photos).await;
        eprintln!("DEBUG dispatch result id={id} ok={}", dres.is_ok());
        if let Err(err) = dres {
            warn!(?err, entry_id = %id, "analysis dispatch failed");
            self.entries = entries::update_analysis_status(
                std::mem::take(&mut self.entries),
                id,
                AnalysisStatus::Failed,
                None,
            );
            self.entries = entries::push_validation_error(
                std::mem::take(&mut self.entries),
                id,
                format!("analysis dispatch failed: {}", err),
            );
            self.mirror_analysis(id).await;
        }
    }

    /// Per-entry batch trigger: every Pending entry with at least one photo
    /// is dispatched independently, so one bad entry cannot poison the rest.
    async fn analyze_all(&mut self) -> AnalyzeAllOutcome {
        let targets: Vec<EntryId> = self
            .entries
            .iter()
            .filter(|e| !e.photos.is_empty() && e.analysis_status == AnalysisStatus::Pending)
            .map(|e| e.id.clone())
            .collect();
        if targets.is_empty() {
            return AnalyzeAllOutcome::NothingToAnalyze;
        }
        let count = targets.len();
        for id in targets {
            self.clear_timer(&id);
            if let Some(entry) = self.entry_mut(&id) {
                entry.countdown_seconds_remaining = 0;
                entry.timer_generation = 0;
            }
            self.dispatch_entry(&id).await;
        }
        AnalyzeAllOutcome::Dispatched(count)
    }

    /// Apply an asynchronous completion event. Events for ids the session no
    /// longer tracks are dropped silently; they are races, not errors.
    async fn apply_event(&mut self, evt: AnalysisEvent) {
        eprintln!("DEBUG apply_event id={} status={:?}", evt.entry_id, evt.status);
        let Some(entry) = self.entries.iter().find(|e| e.id == evt.entry_id) else {
            return;
        };
        // Events only originate from dispatches, which require photos. An
        // entry with none had its photos cleared while the call was in
        // flight; its result is stale and is dropped like an unknown id.
        if entry.photos.is_empty() {
            return;
        }
        let id = evt.entry_id.clone();
        match evt.status {
            AnalysisStatus::Processing => {
                self.entries = entries::update_analysis_status(
                    std::mem::take(&mut self.entries),
                    &id,
                    AnalysisStatus::Processing,
                    None,
                );
            }
            AnalysisStatus::Complete => match evt.data.filter(|d| !d.is_empty()) {
                Some(data) => {
                    self.entries = entries::update_analysis_status(
                        std::mem::take(&mut self.entries),
                        &id,
                        AnalysisStatus::Complete,
                        Some(data),
                    );
                }
                // Complete without a result violates the invariant; surface
                // it as a failure instead of trusting it.
                None => self.fail_entry(&id, "analysis returned an empty result").await,
            },
            AnalysisStatus::Failed => {
                let message = evt
                    .message
                    .unwrap_or_else(|| "analysis failed".to_string());
                self.fail_entry(&id, &message).await;
            }
            AnalysisStatus::Pending => {}
        }
        self.mirror_analysis(&id).await;
    }

    async fn fail_entry(&mut self, id: &EntryId, message: &str) {
        self.clear_timer(id);
        self.entries = entries::update_analysis_status(
            std::mem::take(&mut self.entries),
            id,
            AnalysisStatus::Failed,
            None,
        );
        self.entries =
            entries::push_validation_error(std::mem::take(&mut self.entries), id, message);
        if let Some(entry) = self.entry_mut(id) {
            entry.countdown_seconds_remaining = 0;
            entry.timer_generation = 0;
        }
    }

    fn entry_mut(&mut self, id: &EntryId) -> Option<&mut BatchEntry> {
        self.entries.iter_mut().find(|e| &e.id == id)
    }

    async fn mirror_analysis(&self, id: &EntryId) {
        let (Some(pool), Some(durable)) = (self.deps.store.as_ref(), id.as_durable()) else {
            return;
        };
        let Some(entry) = self.entries.iter().find(|e| &e.id == id) else {
            return;
        };
        if let Err(err) = db::update_entry_analysis(
            pool,
            durable,
            entry.analysis_status,
            entry.analysis_result.as_ref(),
        )
        .await
        {
            warn!(?err, entry_id = %id, "failed to mirror analysis state");
        }
    }

    async fn mirror_approval(&self, id: &EntryId) {
        let (Some(pool), Some(durable)) = (self.deps.store.as_ref(), id.as_durable()) else {
            return;
        };
        let Some(entry) = self.entries.iter().find(|e| &e.id == id) else {
            return;
        };
        if let Err(err) = db::update_entry_approval(pool, durable, entry.approval_status).await {
            warn!(?err, entry_id = %id, "failed to mirror approval state");
        }
    }
}
