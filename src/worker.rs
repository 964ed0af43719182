//! Analysis job worker and dispatchers.
//!
//! The durable path mirrors the entry store's job queue: a session enqueues
//! an `analysis_jobs` row, a background worker picks it up, makes one
//! batched vision call for all of the entry's photos, and publishes the
//! outcome on the analysis topic. Transport failures back the job off with
//! the usual capped exponential schedule; an explicit "could not identify"
//! answer is terminal and is published as Failed, not retried.

use crate::db::{self, Pool};
use crate::model::{AnalysisEvent, AnalysisStatus, EntryId, PhotoRef};
use crate::session::AnalysisDispatcher;
use crate::storage::Storage;
use crate::vision::{AnalysisOutcome, ImagePayload, VisionService};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use futures::future::try_join_all;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{info, instrument, warn};

/// Dispatcher that records a durable job for the background worker.
#[derive(Clone)]
pub struct QueueDispatcher {
    pub pool: Pool,
}

#[async_trait]
impl AnalysisDispatcher for QueueDispatcher {
    async fn dispatch(&self, entry_id: &EntryId, _photos: &[PhotoRef]) -> Result<()> {
        let durable = entry_id
            .as_durable()
            .ok_or_else(|| anyhow!("entry {} is not persisted; cannot enqueue", entry_id))?;
        let jid = db::enqueue_analysis(&self.pool, durable, Utc::now()).await?;
        eprintln!("DEBUG enqueue entry={durable} job={jid}");
        Ok(())
    }
}

/// Dispatcher that skips the queue and analyzes in-process, publishing the
/// result on the same topic the worker uses.
#[derive(Clone)]
pub struct DirectDispatcher {
    pub vision: Arc<dyn VisionService>,
    pub storage: Arc<dyn Storage>,
    pub events: broadcast::Sender<AnalysisEvent>,
}

#[async_trait]
impl AnalysisDispatcher for DirectDispatcher {
    async fn dispatch(&self, entry_id: &EntryId, photos: &[PhotoRef]) -> Result<()> {
        let vision = self.vision.clone();
        let storage = self.storage.clone();
        let events = self.events.clone();
        let entry_id = entry_id.clone();
        let photos = photos.to_vec();
        // The call runs to completion off the session actor; if the entry is
        // removed meanwhile, the published event misses by id and is dropped.
        tokio::spawn(async move {
            let event = match analyze_photos(vision.as_ref(), storage.as_ref(), &entry_id, &photos)
                .await
            {
                Ok(event) => event,
                Err(err) => failed_event(&entry_id, format!("analysis failed: {}", err)),
            };
            let _ = events.send(event);
        });
        Ok(())
    }
}

fn failed_event(entry_id: &EntryId, message: String) -> AnalysisEvent {
    AnalysisEvent {
        entry_id: entry_id.clone(),
        status: AnalysisStatus::Failed,
        data: None,
        message: Some(message),
    }
}

/// Resolve photo references to bytes and make exactly one batched vision
/// call. `Err` means a retryable transport problem; terminal outcomes
/// (identified or explicitly unidentified) come back as events.
pub async fn analyze_photos(
    vision: &dyn VisionService,
    storage: &dyn Storage,
    entry_id: &EntryId,
    photos: &[PhotoRef],
) -> Result<AnalysisEvent> {
    let reads = photos.iter().map(|photo| async move {
        let bytes = storage.read(&photo.storage_key).await?;
        Ok::<_, anyhow::Error>(ImagePayload {
            name: photo.original_name.clone(),
            bytes,
        })
    });
    let images = match try_join_all(reads).await {
        Ok(images) => images,
        // Missing bytes will not heal on retry; fail the entry terminally.
        Err(err) => return Ok(failed_event(entry_id, format!("could not read photo: {}", err))),
    };

    let outcome = vision
        .analyze(&images)
        .await
        .context("vision analysis call failed")?;
    Ok(match outcome {
        AnalysisOutcome::Identified(attributes) => AnalysisEvent {
            entry_id: entry_id.clone(),
            status: AnalysisStatus::Complete,
            data: Some(attributes),
            message: None,
        },
        AnalysisOutcome::Unidentified(message) => failed_event(entry_id, message),
    })
}

/// Process at most one due analysis job. Returns whether a job was handled,
/// so callers can sleep when the queue is drained.
#[instrument(skip_all)]
pub async fn process_next_job(
    pool: &Pool,
    vision: &dyn VisionService,
    storage: &dyn Storage,
    events: &broadcast::Sender<AnalysisEvent>,
    max_backoff_secs: i64,
) -> Result<bool> {
    let claimed = db::next_due_analysis(pool).await?;
    eprintln!("DEBUG claim -> {claimed:?}");
    let Some((job_id, entry_id, attempt)) = claimed else {
        return Ok(false);
    };

    let Some(entry) = db::fetch_entry_for_analysis(pool, entry_id).await? else {
        // Entry removed after enqueue; drop the job quietly.
        info!(job_id, entry_id, "entry gone before analysis; dropping job");
        db::delete_analysis_job(pool, job_id).await?;
        return Ok(true);
    };
    if entry.photos.is_empty() {
        info!(job_id, entry_id, "entry has no photos; dropping job");
        db::delete_analysis_job(pool, job_id).await?;
        return Ok(true);
    }

    let id = EntryId::Durable(entry_id);
    let _ = events.send(AnalysisEvent {
        entry_id: id.clone(),
        status: AnalysisStatus::Processing,
        data: None,
        message: None,
    });

    match analyze_photos(vision, storage, &id, &entry.photos).await {
        Ok(event) => {
            db::update_entry_analysis(pool, entry_id, event.status, event.data.as_ref()).await?;
            let _ = events.send(event);
            db::delete_analysis_job(pool, job_id).await?;
            info!(job_id, entry_id, "analysis job finished");
        }
        Err(err) => {
            warn!(?err, job_id, entry_id, attempt, "analysis job failed; backoff");
            db::backoff_analysis_job(pool, job_id, attempt, max_backoff_secs).await?;
        }
    }
    Ok(true)
}
