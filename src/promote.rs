//! Photo-to-medicine promotion: turn an approved batch entry into a
//! permanent inventory record.
//!
//! Ordering is a strict invariant: photos are copied to permanent storage
//! first, the record is created only if every copy succeeded, copies are
//! rolled back if record creation fails, and the batch-scoped originals are
//! deleted only after the record exists.

use crate::db::{self, NewMedicine, Pool};
use crate::model::{ApprovalStatus, BatchEntry};
use crate::storage::Storage;
use anyhow::{anyhow, Result};
use tracing::{info, instrument, warn};
use uuid::Uuid;

fn file_name_of(key: &str) -> &str {
    key.rsplit('/').next().unwrap_or(key)
}

async fn rollback_copies(storage: &dyn Storage, copied: &[String]) {
    for key in copied {
        if let Err(err) = storage.delete(key).await {
            warn!(?err, key = %key, "failed to roll back copied photo");
        }
    }
}

/// Promote one approved entry. Returns the new medicine row id. The entry's
/// durable row and batch photos are gone afterwards; on any failure the
/// entry is left fully intact for retry.
#[instrument(skip_all)]
pub async fn promote_entry(pool: &Pool, storage: &dyn Storage, entry: &BatchEntry) -> Result<i64> {
    if entry.approval_status != ApprovalStatus::Approved {
        return Err(anyhow!("entry {} is not approved", entry.id));
    }
    let result = entry
        .analysis_result
        .as_ref()
        .filter(|r| !r.is_empty())
        .ok_or_else(|| anyhow!("entry {} has no analysis result", entry.id))?;
    if entry.photos.is_empty() {
        return Err(anyhow!("entry {} has no photos", entry.id));
    }

    // Step 1: copy every photo into the permanent tree.
    let dest_prefix = format!("medicines/{}", Uuid::new_v4().simple());
    let mut copied: Vec<String> = Vec::with_capacity(entry.photos.len());
    for photo in &entry.photos {
        let dest_key = format!("{}/{}", dest_prefix, file_name_of(&photo.storage_key));
        if let Err(err) = storage.copy(&photo.storage_key, &dest_key).await {
            warn!(?err, entry_id = %entry.id, "photo copy failed; rolling back");
            rollback_copies(storage, &copied).await;
            return Err(err);
        }
        copied.push(dest_key);
    }

    // Step 2: create the record; roll the copies back if that fails.
    let record = NewMedicine::from_attributes(result, copied.clone());
    let medicine_id = match db::insert_medicine(pool, &record).await {
        Ok(id) => id,
        Err(err) => {
            warn!(?err, entry_id = %entry.id, "record creation failed; rolling back copies");
            rollback_copies(storage, &copied).await;
            return Err(err);
        }
    };

    // Step 3: the record exists; only now remove the batch-scoped originals
    // and the entry row. Failures here are logged, never fatal.
    for photo in &entry.photos {
        if let Err(err) = storage.delete(&photo.storage_key).await {
            warn!(?err, key = %photo.storage_key, "failed to delete original photo");
        }
    }
    if let Some(durable) = entry.id.as_durable() {
        if let Err(err) = db::delete_entry(pool, durable).await {
            warn!(?err, entry_id = %entry.id, "failed to delete promoted entry row");
        }
    }

    info!(entry_id = %entry.id, medicine_id, "entry promoted to inventory");
    Ok(medicine_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AnalysisStatus, AttributeMap, BatchEntry, EntryId, PhotoRef};
    use crate::storage::LocalStorage;
    use tempfile::tempdir;

    async fn setup_pool() -> Pool {
        let pool = sqlx::SqlitePool::connect("sqlite::memory:").await.unwrap();
        sqlx::query("PRAGMA foreign_keys=ON;").execute(&pool).await.unwrap();
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();
        pool
    }

    async fn approved_entry(pool: &Pool, storage: &LocalStorage, photos: usize) -> BatchEntry {
        let durable = db::persist_entry(pool, &Uuid::new_v4().to_string(), 1)
            .await
            .unwrap();
        let mut entry = BatchEntry::new(1);
        entry.id = EntryId::Durable(durable);
        for n in 0..photos {
            let saved = storage
                .save(b"pixels", &format!("p{n}.jpg"))
                .await
                .unwrap();
            let photo = PhotoRef {
                storage_key: saved.storage_key,
                display_url: saved.display_url,
                original_name: saved.original_name,
                byte_size: saved.byte_size,
            };
            db::add_photo(pool, durable, &photo, n as i64 + 1).await.unwrap();
            entry.photos.push(photo);
        }
        let mut result = AttributeMap::new();
        result.insert("name".into(), "Ibuprofen".into());
        result.insert("dosage_form".into(), "tablet".into());
        entry.analysis_status = AnalysisStatus::Complete;
        entry.analysis_result = Some(result);
        entry.approval_status = ApprovalStatus::Approved;
        entry
    }

    #[tokio::test]
    async fn promotion_copies_then_creates_then_cleans_up() {
        let td = tempdir().unwrap();
        let storage = LocalStorage::new(td.path());
        let pool = setup_pool().await;
        let entry = approved_entry(&pool, &storage, 2).await;
        let originals: Vec<String> =
            entry.photos.iter().map(|p| p.storage_key.clone()).collect();

        let medicine_id = promote_entry(&pool, &storage, &entry).await.unwrap();

        // Copies exist under the permanent tree, originals are gone.
        let paths: String = sqlx::query_scalar("SELECT photo_paths FROM medicines WHERE id = ?")
            .bind(medicine_id)
            .fetch_one(&pool)
            .await
            .unwrap();
        let copied: Vec<String> = serde_json::from_str(&paths).unwrap();
        assert_eq!(copied.len(), 2);
        for key in &copied {
            assert!(key.starts_with("medicines/"));
            assert!(storage.read(key).await.is_ok());
        }
        for key in &originals {
            assert!(storage.read(key).await.is_err());
        }
        // Entry row is deleted.
        let durable = entry.id.as_durable().unwrap();
        assert!(db::fetch_stored_entry(&pool, durable).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn copy_failure_rolls_back_earlier_copies() {
        let td = tempdir().unwrap();
        let storage = LocalStorage::new(td.path());
        let pool = setup_pool().await;
        let mut entry = approved_entry(&pool, &storage, 1).await;
        // Second photo points at bytes that do not exist.
        entry.photos.push(PhotoRef {
            storage_key: "batch/missing.jpg".into(),
            display_url: "/media/batch/missing.jpg".into(),
            original_name: "missing.jpg".into(),
            byte_size: 1,
        });

        assert!(promote_entry(&pool, &storage, &entry).await.is_err());

        // No record was created and no stray copies remain.
        let medicines: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM medicines")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(medicines, 0);
        assert!(storage.read(&entry.photos[0].storage_key).await.is_ok());
        let mut stray = tokio::fs::read_dir(td.path()).await.unwrap();
        while let Some(dir) = stray.next_entry().await.unwrap() {
            assert_ne!(dir.file_name(), "medicines");
        }
    }

    #[tokio::test]
    async fn record_failure_rolls_back_copies_and_keeps_originals() {
        let td = tempdir().unwrap();
        let storage = LocalStorage::new(td.path());
        let pool = setup_pool().await;
        let entry = approved_entry(&pool, &storage, 2).await;

        // Force record creation to fail.
        sqlx::query("DROP TABLE medicines").execute(&pool).await.unwrap();

        assert!(promote_entry(&pool, &storage, &entry).await.is_err());

        // Originals untouched; entry row still present for retry.
        for photo in &entry.photos {
            assert!(storage.read(&photo.storage_key).await.is_ok());
        }
        let durable = entry.id.as_durable().unwrap();
        assert!(db::fetch_stored_entry(&pool, durable).await.unwrap().is_some());
        // Rolled-back copies are gone.
        let mut stray = tokio::fs::read_dir(td.path()).await.unwrap();
        while let Some(dir) = stray.next_entry().await.unwrap() {
            if dir.file_name() == "medicines" {
                let mut inner = tokio::fs::read_dir(dir.path()).await.unwrap();
                while let Some(sub) = inner.next_entry().await.unwrap() {
                    let mut files = tokio::fs::read_dir(sub.path()).await.unwrap();
                    assert!(files.next_entry().await.unwrap().is_none());
                }
            }
        }
    }

    #[tokio::test]
    async fn unapproved_entry_is_rejected() {
        let td = tempdir().unwrap();
        let storage = LocalStorage::new(td.path());
        let pool = setup_pool().await;
        let mut entry = approved_entry(&pool, &storage, 1).await;
        entry.approval_status = ApprovalStatus::Pending;
        assert!(promote_entry(&pool, &storage, &entry).await.is_err());
        // Nothing was touched.
        assert!(storage.read(&entry.photos[0].storage_key).await.is_ok());
    }
}
