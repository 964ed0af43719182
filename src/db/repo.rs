use super::model::{EntryForAnalysis, NewMedicine, StoredEntry};
use crate::model::{AnalysisStatus, ApprovalStatus, AttributeMap, PhotoRef};
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};
use tracing::instrument;

pub type Pool = SqlitePool;

pub async fn init_pool(database_url: &str) -> Result<Pool> {
    let normalized = prepare_sqlite_url(database_url);
    let pool = SqlitePool::connect(&normalized).await?;
    // WAL plus strict durability; cascading photo deletes need foreign keys.
    sqlx::query("PRAGMA journal_mode=WAL;").execute(&pool).await?;
    sqlx::query("PRAGMA synchronous=FULL;").execute(&pool).await?;
    sqlx::query("PRAGMA foreign_keys=ON;").execute(&pool).await?;
    Ok(pool)
}

/// For file-backed SQLite URLs, expand a leading `~/` and make sure the
/// parent directory exists. In-memory URLs and other schemes pass through.
fn prepare_sqlite_url(url: &str) -> String {
    if !url.starts_with("sqlite:") || url.starts_with("sqlite::memory") {
        return url.to_string();
    }
    let rest = url["sqlite:".len()..].trim_start_matches("//");
    let (path_part, query_part) = match rest.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (rest, None),
    };
    if path_part.is_empty() {
        return url.to_string();
    }
    let expanded = match path_part.strip_prefix("~/") {
        Some(tail) => match std::env::var("HOME") {
            Ok(home) => format!("{}/{}", home.trim_end_matches('/'), tail),
            Err(_) => path_part.to_string(),
        },
        None => path_part.to_string(),
    };
    if let Some(parent) = std::path::Path::new(&expanded).parent() {
        if !parent.as_os_str().is_empty() {
            let _ = std::fs::create_dir_all(parent);
        }
    }
    match query_part {
        Some(q) => format!("sqlite://{}?{}", expanded, q),
        None => format!("sqlite://{}", expanded),
    }
}

pub async fn run_migrations(pool: &Pool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

/// Create the durable row for an entry on first persistence. The session
/// token is stored so UI state and the durable row stay tied together.
#[instrument(skip_all)]
pub async fn persist_entry(pool: &Pool, session_token: &str, sequence: i64) -> Result<i64> {
    if let Some(id) =
        sqlx::query_scalar::<_, i64>("SELECT id FROM batch_entries WHERE session_token = ?")
            .bind(session_token)
            .fetch_optional(pool)
            .await?
    {
        return Ok(id);
    }
    let rec = sqlx::query(
        "INSERT INTO batch_entries (session_token, sequence) VALUES (?, ?) RETURNING id",
    )
    .bind(session_token)
    .bind(sequence)
    .fetch_one(pool)
    .await?;
    Ok(rec.get::<i64, _>("id"))
}

#[instrument(skip_all)]
pub async fn add_photo(pool: &Pool, entry_id: i64, photo: &PhotoRef, position: i64) -> Result<i64> {
    let rec = sqlx::query(
        "INSERT INTO entry_photos (entry_id, storage_key, display_url, original_name, byte_size, position) \
         VALUES (?, ?, ?, ?, ?, ?) RETURNING id",
    )
    .bind(entry_id)
    .bind(&photo.storage_key)
    .bind(&photo.display_url)
    .bind(&photo.original_name)
    .bind(photo.byte_size as i64)
    .bind(position)
    .fetch_one(pool)
    .await?;
    Ok(rec.get("id"))
}

async fn photos_for_entry(pool: &Pool, entry_id: i64) -> Result<Vec<PhotoRef>> {
    let rows = sqlx::query(
        "SELECT storage_key, display_url, original_name, byte_size \
         FROM entry_photos WHERE entry_id = ? ORDER BY position ASC, id ASC",
    )
    .bind(entry_id)
    .fetch_all(pool)
    .await?;
    Ok(rows
        .into_iter()
        .map(|row| PhotoRef {
            storage_key: row.get("storage_key"),
            display_url: row.get("display_url"),
            original_name: row.get("original_name"),
            byte_size: row.get::<i64, _>("byte_size") as u64,
        })
        .collect())
}

/// Load the slice of an entry the analysis worker needs. `None` when the
/// entry vanished between enqueue and dispatch; the caller treats that as
/// a benign no-op.
#[instrument(skip_all)]
pub async fn fetch_entry_for_analysis(pool: &Pool, entry_id: i64) -> Result<Option<EntryForAnalysis>> {
    let exists = sqlx::query_scalar::<_, i64>("SELECT id FROM batch_entries WHERE id = ?")
        .bind(entry_id)
        .fetch_optional(pool)
        .await?;
    if exists.is_none() {
        return Ok(None);
    }
    let photos = photos_for_entry(pool, entry_id).await?;
    Ok(Some(EntryForAnalysis { entry_id, photos }))
}

#[instrument(skip_all)]
pub async fn fetch_stored_entry(pool: &Pool, entry_id: i64) -> Result<Option<StoredEntry>> {
    let row = sqlx::query(
        "SELECT id, sequence, analysis_status, approval_status, analysis_result \
         FROM batch_entries WHERE id = ?",
    )
    .bind(entry_id)
    .fetch_optional(pool)
    .await?;
    let Some(row) = row else {
        return Ok(None);
    };
    let analysis_status: String = row.get("analysis_status");
    let approval_status: String = row.get("approval_status");
    let analysis_result = row
        .try_get::<Option<String>, _>("analysis_result")
        .ok()
        .flatten()
        .and_then(|raw| serde_json::from_str::<AttributeMap>(&raw).ok());
    let photos = photos_for_entry(pool, entry_id).await?;
    Ok(Some(StoredEntry {
        id: row.get("id"),
        sequence: row.get("sequence"),
        analysis_status: AnalysisStatus::parse(&analysis_status).ok_or_else(|| {
            anyhow!("entry {} has unknown analysis status {}", entry_id, analysis_status)
        })?,
        approval_status: ApprovalStatus::parse(&approval_status).ok_or_else(|| {
            anyhow!("entry {} has unknown approval status {}", entry_id, approval_status)
        })?,
        analysis_result,
        photos,
    }))
}

#[instrument(skip_all)]
pub async fn update_entry_analysis(
    pool: &Pool,
    entry_id: i64,
    status: AnalysisStatus,
    result: Option<&AttributeMap>,
) -> Result<()> {
    let result_json = match result {
        Some(map) => Some(serde_json::to_string(map).context("failed to serialize analysis result")?),
        None => None,
    };
    sqlx::query(
        "UPDATE batch_entries SET analysis_status = ?, \
         analysis_result = COALESCE(?, analysis_result) WHERE id = ?",
    )
    .bind(status.as_str())
    .bind(result_json)
    .bind(entry_id)
    .execute(pool)
    .await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn update_entry_approval(pool: &Pool, entry_id: i64, status: ApprovalStatus) -> Result<()> {
    sqlx::query("UPDATE batch_entries SET approval_status = ? WHERE id = ?")
        .bind(status.as_str())
        .bind(entry_id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Delete an entry and (via cascade) its photo rows. Absent ids are fine.
#[instrument(skip_all)]
pub async fn delete_entry(pool: &Pool, entry_id: i64) -> Result<()> {
    sqlx::query("DELETE FROM batch_entries WHERE id = ?")
        .bind(entry_id)
        .execute(pool)
        .await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn enqueue_analysis(pool: &Pool, entry_id: i64, due_at: DateTime<Utc>) -> Result<i64> {
    let rec = sqlx::query(
        "INSERT INTO analysis_jobs (entry_id, attempt, due_at) VALUES (?, 0, ?) RETURNING id",
    )
    .bind(entry_id)
    .bind(due_at)
    .fetch_one(pool)
    .await?;
    Ok(rec.get("id"))
}

#[instrument(skip_all)]
pub async fn next_due_analysis(pool: &Pool) -> Result<Option<(i64, i64, i32)>> {
    let row = sqlx::query(
        "SELECT id, entry_id, attempt FROM analysis_jobs \
         WHERE datetime(due_at) <= CURRENT_TIMESTAMP ORDER BY datetime(due_at) ASC LIMIT 1",
    )
    .fetch_optional(pool)
    .await?;
    Ok(row.map(|row| (row.get("id"), row.get("entry_id"), row.get("attempt"))))
}

#[instrument(skip_all)]
pub async fn delete_analysis_job(pool: &Pool, id: i64) -> Result<()> {
    sqlx::query("DELETE FROM analysis_jobs WHERE id = ?")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Exponential backoff: 5s * 2^attempt, capped at `max_cap_secs` (or 3600s
/// when the cap is unset/non-positive).
#[instrument(skip_all)]
pub async fn backoff_analysis_job(pool: &Pool, id: i64, attempt: i32, max_cap_secs: i64) -> Result<()> {
    let secs = (5_i64) * (1_i64 << attempt.min(10));
    let cap = if max_cap_secs <= 0 { 3600 } else { max_cap_secs };
    let secs = secs.min(cap);
    sqlx::query(
        "UPDATE analysis_jobs SET attempt = ?, due_at = datetime('now', ? || ' seconds') WHERE id = ?",
    )
    .bind(attempt + 1)
    .bind(secs)
    .bind(id)
    .execute(pool)
    .await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn count_remaining_analysis_jobs(pool: &Pool) -> Result<i64> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM analysis_jobs")
        .fetch_one(pool)
        .await?;
    Ok(count)
}

#[instrument(skip_all)]
pub async fn insert_medicine(pool: &Pool, record: &NewMedicine) -> Result<i64> {
    let photo_paths =
        serde_json::to_string(&record.photo_paths).context("failed to serialize photo paths")?;
    let rec = sqlx::query(
        "INSERT INTO medicines (name, brand_name, generic_name, dosage_form, active_ingredient, \
         strength_value, strength_unit, container_type, total_quantity, remaining_quantity, \
         quantity_unit, manufacturer, lot_number, expiration_date, ndc_code, photo_paths) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) RETURNING id",
    )
    .bind(&record.name)
    .bind(&record.brand_name)
    .bind(&record.generic_name)
    .bind(&record.dosage_form)
    .bind(&record.active_ingredient)
    .bind(&record.strength_value)
    .bind(&record.strength_unit)
    .bind(&record.container_type)
    .bind(&record.total_quantity)
    .bind(&record.remaining_quantity)
    .bind(&record.quantity_unit)
    .bind(&record.manufacturer)
    .bind(&record.lot_number)
    .bind(&record.expiration_date)
    .bind(&record.ndc_code)
    .bind(photo_paths)
    .fetch_one(pool)
    .await
    .context("failed to create medicine record")?;
    Ok(rec.get("id"))
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn setup_pool() -> Pool {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        sqlx::query("PRAGMA foreign_keys=ON;").execute(&pool).await.unwrap();
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();
        pool
    }

    fn photo(name: &str) -> PhotoRef {
        PhotoRef {
            storage_key: format!("batch/{name}"),
            display_url: format!("/media/batch/{name}"),
            original_name: name.into(),
            byte_size: 512,
        }
    }

    #[tokio::test]
    async fn persist_entry_is_idempotent_per_token() {
        let pool = setup_pool().await;
        let a = persist_entry(&pool, "tok-1", 1).await.unwrap();
        let b = persist_entry(&pool, "tok-1", 1).await.unwrap();
        assert_eq!(a, b);
        let c = persist_entry(&pool, "tok-2", 2).await.unwrap();
        assert_ne!(a, c);
    }

    #[tokio::test]
    async fn photos_round_trip_in_position_order() {
        let pool = setup_pool().await;
        let id = persist_entry(&pool, "tok", 1).await.unwrap();
        add_photo(&pool, id, &photo("b.jpg"), 2).await.unwrap();
        add_photo(&pool, id, &photo("a.jpg"), 1).await.unwrap();

        let entry = fetch_entry_for_analysis(&pool, id).await.unwrap().unwrap();
        let names: Vec<&str> = entry.photos.iter().map(|p| p.original_name.as_str()).collect();
        assert_eq!(names, vec!["a.jpg", "b.jpg"]);
    }

    #[tokio::test]
    async fn delete_entry_cascades_photos() {
        let pool = setup_pool().await;
        let id = persist_entry(&pool, "tok", 1).await.unwrap();
        add_photo(&pool, id, &photo("a.jpg"), 1).await.unwrap();
        delete_entry(&pool, id).await.unwrap();

        assert!(fetch_entry_for_analysis(&pool, id).await.unwrap().is_none());
        let orphans: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM entry_photos")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(orphans, 0);
    }

    #[tokio::test]
    async fn analysis_status_and_result_round_trip() {
        let pool = setup_pool().await;
        let id = persist_entry(&pool, "tok", 1).await.unwrap();

        let mut result = AttributeMap::new();
        result.insert("name".into(), "Loratadine".into());
        update_entry_analysis(&pool, id, AnalysisStatus::Complete, Some(&result))
            .await
            .unwrap();
        // Status-only update keeps the stored result.
        update_entry_analysis(&pool, id, AnalysisStatus::Processing, None)
            .await
            .unwrap();

        let stored = fetch_stored_entry(&pool, id).await.unwrap().unwrap();
        assert_eq!(stored.analysis_status, AnalysisStatus::Processing);
        assert_eq!(stored.analysis_result.unwrap()["name"], "Loratadine");
    }

    #[tokio::test]
    async fn job_queue_flow() {
        let pool = setup_pool().await;
        let id = persist_entry(&pool, "tok", 1).await.unwrap();
        let job = enqueue_analysis(&pool, id, Utc::now()).await.unwrap();

        let (job_id, entry_id, attempt) = next_due_analysis(&pool).await.unwrap().unwrap();
        assert_eq!(job_id, job);
        assert_eq!(entry_id, id);
        assert_eq!(attempt, 0);

        backoff_analysis_job(&pool, job_id, attempt, 60).await.unwrap();
        // Backed-off job is no longer due.
        assert!(next_due_analysis(&pool).await.unwrap().is_none());
        assert_eq!(count_remaining_analysis_jobs(&pool).await.unwrap(), 1);

        delete_analysis_job(&pool, job_id).await.unwrap();
        assert_eq!(count_remaining_analysis_jobs(&pool).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn insert_medicine_stores_photo_paths() {
        let pool = setup_pool().await;
        let mut attrs = AttributeMap::new();
        attrs.insert("name".into(), "Amoxicillin".into());
        let record = NewMedicine::from_attributes(&attrs, vec!["medicines/1/a.jpg".into()]);
        let id = insert_medicine(&pool, &record).await.unwrap();

        let paths: String = sqlx::query_scalar("SELECT photo_paths FROM medicines WHERE id = ?")
            .bind(id)
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(paths, r#"["medicines/1/a.jpg"]"#);
    }

    #[test]
    fn prepare_url_passthrough() {
        assert_eq!(prepare_sqlite_url("sqlite::memory:"), "sqlite::memory:");
        assert_eq!(prepare_sqlite_url("postgres://x"), "postgres://x");
    }
}
