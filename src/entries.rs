//! Entry State Manager: pure transformations over the in-memory batch entry
//! collection. Every operation is total; an absent id is a silent no-op so
//! UI events racing against background completions can never fault the
//! session actor.

use crate::model::{AnalysisStatus, ApprovalStatus, AttributeMap, BatchEntry, EntryId};

/// Generate `count` fresh empty entries with sequence numbers
/// `start_sequence+1 ..= start_sequence+count`.
pub fn create_empty_entries(count: usize, start_sequence: i64) -> Vec<BatchEntry> {
    (1..=count as i64)
        .map(|offset| BatchEntry::new(start_sequence + offset))
        .collect()
}

/// Replace the entry with `id` wholesale. No-op if absent.
pub fn replace_by_id(mut entries: Vec<BatchEntry>, id: &EntryId, updated: BatchEntry) -> Vec<BatchEntry> {
    if let Some(slot) = entries.iter_mut().find(|e| &e.id == id) {
        *slot = updated;
    }
    entries
}

/// Drop the entry with `id`. No-op if absent.
pub fn remove_by_id(mut entries: Vec<BatchEntry>, id: &EntryId) -> Vec<BatchEntry> {
    entries.retain(|e| &e.id != id);
    entries
}

/// Set the approval status of one entry. Approving an entry whose analysis
/// is not Complete is a no-op; the invariant Approved ⇒ Complete holds in
/// every reachable state.
pub fn update_approval_status(
    mut entries: Vec<BatchEntry>,
    id: &EntryId,
    status: ApprovalStatus,
) -> Vec<BatchEntry> {
    if let Some(entry) = entries.iter_mut().find(|e| &e.id == id) {
        if status == ApprovalStatus::Approved && entry.analysis_status != AnalysisStatus::Complete {
            return entries;
        }
        entry.approval_status = status;
    }
    entries
}

/// Set the analysis status of one entry. When `result` is supplied it
/// overwrites `analysis_result`; when omitted the stored result is left
/// untouched, so Processing→Processing refreshes are safe.
pub fn update_analysis_status(
    mut entries: Vec<BatchEntry>,
    id: &EntryId,
    status: AnalysisStatus,
    result: Option<AttributeMap>,
) -> Vec<BatchEntry> {
    if let Some(entry) = entries.iter_mut().find(|e| &e.id == id) {
        entry.analysis_status = status;
        if let Some(result) = result {
            entry.analysis_result = Some(result);
        }
        if status != AnalysisStatus::Complete && entry.approval_status == ApprovalStatus::Approved {
            // Losing Complete revokes approval; Approved requires Complete.
            entry.approval_status = ApprovalStatus::Pending;
        }
    }
    entries
}

/// Remove the photo at `index` and re-derive analysis state: with no photos
/// left the entry returns to Pending with a cleared result. The countdown
/// fields are cleared here; cancelling the real timer task is the caller's
/// responsibility.
pub fn remove_photo_at_index(
    mut entries: Vec<BatchEntry>,
    id: &EntryId,
    index: usize,
) -> Vec<BatchEntry> {
    if let Some(entry) = entries.iter_mut().find(|e| &e.id == id) {
        if index >= entry.photos.len() {
            return entries;
        }
        entry.photos.remove(index);
        entry.countdown_seconds_remaining = 0;
        entry.timer_generation = 0;
        if entry.photos.is_empty() {
            entry.analysis_status = AnalysisStatus::Pending;
            entry.analysis_result = None;
            entry.approval_status = ApprovalStatus::Pending;
        }
    }
    entries
}

/// Append validation/error text to one entry. No-op if absent.
pub fn push_validation_error(
    mut entries: Vec<BatchEntry>,
    id: &EntryId,
    message: impl Into<String>,
) -> Vec<BatchEntry> {
    if let Some(entry) = entries.iter_mut().find(|e| &e.id == id) {
        entry.validation_errors.push(message.into());
    }
    entries
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn with_photo(mut entry: BatchEntry, name: &str) -> BatchEntry {
        entry.photos.push(crate::model::PhotoRef {
            storage_key: format!("batch/{name}"),
            display_url: format!("/media/batch/{name}"),
            original_name: name.into(),
            byte_size: 1024,
        });
        entry
    }

    #[test]
    fn create_assigns_sequences_and_unique_ids() {
        let entries = create_empty_entries(3, 5);
        let seqs: Vec<i64> = entries.iter().map(|e| e.sequence_number).collect();
        assert_eq!(seqs, vec![6, 7, 8]);
        let ids: HashSet<String> = entries.iter().map(|e| e.id.to_string()).collect();
        assert_eq!(ids.len(), 3);
    }

    #[test]
    fn ids_stay_unique_across_create_remove_cycles() {
        let mut entries = create_empty_entries(4, 0);
        let victim = entries[1].id.clone();
        entries = remove_by_id(entries, &victim);
        entries.extend(create_empty_entries(3, 4));
        let ids: HashSet<String> = entries.iter().map(|e| e.id.to_string()).collect();
        assert_eq!(ids.len(), entries.len());
    }

    #[test]
    fn remove_unknown_id_is_noop() {
        let entries = create_empty_entries(2, 0);
        let unknown = EntryId::Session("not-there".into());
        let after = remove_by_id(entries.clone(), &unknown);
        assert_eq!(after.len(), entries.len());
    }

    #[test]
    fn approve_requires_complete() {
        let entries = create_empty_entries(1, 0);
        let id = entries[0].id.clone();

        // Pending analysis: approval must not stick.
        let entries = update_approval_status(entries, &id, ApprovalStatus::Approved);
        assert_eq!(entries[0].approval_status, ApprovalStatus::Pending);

        // Complete analysis: approval applies.
        let mut result = AttributeMap::new();
        result.insert("name".into(), "Ibuprofen".into());
        let entries = update_analysis_status(entries, &id, AnalysisStatus::Complete, Some(result));
        let entries = update_approval_status(entries, &id, ApprovalStatus::Approved);
        assert_eq!(entries[0].approval_status, ApprovalStatus::Approved);
    }

    #[test]
    fn losing_complete_revokes_approval() {
        let entries = create_empty_entries(1, 0);
        let id = entries[0].id.clone();
        let mut result = AttributeMap::new();
        result.insert("name".into(), "Aspirin".into());
        let entries = update_analysis_status(entries, &id, AnalysisStatus::Complete, Some(result));
        let entries = update_approval_status(entries, &id, ApprovalStatus::Approved);
        let entries = update_analysis_status(entries, &id, AnalysisStatus::Failed, None);
        assert_eq!(entries[0].approval_status, ApprovalStatus::Pending);
        // The stored result survives a status-only update.
        assert!(entries[0].analysis_result.is_some());
    }

    #[test]
    fn status_update_without_result_keeps_existing_result() {
        let entries = create_empty_entries(1, 0);
        let id = entries[0].id.clone();
        let mut result = AttributeMap::new();
        result.insert("name".into(), "Paracetamol".into());
        let entries = update_analysis_status(entries, &id, AnalysisStatus::Complete, Some(result));
        let entries =
            update_analysis_status(entries, &id, AnalysisStatus::Processing, None);
        assert_eq!(entries[0].analysis_status, AnalysisStatus::Processing);
        assert_eq!(
            entries[0].analysis_result.as_ref().unwrap()["name"],
            "Paracetamol"
        );
    }

    #[test]
    fn removing_last_photo_resets_entry() {
        let mut entries = create_empty_entries(1, 0);
        entries[0] = with_photo(entries[0].clone(), "front.jpg");
        entries[0] = with_photo(entries[0].clone(), "back.jpg");
        let id = entries[0].id.clone();
        let mut result = AttributeMap::new();
        result.insert("name".into(), "Cetirizine".into());
        let entries = update_analysis_status(entries, &id, AnalysisStatus::Complete, Some(result));

        let entries = remove_photo_at_index(entries, &id, 0);
        let entries = remove_photo_at_index(entries, &id, 0);
        assert!(entries[0].photos.is_empty());
        assert_eq!(entries[0].analysis_status, AnalysisStatus::Pending);
        assert!(entries[0].analysis_result.is_none());
        assert_eq!(entries[0].countdown_seconds_remaining, 0);
        assert_eq!(entries[0].timer_generation, 0);
    }

    #[test]
    fn remove_photo_out_of_range_is_noop() {
        let mut entries = create_empty_entries(1, 0);
        entries[0] = with_photo(entries[0].clone(), "only.jpg");
        let id = entries[0].id.clone();
        let entries = remove_photo_at_index(entries, &id, 5);
        assert_eq!(entries[0].photos.len(), 1);
    }

    #[test]
    fn replace_by_id_swaps_in_place() {
        let entries = create_empty_entries(2, 0);
        let id = entries[0].id.clone();
        let mut updated = entries[0].clone();
        updated.validation_errors.push("edited".into());
        let entries = replace_by_id(entries, &id, updated);
        assert_eq!(entries[0].validation_errors, vec!["edited".to_string()]);
        assert!(entries[1].validation_errors.is_empty());
    }
}
