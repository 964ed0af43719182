//! Database entity and view models used by repositories.
//!
//! Keep these structs focused on the data returned by queries. Business logic
//! should live in higher layers.

use crate::model::{AnalysisStatus, ApprovalStatus, AttributeMap, PhotoRef};
use serde_json::Value;

/// Entry slice loaded by the analysis worker: just enough to make one
/// batched vision call.
#[derive(Debug, Clone)]
pub struct EntryForAnalysis {
    pub entry_id: i64,
    pub photos: Vec<PhotoRef>,
}

/// Full durable entry as stored, used when rehydrating a session.
#[derive(Debug, Clone)]
pub struct StoredEntry {
    pub id: i64,
    pub sequence: i64,
    pub analysis_status: AnalysisStatus,
    pub approval_status: ApprovalStatus,
    pub analysis_result: Option<AttributeMap>,
    pub photos: Vec<PhotoRef>,
}

/// Column set for a new permanent inventory row, extracted from an approved
/// entry's attribute map. Every field is optional; the reviewer fills gaps.
#[derive(Debug, Clone, Default)]
pub struct NewMedicine {
    pub name: Option<String>,
    pub brand_name: Option<String>,
    pub generic_name: Option<String>,
    pub dosage_form: Option<String>,
    pub active_ingredient: Option<String>,
    pub strength_value: Option<String>,
    pub strength_unit: Option<String>,
    pub container_type: Option<String>,
    pub total_quantity: Option<String>,
    pub remaining_quantity: Option<String>,
    pub quantity_unit: Option<String>,
    pub manufacturer: Option<String>,
    pub lot_number: Option<String>,
    pub expiration_date: Option<String>,
    pub ndc_code: Option<String>,
    pub photo_paths: Vec<String>,
}

impl NewMedicine {
    /// Pull the known columns out of an attribute map. Numbers and strings
    /// are both accepted; other value shapes are ignored.
    pub fn from_attributes(attributes: &AttributeMap, photo_paths: Vec<String>) -> Self {
        let text = |key: &str| -> Option<String> {
            match attributes.get(key) {
                Some(Value::String(s)) if !s.trim().is_empty() => Some(s.clone()),
                Some(Value::Number(n)) => Some(n.to_string()),
                _ => None,
            }
        };
        Self {
            name: text("name"),
            brand_name: text("brand_name"),
            generic_name: text("generic_name"),
            dosage_form: text("dosage_form"),
            active_ingredient: text("active_ingredient"),
            strength_value: text("strength_value"),
            strength_unit: text("strength_unit"),
            container_type: text("container_type"),
            total_quantity: text("total_quantity"),
            remaining_quantity: text("remaining_quantity"),
            quantity_unit: text("quantity_unit"),
            manufacturer: text("manufacturer"),
            lot_number: text("lot_number"),
            expiration_date: text("expiration_date"),
            ndc_code: text("ndc_code"),
            photo_paths,
        }
    }
}
