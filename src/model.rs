use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Maximum number of photos a single batch entry may carry.
pub const MAX_PHOTOS_PER_ENTRY: usize = 3;

/// Debounce window (seconds) between the last photo arriving and automatic
/// analysis dispatch.
pub const DEBOUNCE_SECONDS: u32 = 5;

/// Flat attribute map returned by the vision model. Values are kept verbatim;
/// no required-field validation happens at this layer.
pub type AttributeMap = serde_json::Map<String, serde_json::Value>;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum AnalysisStatus {
    Pending,
    Processing,
    Complete,
    Failed,
}

impl AnalysisStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnalysisStatus::Pending => "PENDING",
            AnalysisStatus::Processing => "PROCESSING",
            AnalysisStatus::Complete => "COMPLETE",
            AnalysisStatus::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(AnalysisStatus::Pending),
            "PROCESSING" => Some(AnalysisStatus::Processing),
            "COMPLETE" => Some(AnalysisStatus::Complete),
            "FAILED" => Some(AnalysisStatus::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
}

impl ApprovalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApprovalStatus::Pending => "PENDING",
            ApprovalStatus::Approved => "APPROVED",
            ApprovalStatus::Rejected => "REJECTED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(ApprovalStatus::Pending),
            "APPROVED" => Some(ApprovalStatus::Approved),
            "REJECTED" => Some(ApprovalStatus::Rejected),
            _ => None,
        }
    }
}

/// Identifier for a batch entry. Starts life as a session-local token and
/// becomes a durable row id once the entry is first persisted. Comparison
/// normalizes both forms: an integer-parseable session token compares equal
/// to the matching durable id, everything else falls back to string equality.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum EntryId {
    Durable(i64),
    Session(String),
}

impl EntryId {
    /// Fresh session-local token, unique within (and across) sessions.
    pub fn fresh() -> Self {
        EntryId::Session(Uuid::new_v4().to_string())
    }

    /// Canonical form used for all comparisons: integer-parseable tokens
    /// collapse into the durable space.
    fn canonical(&self) -> EntryId {
        match self {
            EntryId::Durable(n) => EntryId::Durable(*n),
            EntryId::Session(s) => match s.trim().parse::<i64>() {
                Ok(n) => EntryId::Durable(n),
                Err(_) => EntryId::Session(s.clone()),
            },
        }
    }

    pub fn as_durable(&self) -> Option<i64> {
        match self.canonical() {
            EntryId::Durable(n) => Some(n),
            EntryId::Session(_) => None,
        }
    }
}

impl PartialEq for EntryId {
    fn eq(&self, other: &Self) -> bool {
        match (self.canonical(), other.canonical()) {
            (EntryId::Durable(a), EntryId::Durable(b)) => a == b,
            (EntryId::Session(a), EntryId::Session(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for EntryId {}

impl std::hash::Hash for EntryId {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        match self.canonical() {
            EntryId::Durable(n) => {
                0u8.hash(state);
                n.hash(state);
            }
            EntryId::Session(s) => {
                1u8.hash(state);
                s.hash(state);
            }
        }
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.canonical() {
            EntryId::Durable(n) => write!(f, "{}", n),
            EntryId::Session(s) => write!(f, "{}", s),
        }
    }
}

impl From<i64> for EntryId {
    fn from(n: i64) -> Self {
        EntryId::Durable(n)
    }
}

/// One stored photo attached to a batch entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PhotoRef {
    pub storage_key: String,
    pub display_url: String,
    pub original_name: String,
    pub byte_size: u64,
}

/// One unit of work in a batch session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchEntry {
    pub id: EntryId,
    pub sequence_number: i64,
    pub photos: Vec<PhotoRef>,
    pub analysis_status: AnalysisStatus,
    pub analysis_result: Option<AttributeMap>,
    pub approval_status: ApprovalStatus,
    /// 0 when no debounce countdown is active.
    pub countdown_seconds_remaining: u32,
    /// Identifies the live countdown timer; 0 means none. Ticks from an
    /// older generation are stale and must be ignored.
    pub timer_generation: u64,
    pub validation_errors: Vec<String>,
}

impl BatchEntry {
    pub fn new(sequence_number: i64) -> Self {
        Self {
            id: EntryId::fresh(),
            sequence_number,
            photos: Vec::new(),
            analysis_status: AnalysisStatus::Pending,
            analysis_result: None,
            approval_status: ApprovalStatus::Pending,
            countdown_seconds_remaining: 0,
            timer_generation: 0,
            validation_errors: Vec::new(),
        }
    }

    pub fn has_live_countdown(&self) -> bool {
        self.timer_generation != 0
    }
}

/// Event published on the analysis topic when a background worker starts,
/// finishes, or fails an entry's analysis.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisEvent {
    pub entry_id: EntryId,
    pub status: AnalysisStatus,
    pub data: Option<AttributeMap>,
    pub message: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_id_normalizes_numeric_tokens() {
        let durable = EntryId::Durable(42);
        let token = EntryId::Session("42".into());
        assert_eq!(durable, token);
        assert_eq!(token.as_durable(), Some(42));
    }

    #[test]
    fn entry_id_string_tokens_compare_by_equality() {
        let a = EntryId::Session("abc-1".into());
        let b = EntryId::Session("abc-1".into());
        let c = EntryId::Session("abc-2".into());
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, EntryId::Durable(7));
    }

    #[test]
    fn fresh_ids_are_unique() {
        let a = EntryId::fresh();
        let b = EntryId::fresh();
        assert_ne!(a, b);
    }

    #[test]
    fn status_round_trips_through_strings() {
        for s in [
            AnalysisStatus::Pending,
            AnalysisStatus::Processing,
            AnalysisStatus::Complete,
            AnalysisStatus::Failed,
        ] {
            assert_eq!(AnalysisStatus::parse(s.as_str()), Some(s));
        }
        assert_eq!(AnalysisStatus::parse("NOPE"), None);
    }
}
