//! Wire DTOs for the vision analysis API.

use crate::model::AttributeMap;
use serde::Deserialize;

/// Body returned by the analyze endpoint. Exactly one of the two fields is
/// expected to be populated.
#[derive(Debug, Deserialize)]
pub struct AnalyzeResponseBody {
    #[serde(default)]
    pub attributes: Option<AttributeMap>,
    #[serde(default)]
    pub error: Option<String>,
}
