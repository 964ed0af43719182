//! Vision analysis client: sends one batched request per entry (all photo
//! angles together, never one call per photo) to the external multimodal API
//! and returns a best-effort attribute map.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use base64::Engine;
use once_cell::sync::Lazy;
use reqwest::{Client, StatusCode, Url};
use serde_json::{json, Value};
use std::any::Any;
use std::collections::HashSet;
use std::fmt;
use tracing::{info, warn};

use crate::model::AttributeMap;
use crate::vision::model::AnalyzeResponseBody;

pub mod model;

/// Dosage forms the model is allowed to assert. Anything else is dropped
/// rather than trusted verbatim.
static DOSAGE_FORMS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        "tablet",
        "capsule",
        "syrup",
        "suspension",
        "solution",
        "cream",
        "ointment",
        "gel",
        "lotion",
        "drops",
        "injection",
        "inhaler",
        "spray",
        "patch",
        "suppository",
    ]
    .into_iter()
    .collect()
});

static CONTAINER_TYPES: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        "bottle",
        "box",
        "tube",
        "vial",
        "inhaler",
        "blister_pack",
        "sachet",
        "ampoule",
    ]
    .into_iter()
    .collect()
});

/// One image handed to the analyzer: original name plus raw bytes.
#[derive(Debug, Clone)]
pub struct ImagePayload {
    pub name: String,
    pub bytes: Vec<u8>,
}

/// Outcome of one analysis call. An explicit "could not identify" answer is
/// terminal, not a transport failure, and must not be retried blindly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AnalysisOutcome {
    Identified(AttributeMap),
    Unidentified(String),
}

#[async_trait]
pub trait VisionService: Send + Sync + Any {
    async fn analyze(&self, images: &[ImagePayload]) -> Result<AnalysisOutcome>;
}

#[derive(Clone)]
pub struct VisionClient {
    http: Client,
    base_url: Url,
    token: String,
    model: String,
}

impl fmt::Debug for VisionClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VisionClient")
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .finish_non_exhaustive()
    }
}

impl VisionClient {
    pub fn new(token: String, model: String, base_url: Url) -> Self {
        let http = Client::builder()
            .user_agent("medbatch/0.1")
            .no_proxy()
            .build()
            .expect("reqwest client");
        Self {
            http,
            base_url,
            token,
            model,
        }
    }

    pub fn build_request(&self, images: &[ImagePayload]) -> Result<reqwest::Request> {
        let endpoint = self
            .base_url
            .join("v1/analyze")
            .context("invalid vision base URL")?;
        let body = build_analysis_body(&self.model, images);
        self.http
            .post(endpoint)
            .header("Authorization", format!("Bearer {}", self.token))
            .header("Content-Type", "application/json")
            .json(&body)
            .build()
            .context("failed to build vision request")
    }

    async fn execute(&self, images: &[ImagePayload]) -> Result<AnalysisOutcome> {
        if images.is_empty() {
            return Err(anyhow!("no images to analyze"));
        }
        let request = self.build_request(images)?;
        info!(url=%request.url(), images = images.len(), "dispatching vision analysis");

        let res = self
            .http
            .execute(request)
            .await
            .context("failed to reach vision API")?;

        if res.status() == StatusCode::TOO_MANY_REQUESTS {
            let body = res.text().await.unwrap_or_default();
            warn!("rate limited by vision API: {}", body);
            return Err(anyhow!("received 429 from vision API: {}", body));
        }
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            warn!("vision API error - status: {}, body: {}", status, body);
            return Err(anyhow!("vision API error {}: {}", status, body));
        }

        let body: AnalyzeResponseBody = res
            .json()
            .await
            .context("invalid vision response JSON")?;
        parse_analysis_response(body)
    }
}

#[async_trait]
impl VisionService for VisionClient {
    async fn analyze(&self, images: &[ImagePayload]) -> Result<AnalysisOutcome> {
        self.execute(images).await
    }
}

/// Build the JSON body for one batched analysis call. All images go in a
/// single request so the model can cross-reference packaging angles.
pub fn build_analysis_body(model: &str, images: &[ImagePayload]) -> Value {
    let engine = base64::engine::general_purpose::STANDARD;
    let images_json: Vec<Value> = images
        .iter()
        .map(|img| {
            json!({
                "name": img.name,
                "media_type": content_type_for(&img.name),
                "data": engine.encode(&img.bytes),
            })
        })
        .collect();
    json!({
        "model": model,
        "images": images_json,
    })
}

/// Interpret the response body: an explicit error field beats attributes;
/// attribute values for the closed vocabularies are sanitized.
pub fn parse_analysis_response(body: AnalyzeResponseBody) -> Result<AnalysisOutcome> {
    if let Some(message) = body.error.filter(|m| !m.trim().is_empty()) {
        return Ok(AnalysisOutcome::Unidentified(message));
    }
    let attributes = body
        .attributes
        .ok_or_else(|| anyhow!("vision response carried neither attributes nor error"))?;
    Ok(AnalysisOutcome::Identified(sanitize_attributes(attributes)))
}

/// Drop `dosage_form`/`container_type` values outside their fixed
/// vocabularies; everything else is kept verbatim, including keys the
/// contract does not name. Partial results are surfaced for manual review.
pub fn sanitize_attributes(mut attributes: AttributeMap) -> AttributeMap {
    for (key, vocab) in [
        ("dosage_form", &*DOSAGE_FORMS),
        ("container_type", &*CONTAINER_TYPES),
    ] {
        let keep = attributes
            .get(key)
            .and_then(Value::as_str)
            .map(|v| vocab.contains(v))
            .unwrap_or(false);
        if attributes.contains_key(key) && !keep {
            attributes.remove(key);
        }
    }
    attributes
}

fn content_type_for(name: &str) -> &'static str {
    match std::path::Path::new(name)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|s| s.to_ascii_lowercase())
    {
        Some(ext) if ext == "jpg" || ext == "jpeg" => "image/jpeg",
        Some(ext) if ext == "png" => "image/png",
        Some(ext) if ext == "gif" => "image/gif",
        Some(ext) if ext == "webp" => "image/webp",
        _ => "application/octet-stream",
    }
}
