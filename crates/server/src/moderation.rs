use crate::chunker::{Chunk, ChunkKind, ContentChunker};
use crate::error::AppError;
use crate::models::{moderation_record_id, ModerationRecord, DEFAULT_PARTITION_KEY};
use crate::store::DocumentStore;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;

// NOTE: Changing the window size invalidates every verdict deduplicated so
// far; all the prior text-analysis caching goes to waste.
pub const TEXT_WINDOW_BYTES: usize = 9000;

pub const DEFAULT_MAX_OFFENSIVE_SEVERITY: i64 = 3;

const IMAGE_DATA_PREFIX: &str = "data:image/png;base64,";

/// Moderation result for one analyzed unit, or merged across a request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SafetyAnalysis {
    #[serde(rename = "categoriesAnalysis", default)]
    pub categories_analysis: Vec<CategoryAnalysis>,
    #[serde(rename = "blocklistsMatch", default)]
    pub blocklists_match: Vec<BlocklistMatch>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategoryAnalysis {
    pub category: String,
    pub severity: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlocklistMatch {
    #[serde(rename = "blocklistName")]
    pub blocklist_name: String,
    #[serde(rename = "matchingText")]
    pub matching_text: String,
}

/// The external content-safety API.
#[async_trait]
pub trait ModerationApi: Send + Sync {
    async fn analyze_text(&self, text: &str) -> Result<SafetyAnalysis, AppError>;

    /// `image_b64` is the raw base64 payload, prefix already stripped.
    async fn analyze_image(&self, image_b64: &str) -> Result<SafetyAnalysis, AppError>;
}

/// Azure AI Content Safety client.
pub struct AzureContentSafety {
    endpoint: String,
    api_key: String,
    client: reqwest::Client,
}

const API_VERSION: &str = "2024-09-01";

impl AzureContentSafety {
    pub fn new(endpoint: String, api_key: String, client: reqwest::Client) -> Self {
        Self {
            endpoint,
            api_key,
            client,
        }
    }

    async fn post_analyze(&self, operation: &str, body: Value) -> Result<SafetyAnalysis, AppError> {
        let url = format!(
            "{}/contentsafety/{}?api-version={}",
            self.endpoint, operation, API_VERSION
        );

        let response = self
            .client
            .post(&url)
            .header("Content-Type", "application/json")
            .header("Ocp-Apim-Subscription-Key", &self.api_key)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            tracing::error!(status = %status, detail = %detail, "Moderation API call failed");
            return Err(AppError::Upstream {
                status: status.as_u16(),
            });
        }

        Ok(response.json().await?)
    }
}

#[async_trait]
impl ModerationApi for AzureContentSafety {
    async fn analyze_text(&self, text: &str) -> Result<SafetyAnalysis, AppError> {
        self.post_analyze("text:analyze", json!({ "text": text }))
            .await
    }

    async fn analyze_image(&self, image_b64: &str) -> Result<SafetyAnalysis, AppError> {
        self.post_analyze("image:analyze", json!({ "image": { "content": image_b64 } }))
            .await
    }
}

/// Chunks a request, moderates each unit through the content-addressed
/// cache, and merges the per-unit verdicts into one.
pub struct ContentModerator {
    api: Arc<dyn ModerationApi>,
    store: Arc<dyn DocumentStore>,
    max_offensive_severity: i64,
}

struct Unit {
    kind: ChunkKind,
    bytes: Vec<u8>,
}

impl ContentModerator {
    pub fn new(
        api: Arc<dyn ModerationApi>,
        store: Arc<dyn DocumentStore>,
        max_offensive_severity: i64,
    ) -> Self {
        Self {
            api,
            store,
            max_offensive_severity,
        }
    }

    /// Merged verdict for a whole request body: max severity per category,
    /// blocklist matches concatenated.
    pub async fn analyze_request(&self, body: &Value) -> Result<SafetyAnalysis, AppError> {
        let mut severities: BTreeMap<String, i64> = BTreeMap::new();
        let mut blocklists_match = Vec::new();

        for chunk in ContentChunker::new(body) {
            let chunk = chunk?;
            for unit in split_units(chunk) {
                let verdict = self.analyze_unit_cached(&unit).await?;

                blocklists_match.extend(verdict.blocklists_match);
                for analysis in verdict.categories_analysis {
                    let severity = severities.entry(analysis.category).or_insert(0);
                    if analysis.severity > *severity {
                        *severity = analysis.severity;
                    }
                }
            }
        }

        Ok(SafetyAnalysis {
            categories_analysis: severities
                .into_iter()
                .map(|(category, severity)| CategoryAnalysis { category, severity })
                .collect(),
            blocklists_match,
        })
    }

    pub fn is_offensive(&self, analysis: &SafetyAnalysis) -> bool {
        analysis
            .categories_analysis
            .iter()
            .any(|a| a.severity > self.max_offensive_severity)
    }

    async fn analyze_unit_cached(&self, unit: &Unit) -> Result<SafetyAnalysis, AppError> {
        let id = moderation_record_id(&unit.bytes);

        if let Some(record) = self.store.fetch::<ModerationRecord>(&id).await? {
            tracing::debug!(id = %id, "Moderation cache hit");
            let verdict = serde_json::from_slice(&record.cached_response)
                .map_err(|e| AppError::Internal(format!("malformed cached verdict: {e}")))?;
            return Ok(verdict);
        }

        let verdict = match unit.kind {
            ChunkKind::Text => {
                self.api
                    .analyze_text(&String::from_utf8_lossy(&unit.bytes))
                    .await?
            }
            ChunkKind::ImageUrl => {
                let data = std::str::from_utf8(&unit.bytes).map_err(|_| {
                    AppError::BadRequest("image URL is not valid UTF-8".to_string())
                })?;
                let payload = data.strip_prefix(IMAGE_DATA_PREFIX).ok_or_else(|| {
                    AppError::BadRequest(
                        "image data must be a base64 PNG data URL".to_string(),
                    )
                })?;
                self.api.analyze_image(payload).await?
            }
        };

        let record = ModerationRecord {
            id,
            partition_key: DEFAULT_PARTITION_KEY.to_string(),
            cached_response: serde_json::to_vec(&verdict)
                .map_err(|e| AppError::Internal(format!("failed to serialize verdict: {e}")))?,
        };
        self.store.upsert(&record).await?;

        Ok(verdict)
    }
}

/// Images go through whole; text is split into fixed-size byte windows so
/// identical windows deduplicate across users and requests. The cache key
/// is the raw window bytes, taken before any lossy conversion.
fn split_units(chunk: Chunk) -> Vec<Unit> {
    match chunk.kind {
        ChunkKind::ImageUrl => vec![Unit {
            kind: ChunkKind::ImageUrl,
            bytes: chunk.data.into_bytes(),
        }],
        ChunkKind::Text => chunk
            .data
            .as_bytes()
            .chunks(TEXT_WINDOW_BYTES)
            .map(|window| Unit {
                kind: ChunkKind::Text,
                bytes: window.to_vec(),
            })
            .collect(),
    }
}

/// Test double shared with the pipeline tests: flags any text containing
/// "rampage" as Violence severity 6.
#[cfg(test)]
pub struct FakeModerationApi {
    pub calls: std::sync::atomic::AtomicUsize,
}

#[cfg(test)]
impl FakeModerationApi {
    pub fn new() -> Self {
        Self {
            calls: std::sync::atomic::AtomicUsize::new(0),
        }
    }
}

#[cfg(test)]
#[async_trait]
impl ModerationApi for FakeModerationApi {
    async fn analyze_text(&self, text: &str) -> Result<SafetyAnalysis, AppError> {
        self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        let severity = if text.contains("rampage") { 6 } else { 0 };
        Ok(SafetyAnalysis {
            categories_analysis: vec![CategoryAnalysis {
                category: "Violence".to_string(),
                severity,
            }],
            blocklists_match: vec![],
        })
    }

    async fn analyze_image(&self, _image_b64: &str) -> Result<SafetyAnalysis, AppError> {
        self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        Ok(SafetyAnalysis {
            categories_analysis: vec![CategoryAnalysis {
                category: "Violence".to_string(),
                severity: 0,
            }],
            blocklists_match: vec![],
        })
    }
}
