use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use reqwest::Client;
use tracing::{debug, error, info};

use crate::config::GeminiConfig;
use crate::data_uri::DataUri;
use crate::models::OptimizedPrompt;
use crate::prompts::{build_optimizer_instruction, parse_proposals, proposal_response_schema, ContractError};

/// MIME used for a returned image that carries no usable image type.
pub const DEFAULT_PREVIEW_MIME: &str = "image/png";

#[derive(Debug, Error)]
pub enum GeminiError {
    #[error("HTTP error: {0}")] Http(String),
    #[error("API returned status {status}: {body}")] Status { status: u16, body: String },
    #[error("parse error: {0}")] Parse(String),
    #[error("proposal contract violated: {0}")] Contract(#[from] ContractError),
    #[error("no image data in response")] NoImage,
}

/// The two calls the workflow makes against the external generation service.
#[async_trait]
pub trait GenerationService: Send + Sync {
    /// Asks for structured photography prompts that merge the portrait with the product.
    async fn optimize_prompts(&self, portrait: &DataUri, product: &DataUri) -> Result<Vec<OptimizedPrompt>, GeminiError>;

    /// Renders one prompt against the portrait and returns the first inline image.
    async fn generate_preview(&self, portrait: &DataUri, prompt: &str) -> Result<DataUri, GeminiError>;
}

// Helper function to truncate base64 data in JSON for cleaner logging
fn truncate_base64_in_json(value: &mut Value) {
    match value {
        Value::Object(map) => {
            for (key, val) in map.iter_mut() {
                if key == "data" {
                    if let Value::String(s) = val {
                        if s.len() > 100 && s.is_ascii() {
                            *val = Value::String(format!("{}...[truncated {} chars]", &s[..50], s.len() - 50));
                        }
                    }
                } else {
                    truncate_base64_in_json(val);
                }
            }
        }
        Value::Array(arr) => {
            for val in arr.iter_mut() {
                truncate_base64_in_json(val);
            }
        }
        _ => {}
    }
}

fn loggable(value: &Value) -> String {
    let mut copy = value.clone();
    truncate_base64_in_json(&mut copy);
    serde_json::to_string(&copy).unwrap_or_default()
}

pub struct GeminiClient {
    client: Client,
    config: GeminiConfig,
}

impl GeminiClient {
    pub fn new(config: GeminiConfig) -> Self {
        Self { client: Client::new(), config }
    }

    async fn generate_content(&self, model: &str, request_body: &Value) -> Result<GeminiResponse, GeminiError> {
        let url = format!(
            "{}/models/{}:generateContent?key={}",
            self.config.base_url.trim_end_matches('/'), model, self.config.api_key
        );

        info!("🔗 Making request to: {}", self.redact(&url));
        debug!("📤 Request body: {}", loggable(request_body));

        let response = self.client
            .post(&url)
            .json(request_body)
            .send()
            .await
            .map_err(|e| GeminiError::Http(self.redact(&e.to_string())))?;

        let status = response.status();
        info!("📥 Response status: {}", status);

        if !status.is_success() {
            let error_body = response.text().await.unwrap_or_default();
            error!("❌ API Error response: {}", error_body);
            return Err(GeminiError::Status { status: status.as_u16(), body: error_body });
        }

        let response_text = response.text().await
            .map_err(|e| GeminiError::Http(self.redact(&e.to_string())))?;

        let raw: Value = serde_json::from_str(&response_text)
            .map_err(|e| GeminiError::Parse(format!("{}: {}", e, truncate(&response_text, 200))))?;
        debug!("📥 Raw Gemini API response: {}", loggable(&raw));

        serde_json::from_value(raw).map_err(|e| GeminiError::Parse(e.to_string()))
    }

    fn redact(&self, text: &str) -> String {
        if self.config.api_key.is_empty() {
            return text.to_string();
        }
        text.replace(&self.config.api_key, "***")
    }
}

#[async_trait]
impl GenerationService for GeminiClient {
    async fn optimize_prompts(&self, portrait: &DataUri, product: &DataUri) -> Result<Vec<OptimizedPrompt>, GeminiError> {
        let request_body = json!({
            "contents": [{
                "parts": [
                    RequestPart::inline(portrait),
                    RequestPart::inline(product),
                    RequestPart::Text { text: build_optimizer_instruction() },
                ]
            }],
            "generationConfig": {
                "responseMimeType": "application/json",
                "responseSchema": proposal_response_schema(),
            }
        });

        info!("🎯 Optimizing prompts with model {}", self.config.prompt_model);
        let parsed = self.generate_content(&self.config.prompt_model, &request_body).await?;
        let text = parsed.text();
        let proposals = parse_proposals(&text)?;
        info!("✅ Received {} proposals", proposals.len());
        Ok(proposals)
    }

    async fn generate_preview(&self, portrait: &DataUri, prompt: &str) -> Result<DataUri, GeminiError> {
        let request_body = json!({
            "contents": [{
                "parts": [
                    RequestPart::inline(portrait),
                    RequestPart::Text { text: prompt.to_string() },
                ]
            }],
            "generationConfig": {
                "responseModalities": ["TEXT", "IMAGE"],
            }
        });

        info!("🎯 Generating preview with model {}: {}", self.config.image_model, truncate(prompt, 100));
        let parsed = self.generate_content(&self.config.image_model, &request_body).await?;
        let image = extract_first_image(&parsed).ok_or(GeminiError::NoImage)?;
        info!("🖼️ Extracted {} preview ({} base64 chars)", image.mime_type(), image.data().len());
        Ok(image)
    }
}

// --- Request Building Helpers ---

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum RequestPart {
    Inline {
        #[serde(rename = "inlineData")]
        inline_data: InlineData,
    },
    Text { text: String },
}

impl RequestPart {
    fn inline(image: &DataUri) -> Self {
        Self::Inline {
            inline_data: InlineData {
                mime_type: image.mime_type().to_string(),
                data: image.data().to_string(),
            },
        }
    }
}

// --- Response Parsing Helpers ---

#[derive(Debug, Deserialize)]
pub(crate) struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

impl GeminiResponse {
    /// Concatenated text of the first candidate, which carries the structured JSON answer.
    fn text(&self) -> String {
        self.candidates
            .first()
            .map(|c| {
                c.content.parts.iter().filter_map(|p| match p {
                    Part::Text { text } => Some(text.as_str()),
                    _ => None,
                }).collect::<String>()
            })
            .unwrap_or_default()
    }
}

#[derive(Debug, Deserialize)]
struct Candidate { #[serde(default)] content: Content }

#[derive(Debug, Deserialize, Default)]
struct Content { #[serde(default)] parts: Vec<Part> }

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Part {
    Inline {
        #[serde(rename = "inlineData")]
        inline_data: InlineData
    },
    Text { text: String },
    Other(serde::de::IgnoredAny)
}

#[derive(Debug, Serialize, Deserialize)]
struct InlineData {
    #[serde(rename = "mimeType", default)]
    mime_type: String,
    data: String,
}

pub(crate) fn extract_first_image(resp: &GeminiResponse) -> Option<DataUri> {
    for c in &resp.candidates {
        for p in &c.content.parts {
            match p {
                Part::Inline { inline_data } => {
                    let mime = if inline_data.mime_type.starts_with("image/") {
                        inline_data.mime_type.as_str()
                    } else {
                        DEFAULT_PREVIEW_MIME
                    };
                    return Some(DataUri::from_base64(mime, inline_data.data.clone()));
                }
                Part::Text { text } => debug!("Skipping text part: {}", truncate(text, 200)),
                Part::Other(_) => {}
            }
        }
    }
    info!("⚠️ No inline image data found in response structure");
    None
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max { s.to_string() } else { format!("{}…", s.chars().take(max).collect::<String>()) }
}
