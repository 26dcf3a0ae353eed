use serde::{Serialize, Deserialize};
use serde_with::skip_serializing_none;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::data_uri::DataUri;

/// One photography prompt as authored by the generation service.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct OptimizedPrompt {
    pub title: String,
    pub prompt: String,
    pub camera: String,
    pub focal_length: String,
    pub lighting: String,
    pub environment: String,
}

/// A stored proposal. `id` is assigned locally; titles are service-authored and may repeat.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Proposal {
    pub id: Uuid,
    #[serde(flatten)]
    pub prompt: OptimizedPrompt,
}

#[skip_serializing_none]
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GenerationResult {
    pub id: Uuid,
    pub original_image: DataUri,
    pub optimized_prompts: Vec<Proposal>,
    pub generated_image: Option<DataUri>,
    pub preview_proposal_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

impl GenerationResult {
    pub fn proposal(&self, id: Uuid) -> Option<&Proposal> {
        self.optimized_prompts.iter().find(|p| p.id == id)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum Phase {
    /// Fewer than two images uploaded.
    Empty,
    Ready,
    Optimizing,
    HasResults,
    GeneratingPreview,
    HasPreview,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct UploadRequest {
    pub image: String,
}

#[skip_serializing_none]
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct SessionView {
    pub id: Uuid,
    pub phase: Phase,
    pub has_portrait: bool,
    pub has_product: bool,
    /// A service call is running, possibly one started before the latest upload.
    pub busy: bool,
    pub optimizing: bool,
    pub generating_proposal_id: Option<Uuid>,
    pub error: Option<String>,
    pub copied_proposal_id: Option<Uuid>,
    pub result: Option<GenerationResult>,
    pub updated_at: DateTime<Utc>,
}
