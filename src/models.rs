use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use crate::error::GenerateError;

// Gateway API request format
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct GenerateRequest {
    #[serde(default)]
    pub prompt: String,
}

// Image payload as the backend hands it over; never decoded here
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageArtifact {
    pub data: String,
    pub mime_type: String,
}

impl ImageArtifact {
    pub fn data_url(&self) -> String {
        format!("data:{};base64,{}", self.mime_type, self.data)
    }
}

// Backend success body
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendImage {
    pub image: String,
    #[serde(default = "default_mime_type")]
    pub mime_type: String,
    #[serde(default)]
    pub elapsed_ms: u64,
    #[serde(default)]
    pub persisted_id: Option<String>,
}

fn default_mime_type() -> String {
    "image/png".to_string()
}

impl BackendImage {
    pub fn artifact(&self) -> ImageArtifact {
        ImageArtifact {
            data: self.image.clone(),
            mime_type: self.mime_type.clone(),
        }
    }
}

// Outcome of a successful submission
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationResult {
    pub image: ImageArtifact,
    pub elapsed_ms: u64,
    pub persisted_id: Option<String>,
    pub cached: bool,
    pub attempts: u32,
}

// Gateway API response format
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct GenerateResponse {
    pub image: String,
    pub mime_type: String,
    pub data_url: String,
    pub elapsed_ms: u64,
    pub persisted_id: Option<String>,
    pub cached: bool,
    pub attempts: u32,
}

impl From<GenerationResult> for GenerateResponse {
    fn from(result: GenerationResult) -> Self {
        Self {
            data_url: result.image.data_url(),
            image: result.image.data,
            mime_type: result.image.mime_type,
            elapsed_ms: result.elapsed_ms,
            persisted_id: result.persisted_id,
            cached: result.cached,
            attempts: result.attempts,
        }
    }
}

// Record handed to the persistence collaborator
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageRecord {
    pub prompt: String,
    pub image: String,
    pub mime_type: String,
    pub elapsed_ms: u64,
    pub is_favorite: bool,
}

// Queued job - holds the prompt + the channel its caller is waiting on
pub struct QueueItem {
    pub job_id: u64,
    pub prompt: String,
    pub response_tx: oneshot::Sender<Result<GenerationResult, GenerateError>>,
}
