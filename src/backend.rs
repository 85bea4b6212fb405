use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;

use crate::error::BackendError;
use crate::models::BackendImage;

const DEFAULT_FAILURE: &str = "Failed to generate image";
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_PROBE_PATH: &str = "/";

/// The opaque image-generation call the orchestrator drives.
#[async_trait]
pub trait ImageBackend: Send + Sync {
    async fn generate(&self, prompt: &str) -> Result<BackendImage, BackendError>;

    /// Cheap reachability check used by the connectivity monitor.
    async fn probe(&self) -> bool {
        true
    }
}

#[derive(Deserialize)]
struct ErrorBody {
    error: Option<String>,
}

pub struct HttpBackend {
    client: reqwest::Client,
    url: String,
    probe_path: String,
}

impl HttpBackend {
    pub fn new(client: reqwest::Client, url: &str) -> Self {
        // add http:// if not present
        let url = url.trim().trim_end_matches('/');
        let url = if url.starts_with("http") {
            url.to_string()
        } else {
            format!("http://{}", url)
        };
        Self {
            client,
            url,
            probe_path: DEFAULT_PROBE_PATH.to_string(),
        }
    }

    pub fn with_probe_path(mut self, path: &str) -> Self {
        let path = path.trim();
        self.probe_path = if path.starts_with('/') {
            path.to_string()
        } else {
            format!("/{}", path)
        };
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl ImageBackend for HttpBackend {
    async fn generate(&self, prompt: &str) -> Result<BackendImage, BackendError> {
        let res = self
            .client
            .post(format!("{}/api/generate", self.url))
            .json(&serde_json::json!({ "prompt": prompt }))
            .send()
            .await?;

        let status = res.status();
        let body = res.bytes().await?;

        if !status.is_success() {
            let message = serde_json::from_slice::<ErrorBody>(&body)
                .ok()
                .and_then(|b| b.error)
                .unwrap_or_else(|| DEFAULT_FAILURE.to_string());
            return Err(BackendError::Http {
                status: status.as_u16(),
                message,
            });
        }

        // a 2xx can still carry {"error": ...}
        if let Ok(ErrorBody { error: Some(message) }) = serde_json::from_slice::<ErrorBody>(&body) {
            return Err(BackendError::Http {
                status: status.as_u16(),
                message,
            });
        }

        serde_json::from_slice::<BackendImage>(&body)
            .map_err(|e| BackendError::InvalidResponse(format!("Parse Error: {}", e)))
    }

    // any HTTP answer, even a 404 or 503, means the network path is up
    async fn probe(&self) -> bool {
        self.client
            .get(format!("{}{}", self.url, self.probe_path))
            .timeout(PROBE_TIMEOUT)
            .send()
            .await
            .is_ok()
    }
}
