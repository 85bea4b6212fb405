use async_trait::async_trait;

use crate::error::StoreError;
use crate::models::ImageRecord;

/// Where successful generations are handed off for long-term storage.
#[async_trait]
pub trait ImageSink: Send + Sync {
    async fn record(&self, record: ImageRecord) -> Result<(), StoreError>;
}

// Used when no persistence collaborator is configured
pub struct NullSink;

#[async_trait]
impl ImageSink for NullSink {
    async fn record(&self, _record: ImageRecord) -> Result<(), StoreError> {
        Ok(())
    }
}

pub struct HttpImageSink {
    client: reqwest::Client,
    url: String,
}

impl HttpImageSink {
    pub fn new(client: reqwest::Client, base_url: &str) -> Self {
        Self {
            client,
            url: format!("{}/api/images", base_url.trim().trim_end_matches('/')),
        }
    }
}

#[async_trait]
impl ImageSink for HttpImageSink {
    async fn record(&self, record: ImageRecord) -> Result<(), StoreError> {
        let res = self.client.post(&self.url).json(&record).send().await?;
        if !res.status().is_success() {
            return Err(StoreError::Status(res.status().as_u16()));
        }
        Ok(())
    }
}
