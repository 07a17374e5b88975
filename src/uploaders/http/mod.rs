use std::time::Duration;
use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use reqwest::header::{HeaderName, HeaderValue, AUTHORIZATION, CONTENT_DISPOSITION, CONTENT_TYPE};
use reqwest::Client;
use tracing::debug;
use url::Url;
use crate::config::UploadConfig;
use crate::errors::{MediaQueueError, Result};
use crate::types::{AdditionalData, MediaFile};
use crate::upload::{Attachment, Uploader};

const META_HEADER_PREFIX: &str = "x-media-meta-";

/// Single-request HTTP uploader. The body is the raw file; metadata travels in
/// `X-Media-Meta-*` headers with base64 values.
pub struct HttpUploader {
    client: Client,
    endpoint: Url,
    token: Option<String>,
}

impl HttpUploader {
    pub fn new(config: &UploadConfig) -> Result<Self> {
        let endpoint = Url::parse(&config.endpoint).map_err(|err| {
            MediaQueueError::ConfigError(format!("Invalid upload endpoint: {}", err))
        })?;

        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            client,
            endpoint,
            token: config.token.clone(),
        })
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }
}

fn content_disposition(name: &str) -> HeaderValue {
    let filename: String = name
        .chars()
        .map(|c| match c {
            '"' | '\\' => '_',
            c if c == ' ' || c.is_ascii_graphic() => c,
            _ => '_',
        })
        .collect();

    HeaderValue::from_str(&format!("attachment; filename=\"{}\"", filename))
        .unwrap_or_else(|_| HeaderValue::from_static("attachment"))
}

fn meta_header(key: &str) -> Result<HeaderName> {
    HeaderName::from_bytes(format!("{}{}", META_HEADER_PREFIX, key.to_ascii_lowercase()).as_bytes())
        .map_err(|_| {
            MediaQueueError::upload(format!("metadata key '{}' is not a valid header name", key))
        })
}

#[async_trait]
impl Uploader for HttpUploader {
    async fn upload(&self, file: &MediaFile, metadata: &AdditionalData) -> Result<Attachment> {
        let mut request = self
            .client
            .post(self.endpoint.clone())
            .header(CONTENT_DISPOSITION, content_disposition(&file.name))
            .body(file.data.clone());

        if !file.mime_type.is_empty() {
            request = request.header(CONTENT_TYPE, &file.mime_type);
        }

        if let Some(token) = &self.token {
            request = request.header(AUTHORIZATION, format!("Bearer {}", token));
        }

        for (key, value) in metadata {
            request = request.header(meta_header(key)?, STANDARD.encode(value));
        }

        debug!(endpoint = %self.endpoint, file = %file.name, size = file.size, "sending upload");
        let response = request.send().await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = if body.is_empty() {
                format!("Upload failed with status {}", status)
            } else {
                body
            };
            return Err(MediaQueueError::server_error(status.as_u16(), message));
        }

        Ok(response.json::<Attachment>().await?)
    }
}
