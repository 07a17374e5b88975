use std::sync::Arc;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use crate::errors::Result;
use crate::queue::QueueOp;
use crate::scheduler::{report_failure, Committer};
use crate::types::{AdditionalData, ItemId, MediaFile, Resource, ResourceKind, Stage};

/// Server-side record returned by the storage endpoint.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Attachment {
    pub id: u64,
    pub source_url: String,
    #[serde(default)]
    pub mime_type: String,
    #[serde(default)]
    pub media_details: MediaDetails,
    /// Usually absent right after upload, until the server's poster job runs
    #[serde(default)]
    pub poster: Option<String>,
    #[serde(default)]
    pub alt_text: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct MediaDetails {
    #[serde(default)]
    pub width: u32,
    #[serde(default)]
    pub height: u32,
}

/// Storage transport
#[async_trait]
pub trait Uploader: Send + Sync {
    /// Sends the file with its metadata and returns the stored attachment.
    async fn upload(&self, file: &MediaFile, metadata: &AdditionalData) -> Result<Attachment>;
}

/// Canonical resource for an uploaded attachment.
///
/// Fields the server left blank keep their local value, so the UI never
/// falls back to a posterless or zero-sized resource.
pub fn resource_from_attachment(attachment: &Attachment, previous: &Resource) -> Resource {
    let mime_type = if attachment.mime_type.is_empty() {
        previous.mime_type.clone()
    } else {
        attachment.mime_type.clone()
    };

    let (width, height) = match attachment.media_details {
        MediaDetails { width: 0, .. } | MediaDetails { height: 0, .. } => {
            (previous.width, previous.height)
        }
        MediaDetails { width, height } => (width, height),
    };

    Resource {
        id: previous.id,
        server_id: Some(attachment.id),
        kind: ResourceKind::from_mime_type(&mime_type),
        mime_type,
        src: attachment.source_url.clone(),
        poster: attachment.poster.clone().or_else(|| previous.poster.clone()),
        width,
        height,
        alt: attachment
            .alt_text
            .clone()
            .filter(|alt| !alt.is_empty())
            .unwrap_or_else(|| previous.alt.clone()),
        is_placeholder: false,
        is_transcoding: false,
    }
}

pub struct UploadWorker {
    uploader: Arc<dyn Uploader>,
}

impl UploadWorker {
    pub fn new(uploader: Arc<dyn Uploader>) -> Self {
        Self { uploader }
    }

    /// Uploads the item's current file. Failures cancel the item and are not retried.
    pub(crate) async fn run(&self, id: ItemId, committer: &Committer) -> Result<()> {
        let item = committer.commit(id, QueueOp::StartUploading).await?.item;
        debug!(item_id = %id, file = %item.file.name, size = item.file.size, "upload started");

        match self.uploader.upload(&item.file, &item.additional_data).await {
            Ok(attachment) => {
                let url = attachment.source_url.clone();
                committer.commit(id, QueueOp::CompleteUpload { attachment }).await?;
                info!(item_id = %id, url = %url, "upload finished");
                Ok(())
            }
            Err(err) => {
                let err = err.for_stage(Stage::Upload);
                report_failure(Stage::Upload, &item, &err);
                committer
                    .commit(id, QueueOp::CancelUploading {
                        stage: Stage::Upload,
                        error: err.to_string(),
                    })
                    .await?;
                Err(err)
            }
        }
    }
}
