use std::collections::HashMap;
use std::path::Path;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use crate::errors::Result;

/// Upload-time metadata merged into the server record.
pub type AdditionalData = HashMap<String, String>;

/// Key under which transcoding stamps the transformation that produced a file.
pub const MEDIA_SOURCE_KEY: &str = "media_source";

/// Queue item identifier, never reused within a process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct ItemId(Uuid);

impl ItemId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ItemId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ItemId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Queue item state.
///
/// ```text
/// Pending ──> Transcoding ──> Transcoded ──> Uploading ──> Uploaded
///    └──────────────────────────────────────────┘   └──> Cancelled
///                  └──> Cancelled
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ItemState {
    Pending,
    Transcoding,
    Transcoded,
    Uploading,
    Uploaded,
    Cancelled,
}

impl ItemState {
    pub fn is_terminal(self) -> bool {
        matches!(self, ItemState::Uploaded | ItemState::Cancelled)
    }

    pub fn is_valid_transition(from: ItemState, to: ItemState) -> bool {
        use ItemState::*;

        matches!(
            (from, to),
            (Pending, Transcoding)
                | (Pending, Uploading)
                | (Transcoding, Transcoded)
                | (Transcoding, Cancelled)
                | (Transcoded, Uploading)
                | (Uploading, Uploaded)
                | (Uploading, Cancelled)
        )
    }
}

impl std::fmt::Display for ItemState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ItemState::Pending => "PENDING",
            ItemState::Transcoding => "TRANSCODING",
            ItemState::Transcoded => "TRANSCODED",
            ItemState::Uploading => "UPLOADING",
            ItemState::Uploaded => "UPLOADED",
            ItemState::Cancelled => "CANCELLED",
        };
        f.write_str(name)
    }
}

/// Pipeline stage, used when reporting failures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Probe,
    Transcode,
    Upload,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Stage::Probe => "probe",
            Stage::Transcode => "transcode",
            Stage::Upload => "upload",
        };
        f.write_str(name)
    }
}

/// In-memory file payload. The bytes are shared, cloning is cheap.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct MediaFile {
    pub name: String,
    pub mime_type: String,
    pub size: u64,
    #[serde(skip)]
    pub data: Bytes,
}

impl MediaFile {
    /// An empty `mime_type` is inferred from the file extension.
    pub fn new(
        name: impl Into<String>,
        mime_type: impl Into<String>,
        data: impl Into<Bytes>,
    ) -> Self {
        let name = name.into();
        let data = data.into();
        let mut mime_type = mime_type.into();

        if mime_type.is_empty() || mime_type == "application/octet-stream" {
            if let Some(inferred) = extension_of(&name).and_then(|ext| mime_from_extension(&ext)) {
                mime_type = inferred.to_string();
            }
        }

        Self {
            name,
            mime_type,
            size: data.len() as u64,
            data,
        }
    }

    pub async fn from_path(path: &Path) -> Result<Self> {
        let data = tokio::fs::read(path).await?;
        let name = path
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_else(|| "upload".to_string());

        Ok(Self::new(name, "", data))
    }

    pub fn extension(&self) -> Option<String> {
        extension_of(&self.name)
    }

    pub fn stem(&self) -> &str {
        match self.name.rsplit_once('.') {
            Some((stem, _)) if !stem.is_empty() => stem,
            _ => &self.name,
        }
    }

    pub fn is_video(&self) -> bool {
        self.mime_type.starts_with("video/")
    }

    pub fn is_gif(&self) -> bool {
        self.mime_type == "image/gif"
    }
}

fn extension_of(name: &str) -> Option<String> {
    name.rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .filter(|ext| !ext.is_empty())
}

pub fn mime_from_extension(ext: &str) -> Option<&'static str> {
    let mime = match ext {
        "mov" | "qt" => "video/quicktime",
        "mp4" => "video/mp4",
        "m4v" => "video/x-m4v",
        "webm" => "video/webm",
        "mkv" => "video/x-matroska",
        "avi" => "video/x-msvideo",
        "wmv" => "video/x-ms-wmv",
        "asf" => "video/x-ms-asf",
        "flv" => "video/x-flv",
        "3gp" => "video/3gpp",
        "3g2" => "video/3gpp2",
        "ts" => "video/mp2t",
        "ogv" => "video/ogg",
        "mpeg" | "mpg" => "video/mpeg",
        "gif" => "image/gif",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "webp" => "image/webp",
        _ => return None,
    };

    Some(mime)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    Image,
    Gif,
    Video,
}

impl ResourceKind {
    pub fn from_mime_type(mime_type: &str) -> Self {
        if mime_type == "image/gif" {
            ResourceKind::Gif
        } else if mime_type.starts_with("video/") {
            ResourceKind::Video
        } else {
            ResourceKind::Image
        }
    }
}

/// Renderable description of a queued media item.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Resource {
    /// Stamped with the owning item's id on enqueue
    pub id: Option<ItemId>,
    /// Attachment id assigned by the server once uploaded
    pub server_id: Option<u64>,
    pub kind: ResourceKind,
    pub mime_type: String,
    pub src: String,
    pub poster: Option<String>,
    pub width: u32,
    pub height: u32,
    pub alt: String,
    pub is_placeholder: bool,
    /// Cosmetic, set while the item is transcoding
    pub is_transcoding: bool,
}

impl Resource {
    /// Provisional resource for a file nobody has looked inside yet.
    pub fn placeholder(file: &MediaFile, src: impl Into<String>) -> Self {
        Self {
            id: None,
            server_id: None,
            kind: ResourceKind::from_mime_type(&file.mime_type),
            mime_type: file.mime_type.clone(),
            src: src.into(),
            poster: None,
            width: 0,
            height: 0,
            alt: file.stem().to_string(),
            is_placeholder: true,
            is_transcoding: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueItem {
    pub id: ItemId,
    pub file: MediaFile,
    pub state: ItemState,
    pub resource: Resource,
    pub additional_data: AdditionalData,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl QueueItem {
    pub fn new(file: MediaFile, mut resource: Resource, additional_data: AdditionalData) -> Self {
        let id = ItemId::new();
        resource.id = Some(id);

        Self {
            id,
            file,
            state: ItemState::Pending,
            resource,
            additional_data,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            error: None,
        }
    }
}

// Items are cloned into spawned pipelines
const _: () = {
    fn assert_send<T: Send + Sync>() {}
    #[allow(dead_code)]
    fn assert_types() {
        assert_send::<QueueItem>();
        assert_send::<MediaFile>();
        assert_send::<Resource>();
    }
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_item_state_transition() {
        use ItemState::*;

        // valid
        assert!(ItemState::is_valid_transition(Pending, Transcoding));
        assert!(ItemState::is_valid_transition(Pending, Uploading));
        assert!(ItemState::is_valid_transition(Transcoding, Transcoded));
        assert!(ItemState::is_valid_transition(Transcoding, Cancelled));
        assert!(ItemState::is_valid_transition(Transcoded, Uploading));
        assert!(ItemState::is_valid_transition(Uploading, Uploaded));
        assert!(ItemState::is_valid_transition(Uploading, Cancelled));

        // invalid
        assert!(!ItemState::is_valid_transition(Pending, Uploaded));
        assert!(!ItemState::is_valid_transition(Transcoded, Uploaded));
        assert!(!ItemState::is_valid_transition(Pending, Cancelled));
        assert!(!ItemState::is_valid_transition(Uploaded, Uploading));
        assert!(!ItemState::is_valid_transition(Cancelled, Pending));
        assert!(!ItemState::is_valid_transition(Transcoded, Transcoding));
    }

    #[test]
    fn test_terminal_states() {
        let terminal: Vec<_> = [
            ItemState::Pending,
            ItemState::Transcoding,
            ItemState::Transcoded,
            ItemState::Uploading,
            ItemState::Uploaded,
            ItemState::Cancelled,
        ]
        .into_iter()
        .filter(|state| state.is_terminal())
        .collect();

        assert_eq!(terminal, vec![ItemState::Uploaded, ItemState::Cancelled]);
    }

    #[test]
    fn test_item_id_generation() {
        let id1 = ItemId::new();
        let id2 = ItemId::new();

        assert_ne!(id1, id2);
        assert_eq!(id1, id1);
        assert!(!id1.to_string().is_empty());
    }

    #[test]
    fn test_mime_type_inferred_from_extension() {
        let file = MediaFile::new("Clip.MOV", "", vec![0u8; 4]);
        assert_eq!(file.mime_type, "video/quicktime");
        assert!(file.is_video());
        assert_eq!(file.size, 4);
        assert_eq!(file.stem(), "Clip");

        let declared = MediaFile::new("photo.bin", "image/png", vec![1u8]);
        assert_eq!(declared.mime_type, "image/png");

        let unknown = MediaFile::new("notes", "", Vec::new());
        assert_eq!(unknown.mime_type, "");
        assert_eq!(unknown.extension(), None);
    }

    #[test]
    fn test_new_item_stamps_resource_id() {
        let file = MediaFile::new("a.png", "image/png", vec![0u8; 8]);
        let resource = Resource::placeholder(&file, "blob:a");
        let item = QueueItem::new(file, resource, AdditionalData::new());

        assert_eq!(item.state, ItemState::Pending);
        assert_eq!(item.resource.id, Some(item.id));
        assert!(item.resource.is_placeholder);
        assert_eq!(item.resource.kind, ResourceKind::Image);
        assert!(item.started_at.is_none());
    }
}
